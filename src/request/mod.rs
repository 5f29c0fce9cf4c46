//! Request Synthesis
//!
//! Builds one complete HTTP request per contract operation: generated
//! parameters, a generated body, injected credentials and session
//! cookies, plus the validation context needed to judge the response.
//!
//! A synthesized request is consumed exactly once. Nothing here is cached
//! between cycles; every call draws fresh values.

pub mod params;
pub mod payload;
pub mod security;

pub use params::{collect, ParameterBuckets};
pub use payload::{build, Payload, PayloadError, DEFAULT_CONTENT_TYPE};
pub use security::{inject, Credentials};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::auth::SessionCookie;
use crate::contract::{
    join_paths, Contract, ExchangeValidator, HttpMethod, Operation, RouteError, RouteResolver,
    ValidationContext, ValidationError,
};
use crate::generate::ValueGenerator;

/// Per-operation construction failures. The operation is skipped for the
/// current cycle; the cycle itself continues.
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Invalid request URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Route not resolvable: {0}")]
    Route(#[from] RouteError),
}

/// Owned snapshot of what was put on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub method: HttpMethod,
    pub url: String,
    /// Path after placeholder substitution, base path included
    pub path: String,
    /// Path template as declared in the contract
    pub template: String,
    pub path_params: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    /// Every header except `Cookie`
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// A ready-to-send request and everything needed to classify its response
#[derive(Debug)]
pub struct SynthesizedRequest {
    pub request: reqwest::Request,
    pub record: RequestRecord,
    pub context: ValidationContext,
    /// Request-side contract deviations; informational only
    pub request_error: Option<ValidationError>,
}

/// Turns contract operations into concrete requests against one target
pub struct RequestSynthesizer {
    contract: Arc<Contract>,
    resolver: Arc<dyn RouteResolver>,
    validator: Arc<dyn ExchangeValidator>,
    base_path: String,
    target: String,
    credentials: Credentials,
}

impl RequestSynthesizer {
    pub fn new(
        contract: Arc<Contract>,
        resolver: Arc<dyn RouteResolver>,
        validator: Arc<dyn ExchangeValidator>,
        target: &str,
        credentials: Credentials,
    ) -> Self {
        let base_path = contract.base_path();
        Self {
            contract,
            resolver,
            validator,
            base_path,
            target: normalize_target_url(target),
            credentials,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Synthesize one request for `(template, method)`
    pub fn synthesize(
        &self,
        template: &str,
        method: HttpMethod,
        operation: &Operation,
        generator: &mut ValueGenerator,
        session_cookies: &[SessionCookie],
    ) -> Result<SynthesizedRequest, SynthesisError> {
        let mut buckets = params::collect(operation, generator);
        let payload = payload::build(operation, generator);
        security::inject(
            self.contract.effective_security(operation),
            &self.contract.components.security_schemes,
            &mut buckets,
            &self.credentials,
        );

        let path = substitute_path(&join_paths(&self.base_path, template), &buckets.path);
        let raw_url = format!("{}{}", self.target, path);
        let mut url = Url::parse(&raw_url).map_err(|e| SynthesisError::InvalidUrl {
            url: raw_url.clone(),
            reason: e.to_string(),
        })?;
        if !buckets.query.is_empty() {
            url.query_pairs_mut().extend_pairs(buckets.query.iter());
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, header_value("accept", &payload.content_type)?);
        for (name, value) in &buckets.header {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| SynthesisError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            headers.insert(header_name, header_value(name, value)?);
        }
        if payload.has_body() {
            headers.insert(CONTENT_TYPE, header_value("content-type", &payload.content_type)?);
        }

        let cookies: Vec<(String, String)> = buckets
            .cookie
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(session_cookies.iter().map(|c| (c.name.clone(), c.value.clone())))
            .collect();

        let record = RequestRecord {
            method,
            url: url.to_string(),
            path,
            template: template.to_string(),
            path_params: buckets.path.clone(),
            query: buckets.query.clone(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect(),
            cookies,
            content_type: payload.content_type.clone(),
            body: payload.body,
        };

        // Generated values are escaped; session cookies go back as the target set them
        let wire_cookies: Vec<String> = buckets
            .cookie
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .chain(session_cookies.iter().map(|c| format!("{}={}", c.name, c.value)))
            .collect();
        if !wire_cookies.is_empty() {
            headers.insert(COOKIE, header_value("cookie", &wire_cookies.join("; "))?);
        }

        let mut request = reqwest::Request::new(method.to_reqwest(), url);
        *request.headers_mut() = headers;
        if !record.body.is_empty() {
            *request.body_mut() = Some(record.body.clone().into());
        }

        let route = self.resolver.find_route(method, &record.path)?;
        let (context, request_error) = self.validator.validate_request(&route, &record);
        if let Some(e) = &request_error {
            debug!(method = %method, path = %template, error = %e, "request deviates from contract, sending anyway");
        }

        Ok(SynthesizedRequest {
            request,
            record,
            context,
            request_error,
        })
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, SynthesisError> {
    HeaderValue::from_str(value).map_err(|e| SynthesisError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Trim trailing slashes and default to `http://` when no scheme is given
pub fn normalize_target_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Replace each `{name}` in `template` with the percent-encoded value for
/// `name`, walking the template once. Unknown placeholders stay as written.
pub fn substitute_path(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        match values.get(name) {
            Some(value) => out.push_str(&urlencoding::encode(value)),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
