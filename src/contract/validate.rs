//! Exchange Validation
//!
//! Checks synthesized requests and the responses they provoke against the
//! contract. Response validation is the fuzzer's oracle: a failure here is
//! a finding, not an engineering error.

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::{Contract, HttpMethod, Operation, ParameterLocation, ResponseSpec, RouteMatch};
use super::schema::{SchemaKind, SchemaNode, SchemaSet};
use crate::request::RequestRecord;

/// Every way an exchange deviated from the contract
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{}", .issues.join("; "))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

impl ValidationError {
    pub fn single(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }

    fn from_issues(issues: Vec<String>) -> Option<Self> {
        if issues.is_empty() {
            None
        } else {
            Some(Self { issues })
        }
    }
}

/// Per-request data needed to check the paired response. Owned, so a
/// context can never observe a later request.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationContext {
    pub method: HttpMethod,
    pub template: String,
    pub path_params: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    /// Header names lower-cased
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ValidationContext {
    fn from_request(route: &RouteMatch, request: &RequestRecord) -> Self {
        Self {
            method: route.method,
            template: route.template.clone(),
            path_params: request.path_params.clone(),
            query: request.query.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect(),
            cookies: request.cookies.iter().cloned().collect(),
            content_type: request.content_type.clone(),
            body: request.body.clone(),
        }
    }

    fn parameter(&self, location: ParameterLocation, name: &str) -> Option<&str> {
        match location {
            ParameterLocation::Path => self.path_params.get(name).map(String::as_str),
            ParameterLocation::Query => self
                .query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            ParameterLocation::Header => self
                .headers
                .get(&name.to_ascii_lowercase())
                .map(String::as_str),
            ParameterLocation::Cookie => self.cookies.get(name).map(String::as_str),
        }
    }
}

/// Contract oracle for requests and responses
pub trait ExchangeValidator: Send + Sync {
    /// Build the context for a request. Findings are reported, never fatal.
    fn validate_request(
        &self,
        route: &RouteMatch,
        request: &RequestRecord,
    ) -> (ValidationContext, Option<ValidationError>);

    /// Decide whether a response conforms. Must be deterministic.
    fn validate_response(
        &self,
        context: &ValidationContext,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), ValidationError>;
}

/// JSON-Schema-backed validator over a loaded contract
pub struct SchemaValidator {
    contract: Arc<Contract>,
}

impl SchemaValidator {
    pub fn new(contract: Arc<Contract>) -> Self {
        Self { contract }
    }

    fn operation(&self, method: HttpMethod, template: &str) -> Result<&Operation, ValidationError> {
        self.contract.operation(template, method).ok_or_else(|| {
            ValidationError::single(format!("operation {} {} is not declared", method, template))
        })
    }
}

impl ExchangeValidator for SchemaValidator {
    fn validate_request(
        &self,
        route: &RouteMatch,
        request: &RequestRecord,
    ) -> (ValidationContext, Option<ValidationError>) {
        let context = ValidationContext::from_request(route, request);
        let operation = match self.operation(route.method, &route.template) {
            Ok(op) => op,
            Err(e) => return (context, Some(e)),
        };

        let schemas = self.contract.schemas();
        let mut issues = Vec::new();

        for param in &operation.parameters {
            let Some(location) = param.location() else {
                continue;
            };
            match context.parameter(location, &param.name) {
                None if param.required => issues.push(format!(
                    "missing required {} parameter '{}'",
                    param.location, param.name
                )),
                None => {}
                Some(raw) => {
                    if let Some(schema) = param.effective_schema() {
                        let value = coerce(raw, schema, &schemas);
                        check_schema(
                            &schemas,
                            schema,
                            &value,
                            &format!("{} parameter '{}'", param.location, param.name),
                            &mut issues,
                        );
                    }
                }
            }
        }

        if let Some(body_spec) = &operation.request_body {
            if context.body.is_empty() {
                if body_spec.required {
                    issues.push("missing required request body".to_string());
                }
            } else if let Some(media) = find_media(&body_spec.content, &context.content_type) {
                if let (Some(schema), true) = (&media.schema, is_json(&context.content_type)) {
                    match serde_json::from_slice::<Value>(&context.body) {
                        Ok(value) => {
                            check_schema(&schemas, schema, &value, "request body", &mut issues)
                        }
                        Err(e) => issues.push(format!("request body is not valid JSON: {}", e)),
                    }
                }
            } else {
                issues.push(format!(
                    "request Content-Type '{}' is not declared",
                    context.content_type
                ));
            }
        }

        (context, ValidationError::from_issues(issues))
    }

    fn validate_response(
        &self,
        context: &ValidationContext,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), ValidationError> {
        let operation = self.operation(context.method, &context.template)?;
        let spec = select_response(&operation.responses, status).ok_or_else(|| {
            ValidationError::single(format!(
                "status {} is not declared for {} {}",
                status, context.method, context.template
            ))
        })?;

        let schemas = self.contract.schemas();
        let mut issues = Vec::new();

        for (name, header) in &spec.headers {
            if header.required && !headers.contains_key(name.as_str()) {
                issues.push(format!("missing required response header '{}'", name));
            }
        }

        if !spec.content.is_empty() && !body.is_empty() {
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(media_essence);

            match content_type {
                None => issues.push("response has a body but no Content-Type".to_string()),
                Some(content_type) => match find_media(&spec.content, &content_type) {
                    None => issues.push(format!(
                        "response Content-Type '{}' is not declared",
                        content_type
                    )),
                    Some(media) => {
                        if let (Some(schema), true) = (&media.schema, is_json(&content_type)) {
                            match serde_json::from_slice::<Value>(body) {
                                Ok(value) => check_schema(
                                    &schemas,
                                    schema,
                                    &value,
                                    "response body",
                                    &mut issues,
                                ),
                                Err(e) => {
                                    issues.push(format!("response body is not valid JSON: {}", e))
                                }
                            }
                        }
                    }
                },
            }
        }

        match ValidationError::from_issues(issues) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Exact status, then `4XX` style range, then `default`
fn select_response(responses: &BTreeMap<String, ResponseSpec>, status: u16) -> Option<&ResponseSpec> {
    let exact = status.to_string();
    let range = format!("{}XX", status / 100);
    responses
        .get(&exact)
        .or_else(|| {
            responses
                .iter()
                .find(|(code, _)| code.eq_ignore_ascii_case(&range))
                .map(|(_, spec)| spec)
        })
        .or_else(|| responses.get("default"))
}

/// Declared media type matching `content_type`, honoring wildcards
fn find_media<'a, M>(content: &'a BTreeMap<String, M>, content_type: &str) -> Option<&'a M> {
    let content_type = media_essence(content_type);
    if let Some(media) = content
        .iter()
        .find(|(declared, _)| media_essence(declared) == content_type)
    {
        return Some(media.1);
    }
    let major = content_type.split('/').next().unwrap_or_default();
    content
        .iter()
        .find(|(declared, _)| {
            let declared = media_essence(declared);
            declared == "*/*" || declared == format!("{}/*", major)
        })
        .map(|(_, media)| media)
}

/// `application/json; charset=utf-8` -> `application/json`
fn media_essence(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json(content_type: &str) -> bool {
    let essence = media_essence(content_type);
    essence == "application/json" || essence.ends_with("+json")
}

/// Interpret a rendered parameter value the way its schema expects
fn coerce(raw: &str, schema: &SchemaNode, schemas: &SchemaSet) -> Value {
    let schema = schemas.resolve(schema).unwrap_or(schema);
    match schema.kind() {
        Some(SchemaKind::Integer) => raw
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<u64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        Some(SchemaKind::Number) => {
            if let Ok(i) = raw.parse::<i64>() {
                return Value::from(i);
            }
            raw.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string()))
        }
        Some(SchemaKind::Boolean) => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        Some(SchemaKind::Array) => {
            if raw.is_empty() {
                return Value::Array(Vec::new());
            }
            let items = schema.items.as_deref();
            Value::Array(
                raw.split(',')
                    .map(|part| match items {
                        Some(item_schema) => coerce(part, item_schema, schemas),
                        None => Value::String(part.to_string()),
                    })
                    .collect(),
            )
        }
        Some(SchemaKind::Object) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        }
        _ => Value::String(raw.to_string()),
    }
}

fn check_schema(
    schemas: &SchemaSet,
    schema: &SchemaNode,
    instance: &Value,
    subject: &str,
    issues: &mut Vec<String>,
) {
    let compiled = schemas.to_json_schema(schema);
    match jsonschema::validator_for(&compiled) {
        Ok(validator) => {
            for error in validator.iter_errors(instance) {
                issues.push(format!("{}: {}", subject, error));
            }
        }
        Err(e) => debug!(subject, error = %e, "schema could not be compiled, skipping check"),
    }
}
