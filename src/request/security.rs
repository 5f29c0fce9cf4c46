//! Security parameter injection
//!
//! Places caller credentials where the operation's security requirements
//! ask for them. A missing credential never blocks a request; it is simply
//! sent without that scheme applied.

use base64::Engine;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::params::ParameterBuckets;
use crate::contract::{SecurityRequirement, SecurityScheme};

/// Caller-supplied credentials. Empty strings count as absent.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub token: Option<String>,
}

impl Credentials {
    pub fn basic(&self) -> Option<(&str, &str)> {
        match (present(&self.username), present(&self.password)) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        present(&self.api_key)
    }

    pub fn token(&self) -> Option<&str> {
        present(&self.token)
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn mask(value: &Option<String>) -> &'static str {
            if present(value).is_some() {
                "[REDACTED]"
            } else {
                "None"
            }
        }
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .field("api_key", &mask(&self.api_key))
            .field("token", &mask(&self.token))
            .finish()
    }
}

/// Apply every referenced scheme of `requirements` to `buckets`
pub fn inject(
    requirements: &[SecurityRequirement],
    schemes: &BTreeMap<String, SecurityScheme>,
    buckets: &mut ParameterBuckets,
    credentials: &Credentials,
) {
    for scheme_name in requirements.iter().flat_map(|req| req.keys()) {
        let Some(scheme) = schemes.get(scheme_name) else {
            debug!(scheme = %scheme_name, "security requirement references an undeclared scheme");
            continue;
        };

        match scheme.scheme_type.as_str() {
            "apiKey" => {
                let (Some(key), Some(name)) = (credentials.api_key(), scheme.name.as_deref()) else {
                    continue;
                };
                match scheme.location.as_deref() {
                    Some("query") => buckets.set_query(name, key),
                    Some("header") => buckets.set_header(name, key),
                    Some("cookie") => {
                        buckets.cookie.insert(name.to_string(), key.to_string());
                    }
                    other => debug!(scheme = %scheme_name, location = ?other, "unsupported apiKey location"),
                }
            }
            "http" => {
                let sub_scheme = scheme.scheme.as_deref().unwrap_or_default();
                if sub_scheme.eq_ignore_ascii_case("basic") {
                    if let Some((user, pass)) = credentials.basic() {
                        let encoded = base64::engine::general_purpose::STANDARD
                            .encode(format!("{}:{}", user, pass));
                        buckets.set_header("Authorization", format!("Basic {}", encoded));
                    }
                } else if sub_scheme.eq_ignore_ascii_case("bearer") {
                    set_bearer(buckets, credentials);
                } else {
                    debug!(scheme = %scheme_name, sub_scheme, "unsupported http auth scheme");
                }
            }
            "oauth2" => set_bearer(buckets, credentials),
            other => debug!(scheme = %scheme_name, kind = other, "unsupported security scheme type"),
        }
    }
}

fn set_bearer(buckets: &mut ParameterBuckets, credentials: &Credentials) {
    if let Some(token) = credentials.token() {
        buckets.set_header("Authorization", format!("Bearer {}", token));
    }
}
