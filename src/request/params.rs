//! Parameter collection
//!
//! Generates a value for every required parameter of an operation and files
//! it under its wire location. Optional parameters are never populated.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::contract::{Operation, ParameterLocation};
use crate::generate::ValueGenerator;

/// Rendered parameter values for one request, keyed by placement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBuckets {
    pub path: BTreeMap<String, String>,
    /// Ordered; a name may repeat
    pub query: Vec<(String, String)>,
    /// Keyed by lowercased name
    pub header: BTreeMap<String, String>,
    pub cookie: BTreeMap<String, String>,
}

impl ParameterBuckets {
    /// Set a query parameter, replacing every existing entry of that name
    pub fn set_query(&mut self, name: &str, value: impl Into<String>) {
        self.query.retain(|(existing, _)| existing != name);
        self.query.push((name.to_string(), value.into()));
    }

    /// Set a header, replacing any existing one whatever its casing
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.header.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
            && self.query.is_empty()
            && self.header.is_empty()
            && self.cookie.is_empty()
    }
}

/// Fill fresh buckets for `operation`
pub fn collect(operation: &Operation, generator: &mut ValueGenerator) -> ParameterBuckets {
    let mut buckets = ParameterBuckets::default();

    for param in operation.parameters.iter().filter(|p| p.required) {
        let Some(location) = param.location() else {
            warn!(
                parameter = %param.name,
                location = %param.location,
                "unrecognized parameter location, skipping"
            );
            continue;
        };

        let value = match param.effective_schema() {
            Some(schema) => generator.generate(schema).render(),
            None => {
                debug!(parameter = %param.name, "parameter declares no schema, sending empty value");
                String::new()
            }
        };

        match location {
            ParameterLocation::Path => {
                buckets.path.insert(param.name.clone(), value);
            }
            ParameterLocation::Query => buckets.query.push((param.name.clone(), value)),
            ParameterLocation::Header => buckets.set_header(&param.name, value),
            ParameterLocation::Cookie => {
                buckets.cookie.insert(param.name.clone(), value);
            }
        }
    }

    buckets
}
