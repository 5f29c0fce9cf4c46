//! API Contract
//!
//! Loads an OpenAPI 3.x document, inlines local `$ref` pointers and exposes
//! typed paths, operations, parameters and security schemes. Route
//! resolution and exchange validation live in [`router`] and [`validate`].

pub mod router;
pub mod schema;
pub mod validate;

pub use router::{RouteError, RouteMatch, RouteResolver, Router};
pub use schema::{SchemaKind, SchemaNode, SchemaSet, TypeField};
pub use validate::{ExchangeValidator, SchemaValidator, ValidationContext, ValidationError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while loading a contract. All of them are fatal.
#[derive(Error, Debug)]
pub enum ContractError {
    #[error("Failed to read contract file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse contract: {0}")]
    Parse(String),

    #[error("Invalid contract structure: {0}")]
    Structure(#[from] serde_json::Error),

    #[error("Unsupported contract version: {0}")]
    UnsupportedVersion(String),

    #[error("Contract declares no operations")]
    NoOperations,
}

pub type Result<T> = std::result::Result<T, ContractError>;

/// Nested `$ref` expansions allowed before a branch is cut off
const MAX_REF_DEPTH: usize = 32;

/// HTTP methods an OpenAPI path item can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Put,
    Post,
    Delete,
    Options,
    Head,
    Patch,
    Trace,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 8] = [
        HttpMethod::Get,
        HttpMethod::Put,
        HttpMethod::Post,
        HttpMethod::Delete,
        HttpMethod::Options,
        HttpMethod::Head,
        HttpMethod::Patch,
        HttpMethod::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Head => "HEAD",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Trace => "TRACE",
        }
    }

    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Trace => reqwest::Method::TRACE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root of an OpenAPI document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub openapi: String,

    #[serde(default)]
    pub servers: Vec<Server>,

    #[serde(default)]
    pub paths: BTreeMap<String, Option<PathItem>>,

    #[serde(default)]
    pub components: Components,

    /// Document-wide security requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Vec<SecurityRequirement>>,

    /// Shared targets of the component references left in schema nodes
    #[serde(skip)]
    schema_set: Arc<SchemaSet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
    #[serde(default)]
    pub variables: BTreeMap<String, ServerVariable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerVariable {
    pub default: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Components {
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaNode>,

    #[serde(default)]
    pub security_schemes: BTreeMap<String, SecurityScheme>,
}

/// Security scheme declared under `components.securitySchemes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityScheme {
    #[serde(rename = "type")]
    pub scheme_type: String,
    /// Parameter name for `apiKey`
    #[serde(default)]
    pub name: Option<String>,
    /// Parameter location for `apiKey`
    #[serde(rename = "in", default)]
    pub location: Option<String>,
    /// Sub-scheme for `http` (`basic`, `bearer`)
    #[serde(default)]
    pub scheme: Option<String>,
}

/// Scheme name to required scopes
pub type SecurityRequirement = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathItem {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub get: Option<Operation>,
    pub put: Option<Operation>,
    pub post: Option<Operation>,
    pub delete: Option<Operation>,
    pub options: Option<Operation>,
    pub head: Option<Operation>,
    pub patch: Option<Operation>,
    pub trace: Option<Operation>,
}

impl PathItem {
    pub fn operation(&self, method: HttpMethod) -> Option<&Operation> {
        match method {
            HttpMethod::Get => self.get.as_ref(),
            HttpMethod::Put => self.put.as_ref(),
            HttpMethod::Post => self.post.as_ref(),
            HttpMethod::Delete => self.delete.as_ref(),
            HttpMethod::Options => self.options.as_ref(),
            HttpMethod::Head => self.head.as_ref(),
            HttpMethod::Patch => self.patch.as_ref(),
            HttpMethod::Trace => self.trace.as_ref(),
        }
    }

    fn operation_mut(&mut self, method: HttpMethod) -> Option<&mut Operation> {
        match method {
            HttpMethod::Get => self.get.as_mut(),
            HttpMethod::Put => self.put.as_mut(),
            HttpMethod::Post => self.post.as_mut(),
            HttpMethod::Delete => self.delete.as_mut(),
            HttpMethod::Options => self.options.as_mut(),
            HttpMethod::Head => self.head.as_mut(),
            HttpMethod::Patch => self.patch.as_mut(),
            HttpMethod::Trace => self.trace.as_mut(),
        }
    }

    /// Declared operations in canonical method order
    pub fn operations(&self) -> impl Iterator<Item = (HttpMethod, &Operation)> {
        HttpMethod::ALL
            .into_iter()
            .filter_map(move |method| self.operation(method).map(|op| (method, op)))
    }
}

/// One (method, path template) entry
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub operation_id: Option<String>,

    #[serde(default)]
    pub parameters: Vec<Parameter>,

    #[serde(default)]
    pub request_body: Option<RequestBody>,

    #[serde(default)]
    pub responses: BTreeMap<String, ResponseSpec>,

    /// `None` inherits the document security; `Some(vec![])` disables it
    #[serde(default)]
    pub security: Option<Vec<SecurityRequirement>>,
}

/// Where a parameter is placed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParameterLocation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "path" => Some(ParameterLocation::Path),
            "query" => Some(ParameterLocation::Query),
            "header" => Some(ParameterLocation::Header),
            "cookie" => Some(ParameterLocation::Cookie),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub schema: Option<SchemaNode>,
    #[serde(default)]
    pub content: BTreeMap<String, MediaType>,
}

impl Parameter {
    pub fn location(&self) -> Option<ParameterLocation> {
        ParameterLocation::parse(&self.location)
    }

    /// Schema to generate from: `schema`, else the first `content` entry's
    pub fn effective_schema(&self) -> Option<&SchemaNode> {
        self.schema
            .as_ref()
            .or_else(|| self.content.values().find_map(|media| media.schema.as_ref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestBody {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub content: BTreeMap<String, MediaType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaType {
    #[serde(default)]
    pub schema: Option<SchemaNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseSpec {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderSpec>,
    #[serde(default)]
    pub content: BTreeMap<String, MediaType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeaderSpec {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub schema: Option<SchemaNode>,
}

impl Contract {
    /// Load and structurally validate a contract file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let yaml_hint = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        Self::parse(&raw, yaml_hint)
    }

    /// Parse a contract from text. JSON is tried first unless `yaml_hint` is set.
    pub fn parse(raw: &str, yaml_hint: bool) -> Result<Self> {
        let document: Value = if yaml_hint {
            parse_yaml(raw).map_err(|e| ContractError::Parse(e.to_string()))?
        } else {
            match serde_json::from_str(raw) {
                Ok(value) => value,
                Err(json_err) => parse_yaml(raw).map_err(|yaml_err| {
                    ContractError::Parse(format!("not JSON ({json_err}) nor YAML ({yaml_err})"))
                })?,
            }
        };
        Self::from_document(document)
    }

    /// Build a contract from an already-parsed document
    pub fn from_document(document: Value) -> Result<Self> {
        let resolved = resolve_refs(&document, &document, &mut Vec::new());
        let mut contract: Contract = serde_json::from_value(resolved)?;

        if !contract.openapi.starts_with("3.") {
            return Err(ContractError::UnsupportedVersion(contract.openapi));
        }
        contract.merge_path_parameters();
        if contract.operation_count() == 0 {
            return Err(ContractError::NoOperations);
        }
        contract.schema_set = Arc::new(SchemaSet::new(contract.components.schemas.clone()));

        debug!(
            paths = contract.paths.len(),
            operations = contract.operation_count(),
            schemas = contract.schema_set.len(),
            "contract loaded"
        );
        Ok(contract)
    }

    /// Component schemas that `$ref` nodes point into
    pub fn schemas(&self) -> Arc<SchemaSet> {
        Arc::clone(&self.schema_set)
    }

    /// Number of declared operations
    pub fn operation_count(&self) -> usize {
        self.paths
            .values()
            .flatten()
            .map(|item| item.operations().count())
            .sum()
    }

    /// Every (path, method, operation) in deterministic order
    pub fn operations(&self) -> impl Iterator<Item = (&str, HttpMethod, &Operation)> {
        self.paths.iter().flat_map(|(path, item)| {
            item.iter().flat_map(move |item| {
                item.operations()
                    .map(move |(method, op)| (path.as_str(), method, op))
            })
        })
    }

    /// Look up one operation by its path template and method
    pub fn operation(&self, path: &str, method: HttpMethod) -> Option<&Operation> {
        self.paths
            .get(path)
            .and_then(Option::as_ref)
            .and_then(|item| item.operation(method))
    }

    /// Security requirements effective for an operation
    pub fn effective_security<'a>(&'a self, operation: &'a Operation) -> &'a [SecurityRequirement] {
        operation
            .security
            .as_deref()
            .or(self.security.as_deref())
            .unwrap_or(&[])
    }

    /// Path component of the first server URL, normalized
    pub fn base_path(&self) -> String {
        let Some(server) = self.servers.first() else {
            return "/".to_string();
        };

        let mut raw = server.url.clone();
        for (name, variable) in &server.variables {
            raw = raw.replace(&format!("{{{}}}", name), &variable.default);
        }

        let path = match url::Url::parse(&raw) {
            Ok(parsed) => parsed.path().to_string(),
            Err(url::ParseError::RelativeUrlWithoutBase) => raw
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                warn!(server = %raw, error = %e, "unparseable server URL, using root path");
                "/".to_string()
            }
        };

        normalize_base_path(&path)
    }

    /// Fold path-level parameters into each operation. Operation-level
    /// parameters win on (name, location) collisions.
    fn merge_path_parameters(&mut self) {
        for item in self.paths.values_mut().flatten() {
            if item.parameters.is_empty() {
                continue;
            }
            let shared = std::mem::take(&mut item.parameters);
            for method in HttpMethod::ALL {
                if let Some(op) = item.operation_mut(method) {
                    for param in &shared {
                        let overridden = op
                            .parameters
                            .iter()
                            .any(|p| p.name == param.name && p.location == param.location);
                        if !overridden {
                            op.parameters.push(param.clone());
                        }
                    }
                }
            }
            item.parameters = shared;
        }
    }
}

/// Leading slash, no trailing slash (except root)
pub fn normalize_base_path(path: &str) -> String {
    let mut base = path.trim().to_string();
    if !base.starts_with('/') {
        base.insert(0, '/');
    }
    while base.len() > 1 && base.ends_with('/') {
        base.pop();
    }
    base
}

/// Join a base path and a path template without doubling separators
pub fn join_paths(base_path: &str, template: &str) -> String {
    if base_path == "/" || base_path.is_empty() {
        return template.to_string();
    }
    let base = base_path.trim_end_matches('/');
    let rest = template.trim_start_matches('/');
    if rest.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, rest)
    }
}

/// Inline local `$ref` pointers, except whole component schemas, which stay
/// as references into [`SchemaSet`]. References already being expanded
/// higher up the stack, external references and dangling pointers
/// become empty objects.
fn resolve_refs(node: &Value, root: &Value, stack: &mut Vec<String>) -> Value {
    match node {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                if schema::component_name(reference).is_some() {
                    return json!({ "$ref": reference });
                }
                let Some(pointer) = reference.strip_prefix('#') else {
                    warn!(reference, "external $ref is not supported, treating as empty schema");
                    return Value::Object(Map::new());
                };
                if stack.iter().any(|r| r == reference) || stack.len() >= MAX_REF_DEPTH {
                    debug!(reference, "recursive $ref cut off");
                    return Value::Object(Map::new());
                }
                let Some(target) = root.pointer(&decode_pointer(pointer)) else {
                    warn!(reference, "dangling $ref, treating as empty schema");
                    return Value::Object(Map::new());
                };
                stack.push(reference.to_string());
                let resolved = resolve_refs(target, root, stack);
                stack.pop();
                return resolved;
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), resolve_refs(v, root, stack)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_refs(item, root, stack))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn parse_yaml(raw: &str) -> std::result::Result<Value, serde_yaml::Error> {
    serde_yaml::from_str::<serde_yaml::Value>(raw).map(yaml_to_json)
}

/// YAML allows non-string mapping keys (`200:` under `responses`); JSON does not
fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64().map(Value::from).unwrap_or(Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => {
            Value::Array(items.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (yaml_key(k), yaml_to_json(v)))
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn yaml_key(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// `$ref` fragments may be percent-encoded
fn decode_pointer(pointer: &str) -> String {
    urlencoding::decode(pointer)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| pointer.to_string())
}
