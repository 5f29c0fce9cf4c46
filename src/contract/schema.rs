//! Contract Schema Nodes
//!
//! Typed view of one OpenAPI schema object, plus conversion to a JSON
//! Schema document the validator can compile.
//!
//! References to `#/components/schemas/<name>` stay unresolved on the node.
//! The named targets live once in a [`SchemaSet`] and are followed on
//! demand, so mutually referencing components cost nothing at load time.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Pointer prefix of the references kept unresolved
pub const COMPONENT_SCHEMA_PREFIX: &str = "#/components/schemas/";

/// `$ref`-only aliases followed before giving up on a chain
const MAX_ALIAS_HOPS: usize = 16;

/// Value kinds a schema node can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl SchemaKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(SchemaKind::String),
            "number" => Some(SchemaKind::Number),
            "integer" => Some(SchemaKind::Integer),
            "boolean" => Some(SchemaKind::Boolean),
            "array" => Some(SchemaKind::Array),
            "object" => Some(SchemaKind::Object),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchemaKind::String => "string",
            SchemaKind::Number => "number",
            SchemaKind::Integer => "integer",
            SchemaKind::Boolean => "boolean",
            SchemaKind::Array => "array",
            SchemaKind::Object => "object",
        }
    }
}

/// The `type` keyword: a single name (3.0) or a list of names (3.1)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TypeField {
    Single(String),
    Multiple(Vec<String>),
}

impl TypeField {
    /// First declared type name that is not `null`
    pub fn primary(&self) -> Option<&str> {
        match self {
            TypeField::Single(name) => Some(name.as_str()),
            TypeField::Multiple(names) => names
                .iter()
                .map(String::as_str)
                .find(|name| *name != "null"),
        }
    }

    fn allows_null(&self) -> bool {
        match self {
            TypeField::Single(name) => name == "null",
            TypeField::Multiple(names) => names.iter().any(|n| n == "null"),
        }
    }
}

/// One schema node from the contract
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaNode {
    /// Unresolved component reference; other keywords are ignored when set
    #[serde(rename = "$ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Declared type
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<TypeField>,

    /// Format hint (`date`, `uuid`, `int32`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Regular pattern for strings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Enumerated literals
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,

    /// Array item schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaNode>>,

    /// Object properties; a `null` entry has no usable schema
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Option<SchemaNode>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(default)]
    pub nullable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<SchemaNode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<SchemaNode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_of: Vec<SchemaNode>,
}

impl SchemaNode {
    /// Create a node of the given kind
    pub fn of_kind(kind: SchemaKind) -> Self {
        Self {
            kind: Some(TypeField::Single(kind.as_str().to_string())),
            ..Default::default()
        }
    }

    /// Set the format
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Set the pattern
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Set enum literals
    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    /// Set the default literal
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Set the example literal
    pub fn with_example(mut self, value: Value) -> Self {
        self.example = Some(value);
        self
    }

    /// Set the array items schema
    pub fn with_items(mut self, items: SchemaNode) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    /// Node that points at a named component schema
    pub fn reference_to(name: &str) -> Self {
        Self {
            reference: Some(format!("{}{}", COMPONENT_SCHEMA_PREFIX, escape_pointer(name))),
            ..Default::default()
        }
    }

    /// Add an object property
    pub fn with_property(mut self, name: impl Into<String>, schema: SchemaNode) -> Self {
        self.properties.insert(name.into(), Some(schema));
        self
    }

    /// Declared kind, if it names one this fuzzer understands
    pub fn kind(&self) -> Option<SchemaKind> {
        self.kind
            .as_ref()
            .and_then(TypeField::primary)
            .and_then(SchemaKind::parse)
    }

    /// Raw declared type name, for diagnostics
    pub fn kind_name(&self) -> &str {
        self.kind
            .as_ref()
            .and_then(TypeField::primary)
            .unwrap_or("<missing>")
    }

    /// Convert to a JSON Schema document for validation. Component
    /// references become `#/$defs/<name>`; use [`SchemaSet::to_json_schema`]
    /// to get a document that carries those definitions.
    pub fn to_json_schema(&self) -> Value {
        if let Some(reference) = &self.reference {
            return match component_name(reference) {
                Some(name) => json!({"$ref": format!("#/$defs/{}", escape_pointer(&name))}),
                None => json!({}),
            };
        }

        let mut out = Map::new();

        if let Some(kind) = &self.kind {
            if let Some(primary) = kind.primary() {
                if self.nullable || kind.allows_null() {
                    out.insert("type".into(), json!([primary, "null"]));
                } else {
                    out.insert("type".into(), json!(primary));
                }
            }
        }
        if let Some(format) = &self.format {
            out.insert("format".into(), json!(format));
        }
        if let Some(pattern) = &self.pattern {
            out.insert("pattern".into(), json!(pattern));
        }
        if let Some(values) = &self.enum_values {
            let mut values = values.clone();
            if self.nullable && !values.contains(&Value::Null) {
                values.push(Value::Null);
            }
            out.insert("enum".into(), Value::Array(values));
        }
        if let Some(items) = &self.items {
            out.insert("items".into(), items.to_json_schema());
        }
        if !self.properties.is_empty() {
            let props: Map<String, Value> = self
                .properties
                .iter()
                .map(|(name, node)| {
                    let schema = node
                        .as_ref()
                        .map(SchemaNode::to_json_schema)
                        .unwrap_or_else(|| json!({}));
                    (name.clone(), schema)
                })
                .collect();
            out.insert("properties".into(), Value::Object(props));
        }
        if !self.required.is_empty() {
            out.insert("required".into(), json!(self.required));
        }
        if let Some(min) = self.minimum {
            out.insert("minimum".into(), json!(min));
        }
        if let Some(max) = self.maximum {
            out.insert("maximum".into(), json!(max));
        }
        if let Some(min) = self.min_length {
            out.insert("minLength".into(), json!(min));
        }
        if let Some(max) = self.max_length {
            out.insert("maxLength".into(), json!(max));
        }
        for (keyword, members) in [
            ("oneOf", &self.one_of),
            ("anyOf", &self.any_of),
            ("allOf", &self.all_of),
        ] {
            if !members.is_empty() {
                let members: Vec<Value> = members.iter().map(SchemaNode::to_json_schema).collect();
                out.insert(keyword.into(), Value::Array(members));
            }
        }

        Value::Object(out)
    }

    /// Every component reference reachable in this node without following one
    fn collect_references(&self, out: &mut Vec<String>) {
        if let Some(reference) = &self.reference {
            out.push(reference.clone());
            return;
        }
        if let Some(items) = &self.items {
            items.collect_references(out);
        }
        for node in self.properties.values().flatten() {
            node.collect_references(out);
        }
        for node in self.one_of.iter().chain(&self.any_of).chain(&self.all_of) {
            node.collect_references(out);
        }
    }
}

/// Named component schemas, stored once and shared by every node that
/// refers to them
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    schemas: BTreeMap<String, SchemaNode>,
}

impl SchemaSet {
    pub fn new(schemas: BTreeMap<String, SchemaNode>) -> Self {
        Self { schemas }
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Target of a `#/components/schemas/<name>` reference
    pub fn get(&self, reference: &str) -> Option<&SchemaNode> {
        let name = component_name(reference)?;
        self.schemas.get(name.as_ref())
    }

    /// Follow `$ref` aliases to a node with its own keywords. `None` for a
    /// dangling reference or an alias chain that never ends.
    pub fn resolve<'a>(&'a self, node: &'a SchemaNode) -> Option<&'a SchemaNode> {
        let mut current = node;
        for _ in 0..MAX_ALIAS_HOPS {
            match current.reference.as_deref() {
                None => return Some(current),
                Some(reference) => current = self.get(reference)?,
            }
        }
        None
    }

    /// JSON Schema for `node` with every component it can reach under
    /// `$defs`, each converted once
    pub fn to_json_schema(&self, node: &SchemaNode) -> Value {
        let mut root = node.to_json_schema();
        let mut pending = Vec::new();
        node.collect_references(&mut pending);

        let mut defs = Map::new();
        while let Some(reference) = pending.pop() {
            let Some(name) = component_name(&reference) else {
                continue;
            };
            if defs.contains_key(name.as_ref()) {
                continue;
            }
            let converted = match self.schemas.get(name.as_ref()) {
                Some(target) => {
                    target.collect_references(&mut pending);
                    target.to_json_schema()
                }
                None => json!({}),
            };
            defs.insert(name.into_owned(), converted);
        }

        if defs.is_empty() {
            return root;
        }
        match &mut root {
            Value::Object(map) => {
                map.insert("$defs".into(), Value::Object(defs));
                root
            }
            _ => json!({"allOf": [root], "$defs": defs}),
        }
    }
}

/// Component name of a `#/components/schemas/<name>` reference with pointer
/// escapes decoded; `None` for any other reference
pub fn component_name(reference: &str) -> Option<Cow<'_, str>> {
    let raw = reference.strip_prefix(COMPONENT_SCHEMA_PREFIX)?;
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    let decoded = urlencoding::decode(raw).ok()?;
    if decoded.contains('~') {
        Some(Cow::Owned(decoded.replace("~1", "/").replace("~0", "~")))
    } else {
        Some(decoded)
    }
}

fn escape_pointer(name: &str) -> String {
    let escaped = name.replace('~', "~0").replace('/', "~1");
    urlencoding::encode(&escaped).into_owned()
}
