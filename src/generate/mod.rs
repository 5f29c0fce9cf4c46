//! Contract-aware random value generation.
//!
//! Turns one [`SchemaNode`] into one [`GeneratedValue`], recursing through
//! arrays and objects. Every call draws fresh randomness; the only state
//! kept between calls is the RNG and a cache of compiled string patterns.
//!
//! String priority: `pattern`, then `format`, then `enum` (declared
//! default first), then `example`, then a random alphanumeric string.
//!
//! Component references are followed through the generator's [`SchemaSet`].
//! A reference already being expanded, or one met after the per-value
//! expansion budget is spent, yields an empty object or array instead.

pub mod formats;
pub mod value;

pub use value::{GeneratedValue, RenderError, Scalar};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::contract::{SchemaKind, SchemaNode, SchemaSet};

/// Upper bound for unbounded repetitions (`*`, `+`, `{n,}`) in patterns
const MAX_PATTERN_REPEAT: u32 = 32;

/// Component references expanded while generating one top-level value
const MAX_REF_EXPANSIONS: usize = 256;

/// Random value generator over contract schema nodes
pub struct ValueGenerator {
    rng: StdRng,
    patterns: HashMap<String, Option<rand_regex::Regex>>,
    schemas: Arc<SchemaSet>,
    ref_stack: Vec<String>,
    ref_budget: usize,
}

impl ValueGenerator {
    /// Seeded generator for reproducible runs; OS entropy otherwise
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            patterns: HashMap::new(),
            schemas: Arc::new(SchemaSet::default()),
            ref_stack: Vec::new(),
            ref_budget: MAX_REF_EXPANSIONS,
        }
    }

    /// Resolve component references against `schemas`
    pub fn with_schemas(mut self, schemas: Arc<SchemaSet>) -> Self {
        self.schemas = schemas;
        self
    }

    /// Generate one value for `node`
    pub fn generate(&mut self, node: &SchemaNode) -> GeneratedValue {
        self.ref_stack.clear();
        self.ref_budget = MAX_REF_EXPANSIONS;
        self.generate_node(node)
    }

    fn generate_node(&mut self, node: &SchemaNode) -> GeneratedValue {
        if let Some(reference) = &node.reference {
            return self.generate_reference(node, reference);
        }
        match node.kind() {
            Some(SchemaKind::String) => self.generate_string(node),
            Some(SchemaKind::Number) => enum_choice(node).unwrap_or_else(|| {
                formats::number_for_format(&mut self.rng, node.format.as_deref())
            }),
            Some(SchemaKind::Integer) => enum_choice(node).unwrap_or_else(|| {
                formats::integer_for_format(&mut self.rng, node.format.as_deref())
            }),
            Some(SchemaKind::Boolean) => enum_choice(node)
                .unwrap_or_else(|| GeneratedValue::Scalar(Scalar::Bool(self.rng.gen_bool(0.5)))),
            Some(SchemaKind::Array) => match node.items.as_deref() {
                Some(items) => GeneratedValue::Sequence(vec![self.generate_node(items)]),
                None => GeneratedValue::Sequence(Vec::new()),
            },
            Some(SchemaKind::Object) => GeneratedValue::Mapping(self.generate_properties(node)),
            None => self.generate_untyped(node),
        }
    }

    fn generate_reference(&mut self, node: &SchemaNode, reference: &str) -> GeneratedValue {
        let schemas = Arc::clone(&self.schemas);
        let Some(target) = schemas.resolve(node) else {
            warn!(reference, "unresolvable schema reference, using empty string");
            return GeneratedValue::empty();
        };
        if self.ref_budget == 0 || self.ref_stack.iter().any(|r| r == reference) {
            debug!(reference, depth = self.ref_stack.len(), "schema reference cut off");
            return empty_shell(target);
        }

        self.ref_budget -= 1;
        self.ref_stack.push(reference.to_string());
        let value = self.generate_node(target);
        self.ref_stack.pop();
        value
    }

    fn generate_string(&mut self, node: &SchemaNode) -> GeneratedValue {
        if let Some(pattern) = &node.pattern {
            if let Some(value) = self.sample_pattern(pattern) {
                return GeneratedValue::string(value);
            }
        }
        if let Some(format) = &node.format {
            return formats::string_for_format(&mut self.rng, format);
        }
        if let Some(value) = enum_choice(node) {
            return value;
        }
        if let Some(example) = &node.example {
            return GeneratedValue::from_json(example);
        }
        GeneratedValue::string(formats::fallback_string(&mut self.rng))
    }

    /// Draw a string matching `pattern`, or `None` when the pattern is unusable
    fn sample_pattern(&mut self, pattern: &str) -> Option<String> {
        let compiled = self
            .patterns
            .entry(pattern.to_string())
            .or_insert_with(|| compile_pattern(pattern));
        compiled.as_ref().map(|regex| self.rng.sample::<String, _>(regex))
    }

    fn generate_properties(&mut self, node: &SchemaNode) -> BTreeMap<String, GeneratedValue> {
        node.properties
            .iter()
            .filter_map(|(name, schema)| schema.as_ref().map(|schema| (name, schema)))
            .map(|(name, schema)| (name.clone(), self.generate_node(schema)))
            .collect()
    }

    /// Nodes without a usable `type`: composites, bare property lists, or
    /// the empty-string sentinel
    fn generate_untyped(&mut self, node: &SchemaNode) -> GeneratedValue {
        let alternatives = if node.one_of.is_empty() {
            &node.any_of
        } else {
            &node.one_of
        };
        if let Some(choice) = alternatives.choose(&mut self.rng) {
            return self.generate_node(choice);
        }

        if !node.all_of.is_empty() {
            let mut merged = BTreeMap::new();
            let mut first = None;
            for member in &node.all_of {
                match self.generate_node(member) {
                    GeneratedValue::Mapping(entries) => merged.extend(entries),
                    other => {
                        first.get_or_insert(other);
                    }
                }
            }
            return if merged.is_empty() {
                first.unwrap_or_else(GeneratedValue::empty)
            } else {
                GeneratedValue::Mapping(merged)
            };
        }

        if !node.properties.is_empty() {
            return GeneratedValue::Mapping(self.generate_properties(node));
        }

        warn!(kind = node.kind_name(), "unresolved schema type, using empty string");
        GeneratedValue::empty()
    }
}

/// Declared enum member: the non-null default, otherwise the first literal
fn enum_choice(node: &SchemaNode) -> Option<GeneratedValue> {
    let values = node.enum_values.as_ref().filter(|v| !v.is_empty())?;
    Some(match node.default.as_ref().filter(|d| !d.is_null()) {
        Some(default) => GeneratedValue::from_json(default),
        None => GeneratedValue::from_json(&values[0]),
    })
}

/// Smallest value of the target's shape
fn empty_shell(target: &SchemaNode) -> GeneratedValue {
    match target.kind() {
        Some(SchemaKind::Object) => GeneratedValue::Mapping(BTreeMap::new()),
        Some(SchemaKind::Array) => GeneratedValue::Sequence(Vec::new()),
        None if !target.properties.is_empty() => GeneratedValue::Mapping(BTreeMap::new()),
        _ => GeneratedValue::empty(),
    }
}

fn compile_pattern(pattern: &str) -> Option<rand_regex::Regex> {
    let body = strip_anchors(pattern);
    match rand_regex::Regex::compile(body, MAX_PATTERN_REPEAT) {
        Ok(regex) if regex.is_utf8() => Some(regex),
        Ok(_) => {
            warn!(pattern, "pattern can produce non-UTF-8 text, ignoring it");
            None
        }
        Err(e) => {
            warn!(pattern, error = %e, "pattern cannot be sampled, ignoring it");
            None
        }
    }
}

/// Drop a leading `^` and an unescaped trailing `$`
fn strip_anchors(pattern: &str) -> &str {
    let mut body = pattern.strip_prefix('^').unwrap_or(pattern);
    if let Some(stripped) = body.strip_suffix('$') {
        let escapes = stripped.chars().rev().take_while(|c| *c == '\\').count();
        if escapes % 2 == 0 {
            body = stripped;
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;

    fn node(value: serde_json::Value) -> SchemaNode {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_pattern_values_match() {
        let mut gen = ValueGenerator::new(Some(1));
        for pattern in [
            "^[a-z]{3}-[0-9]{2}$",
            "[A-F0-9]{8}",
            "^(cat|dog|bird)s?$",
            r"^\$[0-9]+\.[0-9]{2}$",
        ] {
            let schema = SchemaNode::of_kind(SchemaKind::String).with_pattern(pattern);
            let check = Regex::new(pattern).unwrap();
            for _ in 0..100 {
                let value = gen.generate(&schema).render();
                assert!(check.is_match(&value), "{value:?} !~ {pattern}");
            }
        }
    }

    #[test]
    fn test_pattern_beats_format_and_enum() {
        let mut gen = ValueGenerator::new(Some(2));
        let schema = SchemaNode::of_kind(SchemaKind::String)
            .with_pattern("^x+$")
            .with_format("uuid")
            .with_enum(vec![json!("a")]);
        let value = gen.generate(&schema).render();
        assert!(value.chars().all(|c| c == 'x') && !value.is_empty());
    }

    #[test]
    fn test_invalid_pattern_falls_through() {
        let mut gen = ValueGenerator::new(Some(3));
        let schema = SchemaNode::of_kind(SchemaKind::String)
            .with_pattern("([unclosed")
            .with_enum(vec![json!("fallback")]);
        assert_eq!(gen.generate(&schema), GeneratedValue::string("fallback"));
    }

    #[test]
    fn test_enum_first_literal_and_default() {
        let mut gen = ValueGenerator::new(None);
        let schema = SchemaNode::of_kind(SchemaKind::String)
            .with_enum(vec![json!("available"), json!("sold")]);
        for _ in 0..10 {
            assert_eq!(gen.generate(&schema), GeneratedValue::string("available"));
        }

        let with_default = schema.with_default(json!("sold"));
        assert_eq!(gen.generate(&with_default), GeneratedValue::string("sold"));
    }

    #[test]
    fn test_non_string_enums_stay_in_the_enum() {
        let mut gen = ValueGenerator::new(Some(1));
        let cases = [
            (SchemaKind::Integer, vec![json!(1), json!(2), json!(3)]),
            (SchemaKind::Number, vec![json!(1.5), json!(2.5)]),
            (SchemaKind::Boolean, vec![json!(false)]),
        ];
        for (kind, values) in cases {
            let schema = SchemaNode::of_kind(kind).with_enum(values.clone());
            for _ in 0..10 {
                let value = gen.generate(&schema).to_json();
                assert_eq!(value, values[0], "{kind:?}");
            }

            let with_default = schema.with_default(values[values.len() - 1].clone());
            assert_eq!(gen.generate(&with_default).to_json(), values[values.len() - 1]);
        }
    }

    #[test]
    fn test_example_used_verbatim() {
        let mut gen = ValueGenerator::new(None);
        let schema = SchemaNode::of_kind(SchemaKind::String).with_example(json!("doggie"));
        assert_eq!(gen.generate(&schema), GeneratedValue::string("doggie"));
    }

    #[test]
    fn test_object_keys_equal_declared_properties() {
        let mut gen = ValueGenerator::new(None);
        let schema = node(json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer", "format": "int64"},
                "name": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "owner": {"type": "object", "properties": {"email": {"type": "string", "format": "email"}}},
                "broken": null
            }
        }));
        match gen.generate(&schema) {
            GeneratedValue::Mapping(map) => {
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                assert_eq!(keys, vec!["id", "name", "owner", "tags"]);
                assert!(matches!(&map["tags"], GeneratedValue::Sequence(items) if items.len() == 1));
            }
            other => panic!("expected mapping, got {:?}", other),
        }
    }

    #[test]
    fn test_array_without_items_is_empty() {
        let mut gen = ValueGenerator::new(None);
        let schema = SchemaNode::of_kind(SchemaKind::Array);
        assert_eq!(gen.generate(&schema), GeneratedValue::Sequence(Vec::new()));
    }

    #[test]
    fn test_unknown_kind_yields_sentinel() {
        let mut gen = ValueGenerator::new(None);
        assert_eq!(gen.generate(&node(json!({"type": "file"}))), GeneratedValue::empty());
        assert_eq!(gen.generate(&SchemaNode::default()), GeneratedValue::empty());
    }

    #[test]
    fn test_composites() {
        let mut gen = ValueGenerator::new(Some(9));
        let one_of = node(json!({"oneOf": [{"type": "boolean"}]}));
        assert!(matches!(gen.generate(&one_of), GeneratedValue::Scalar(Scalar::Bool(_))));

        let all_of = node(json!({"allOf": [
            {"type": "object", "properties": {"a": {"type": "integer"}}},
            {"type": "object", "properties": {"b": {"type": "boolean"}}}
        ]}));
        match gen.generate(&all_of) {
            GeneratedValue::Mapping(map) => assert_eq!(map.len(), 2),
            other => panic!("expected mapping, got {:?}", other),
        }
    }

    #[test]
    fn test_seeded_generators_agree() {
        let schema = node(json!({"type": "object", "properties": {
            "n": {"type": "number", "format": "double"},
            "s": {"type": "string", "pattern": "^[a-z]{5}$"}
        }}));
        let mut a = ValueGenerator::new(Some(42));
        let mut b = ValueGenerator::new(Some(42));
        assert_eq!(a.generate(&schema), b.generate(&schema));
    }

    fn schema_set(schemas: serde_json::Value) -> Arc<SchemaSet> {
        Arc::new(SchemaSet::new(serde_json::from_value(schemas).unwrap()))
    }

    #[test]
    fn test_shared_reference_expands_at_every_use() {
        let schemas = schema_set(json!({
            "Money": {"type": "object", "properties": {"amount": {"type": "integer"}}}
        }));
        let mut gen = ValueGenerator::new(Some(4)).with_schemas(schemas);
        let schema = node(json!({"type": "object", "properties": {
            "price": {"$ref": "#/components/schemas/Money"},
            "tax": {"$ref": "#/components/schemas/Money"}
        }}));
        let value = gen.generate(&schema).to_json();
        assert!(value["price"]["amount"].is_i64());
        assert!(value["tax"]["amount"].is_i64());
    }

    #[test]
    fn test_recursive_reference_is_cut_to_empty_object() {
        let schemas = schema_set(json!({
            "Pet": {"type": "object", "properties": {
                "name": {"type": "string", "enum": ["rex"]},
                "parent": {"$ref": "#/components/schemas/Pet"},
                "litter": {"type": "array", "items": {"$ref": "#/components/schemas/Pet"}}
            }}
        }));
        let mut gen = ValueGenerator::new(Some(5)).with_schemas(schemas);
        let value = gen.generate(&SchemaNode::reference_to("Pet")).to_json();
        assert_eq!(value["name"], json!("rex"));
        assert_eq!(value["parent"], json!({}));
        assert_eq!(value["litter"], json!([{}]));
    }

    #[test]
    fn test_densely_linked_references_stay_bounded() {
        const COUNT: usize = 12;
        let mut components = serde_json::Map::new();
        for i in 0..COUNT {
            let properties: serde_json::Map<String, serde_json::Value> = (0..COUNT)
                .filter(|j| *j != i)
                .map(|j| (format!("s{j}"), json!({"$ref": format!("#/components/schemas/S{j}")})))
                .collect();
            components.insert(format!("S{i}"), json!({"type": "object", "properties": properties}));
        }
        let mut gen = ValueGenerator::new(Some(6)).with_schemas(schema_set(components.into()));

        let started = std::time::Instant::now();
        let first = gen.generate(&SchemaNode::reference_to("S0"));
        let second = gen.generate(&SchemaNode::reference_to("S0"));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert!(matches!(&first, GeneratedValue::Mapping(map) if map.len() == COUNT - 1));
        assert_eq!(first, second);
    }

    #[test]
    fn test_dangling_reference_yields_sentinel() {
        let mut gen = ValueGenerator::new(None);
        assert_eq!(gen.generate(&SchemaNode::reference_to("Nope")), GeneratedValue::empty());
    }

    #[test]
    fn test_strip_anchors() {
        assert_eq!(strip_anchors("^abc$"), "abc");
        assert_eq!(strip_anchors(r"abc\$"), r"abc\$");
        assert_eq!(strip_anchors(r"abc\\$"), r"abc\\");
    }
}
