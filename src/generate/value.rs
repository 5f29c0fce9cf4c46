//! Generated Values
//!
//! The tagged value tree the generator produces, and its wire renderings.

use base64::Engine;
use quick_xml::events::BytesText;
use quick_xml::Writer;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Leaf values
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Scalar {
    /// Element name used for XML rendering
    fn xml_name(&self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::Bool(_) => "bool",
            Scalar::Integer(_) => "int",
            Scalar::Float(_) => "float",
            Scalar::String(_) => "string",
            Scalar::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => Ok(()),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Integer(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::String(s) => f.write_str(s),
            Scalar::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

/// A freshly generated value: scalar, ordered sequence, or name-to-value mapping
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedValue {
    Scalar(Scalar),
    Sequence(Vec<GeneratedValue>),
    Mapping(BTreeMap<String, GeneratedValue>),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("a mapping has no XML representation")]
    MappingNotRepresentable,

    #[error("XML writer error: {0}")]
    Xml(String),
}

impl GeneratedValue {
    /// The empty-string sentinel returned for unusable schema nodes
    pub fn empty() -> Self {
        GeneratedValue::Scalar(Scalar::String(String::new()))
    }

    pub fn string(s: impl Into<String>) -> Self {
        GeneratedValue::Scalar(Scalar::String(s.into()))
    }

    /// Convert a literal taken from the contract (enum, default, example)
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => GeneratedValue::Scalar(Scalar::Null),
            Value::Bool(b) => GeneratedValue::Scalar(Scalar::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => GeneratedValue::Scalar(Scalar::Integer(i)),
                None => GeneratedValue::Scalar(Scalar::Float(n.as_f64().unwrap_or_default())),
            },
            Value::String(s) => GeneratedValue::string(s.clone()),
            Value::Array(items) => {
                GeneratedValue::Sequence(items.iter().map(GeneratedValue::from_json).collect())
            }
            Value::Object(map) => GeneratedValue::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), GeneratedValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON rendering; bytes become standard base64
    pub fn to_json(&self) -> Value {
        match self {
            GeneratedValue::Scalar(scalar) => match scalar {
                Scalar::Null => Value::Null,
                Scalar::Bool(b) => Value::Bool(*b),
                Scalar::Integer(i) => Value::from(*i),
                Scalar::Float(x) => serde_json::Number::from_f64(*x)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                Scalar::String(s) => Value::String(s.clone()),
                Scalar::Bytes(bytes) => {
                    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
                }
            },
            GeneratedValue::Sequence(items) => {
                Value::Array(items.iter().map(GeneratedValue::to_json).collect())
            }
            GeneratedValue::Mapping(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Text rendering used for path, query, header and cookie values
    pub fn render(&self) -> String {
        match self {
            GeneratedValue::Scalar(scalar) => scalar.to_string(),
            GeneratedValue::Sequence(items) => items
                .iter()
                .map(GeneratedValue::render)
                .collect::<Vec<_>>()
                .join(","),
            GeneratedValue::Mapping(_) => self.to_json().to_string(),
        }
    }

    /// Raw bytes for `application/octet-stream` and `text/plain` bodies
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            GeneratedValue::Scalar(Scalar::Bytes(bytes)) => bytes.clone(),
            other => other.render().into_bytes(),
        }
    }

    /// XML rendering. Scalars become one element named after their kind,
    /// sequences concatenate their items.
    pub fn to_xml(&self) -> Result<Vec<u8>, RenderError> {
        let mut writer = Writer::new(Vec::new());
        self.write_xml(&mut writer)?;
        Ok(writer.into_inner())
    }

    fn write_xml(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), RenderError> {
        match self {
            GeneratedValue::Scalar(scalar) => {
                let text = match scalar {
                    Scalar::Bytes(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
                    other => other.to_string(),
                };
                writer
                    .create_element(scalar.xml_name())
                    .write_text_content(BytesText::new(&text))
                    .map_err(|e| RenderError::Xml(e.to_string()))?;
                Ok(())
            }
            GeneratedValue::Sequence(items) => {
                for item in items {
                    item.write_xml(writer)?;
                }
                Ok(())
            }
            GeneratedValue::Mapping(_) => Err(RenderError::MappingNotRepresentable),
        }
    }
}

impl Serialize for GeneratedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GeneratedValue::Scalar(_) => self.to_json().serialize(serializer),
            GeneratedValue::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            GeneratedValue::Mapping(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_literal() {
        let value = GeneratedValue::from_json(&json!({"a": [1, 2.5, "x", null, true]}));
        assert_eq!(value.to_json(), json!({"a": [1, 2.5, "x", null, true]}));
    }

    #[test]
    fn test_bytes_render_as_base64_in_json() {
        let value = GeneratedValue::Scalar(Scalar::Bytes(b"hi".to_vec()));
        assert_eq!(value.to_json(), json!("aGk="));
        assert_eq!(value.to_bytes(), b"hi".to_vec());
    }

    #[test]
    fn test_render_for_parameters() {
        let seq = GeneratedValue::Sequence(vec![
            GeneratedValue::Scalar(Scalar::Integer(1)),
            GeneratedValue::string("b"),
        ]);
        assert_eq!(seq.render(), "1,b");

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), GeneratedValue::Scalar(Scalar::Bool(false)));
        assert_eq!(GeneratedValue::Mapping(map).render(), r#"{"k":false}"#);
    }

    #[test]
    fn test_xml_scalars_and_sequences() {
        let xml = GeneratedValue::string("a<b").to_xml().unwrap();
        assert_eq!(String::from_utf8(xml).unwrap(), "<string>a&lt;b</string>");

        let seq = GeneratedValue::Sequence(vec![
            GeneratedValue::Scalar(Scalar::Integer(7)),
            GeneratedValue::Scalar(Scalar::Bool(true)),
        ]);
        assert_eq!(
            String::from_utf8(seq.to_xml().unwrap()).unwrap(),
            "<int>7</int><bool>true</bool>"
        );
    }

    #[test]
    fn test_xml_rejects_mappings() {
        let value = GeneratedValue::Mapping(BTreeMap::new());
        assert_eq!(value.to_xml(), Err(RenderError::MappingNotRepresentable));
    }

    #[test]
    fn test_serialize_matches_to_json() {
        let value = GeneratedValue::from_json(&json!({"n": [1, {"m": "v"}]}));
        assert_eq!(serde_json::to_value(&value).unwrap(), value.to_json());
    }
}
