//! Request body construction.

use thiserror::Error;
use tracing::{error, warn};

use crate::contract::Operation;
use crate::generate::{GeneratedValue, RenderError, ValueGenerator};

/// Content type used when no body is sent
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("XML rendering failed: {0}")]
    Xml(#[from] RenderError),

    #[error("JSON rendering failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A serialized request body and the media type it was rendered as
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Payload {
    pub fn empty(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            body: Vec::new(),
        }
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::empty(DEFAULT_CONTENT_TYPE)
    }
}

/// Build the body for `operation`. Only required bodies are generated; the
/// first declared media type that can be rendered wins.
pub fn build(operation: &Operation, generator: &mut ValueGenerator) -> Payload {
    let Some(request_body) = operation.request_body.as_ref().filter(|b| b.required) else {
        return Payload::default();
    };

    for (media_type, media) in &request_body.content {
        let value = match &media.schema {
            Some(schema) => generator.generate(schema),
            None => GeneratedValue::empty(),
        };

        match encode(media_type, &value) {
            Ok(body) => {
                return Payload {
                    content_type: media_type.clone(),
                    body,
                }
            }
            Err(PayloadError::UnsupportedMediaType(_)) => {
                warn!(media_type = %media_type, "unresolved media type, trying the next one");
            }
            Err(PayloadError::Xml(e)) => {
                warn!(
                    media_type = %media_type,
                    error = %e,
                    "value has no XML form, sending an empty body"
                );
                return Payload::empty(media_type.clone());
            }
            Err(e) => error!(media_type = %media_type, error = %e, "failed to render request body"),
        }
    }

    Payload::default()
}

/// Serialize `value` as `media_type`
pub fn encode(media_type: &str, value: &GeneratedValue) -> Result<Vec<u8>, PayloadError> {
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.as_str() {
        "application/json" => Ok(serde_json::to_vec(value)?),
        _ if essence.ends_with("+json") => Ok(serde_json::to_vec(value)?),
        "application/xml" | "text/xml" => Ok(value.to_xml()?),
        "application/octet-stream" | "text/plain" => Ok(value.to_bytes()),
        _ => Err(PayloadError::UnsupportedMediaType(media_type.to_string())),
    }
}
