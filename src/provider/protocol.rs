//! Provider Wire Protocol
//!
//! Subprocess providers exchange one JSON object per line on stdin/stdout.
//! Requests carry a numeric `id` and a `kind`; the provider answers each
//! request, in order, with a frame echoing the `id` and holding either
//! `result` or `error`.
//!
//! ```text
//! -> {"id":1,"kind":"initialize","client_name":"masterpiece","client_version":"0.1.0","protocol_version":"1"}
//! <- {"id":1,"result":{"name":"fs","version":"0.1.0"}}
//! -> {"id":2,"kind":"list_capabilities"}
//! <- {"id":2,"result":{"capabilities":[{"name":"read_file","parameters":[{"name":"path","type":"string"}]}]}}
//! -> {"id":3,"kind":"call","capability":"read_file","args":{"path":"notes.txt"}}
//! <- {"id":3,"error":{"message":"not found: notes.txt"}}
//! -> {"id":4,"kind":"shutdown"}
//! ```
//!
//! HTTP providers reuse `CapabilityDescriptor` for discovery and the
//! `InvokeRequest`/`InvokeResponse` bodies for invocation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::error::{ProviderError, Result};
use crate::capability::{ParamType, Parameter};

/// Request sent to a subprocess provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    Initialize {
        client_name: String,
        client_version: String,
        protocol_version: String,
    },
    ListCapabilities,
    Call {
        capability: String,
        #[serde(default)]
        args: Value,
    },
    Shutdown,
}

impl RequestBody {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::Initialize { .. } => "initialize",
            RequestBody::ListCapabilities => "list_capabilities",
            RequestBody::Call { .. } => "call",
            RequestBody::Shutdown => "shutdown",
        }
    }
}

/// Response read back from a subprocess provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,

    /// Present-but-null is a valid (null) result
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub message: String,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ResponseFrame {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(FrameError {
                message: message.into(),
            }),
        }
    }
}

/// Capability as described by a provider during discovery
///
/// Providers may describe inputs either as a parameter list or as a JSON
/// Schema object (`inputSchema`); `parameters()` normalizes both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    #[serde(default, alias = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    #[serde(default = "default_output")]
    pub output: ParamType,
}

fn default_output() -> ParamType {
    ParamType::Any
}

impl CapabilityDescriptor {
    /// Declared parameters, falling back to the JSON Schema `properties`
    pub fn parameters(&self) -> Vec<Parameter> {
        if !self.parameters.is_empty() {
            return self.parameters.clone();
        }
        let Some(schema) = &self.input_schema else {
            return Vec::new();
        };

        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
            return Vec::new();
        };

        let mut params: Vec<Parameter> = properties
            .iter()
            .map(|(name, prop)| Parameter {
                name: name.clone(),
                kind: ParamType::from_json_schema(prop),
                required: required.contains(&name.as_str()),
                description: prop
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect();
        // Required first, then by name, so descriptions are stable
        params.sort_by(|a, b| b.required.cmp(&a.required).then_with(|| a.name.cmp(&b.name)));
        params
    }
}

/// `result` payload of `list_capabilities`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityList {
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
}

/// HTTP `POST <url>/invoke` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub capability: String,
    pub args: Value,
}

/// HTTP invoke response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    #[serde(default)]
    pub result: Value,
}

/// Serialize one frame as a single line, newline included
pub fn encode_line<T: Serialize>(frame: &T) -> Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parse one response line
///
/// Error Conditions:
/// - Not valid JSON or not a response frame: `Protocol`
/// - Both or neither of `result`/`error`: `Protocol`
pub fn decode_response(line: &str) -> Result<ResponseFrame> {
    let frame: ResponseFrame = serde_json::from_str(line.trim_end())
        .map_err(|e| ProviderError::Protocol(format!("Invalid response frame: {}", e)))?;
    match (&frame.result, &frame.error) {
        (Some(_), Some(_)) => Err(ProviderError::Protocol(format!(
            "Response {} carries both result and error",
            frame.id
        ))),
        (None, None) => Err(ProviderError::Protocol(format!(
            "Response {} carries neither result nor error",
            frame.id
        ))),
        _ => Ok(frame),
    }
}
