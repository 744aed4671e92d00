//! Capabilities: named, schema-typed invocable operations
//!
//! A capability is an explicit record (name, ordered typed parameters,
//! output type, origin, handler) rather than a bare callable. Arguments are
//! validated structurally against the parameter list before the handler
//! runs, so a local function and a provider-hosted tool share one contract.
//!
//! Naming:
//! - local capabilities use their plain name (`suggest_tech_stack`)
//! - provider capabilities are namespaced as `provider:<provider-id>/<name>`

pub mod builtin;
pub mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{MasterpieceError, Result};
use crate::provider::CapabilityProvider;

pub use registry::{CapabilityRegistry, ReplacePolicy};

/// Argument object passed to a capability
pub type Arguments = serde_json::Map<String, Value>;

/// Synchronous local handler: typed args in, JSON value or failure text out
pub type LocalHandler = Arc<dyn Fn(&Arguments) -> std::result::Result<Value, String> + Send + Sync>;

/// Declared semantic type of a parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    /// Whether `value` conforms to this type
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }

    /// Map a JSON Schema fragment (`{"type": "string"}`) to a type
    pub fn from_json_schema(schema: &Value) -> Self {
        match schema.get("type").and_then(Value::as_str) {
            Some("string") => ParamType::String,
            Some("integer") => ParamType::Integer,
            Some("number") => ParamType::Number,
            Some("boolean") => ParamType::Boolean,
            Some("array") => ParamType::Array,
            Some("object") => ParamType::Object,
            _ => ParamType::Any,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        };
        f.write_str(name)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One named parameter of a capability's input schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ParamType,

    /// Parameters are required unless declared otherwise
    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

impl Parameter {
    pub fn required(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Where a capability comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Provider(String),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => f.write_str("local"),
            Origin::Provider(id) => write!(f, "provider:{}", id),
        }
    }
}

/// Registry name of a capability hosted by a provider
pub fn namespaced(provider_id: &str, name: &str) -> String {
    format!("provider:{}/{}", provider_id, name)
}

/// How an invocation is dispatched
#[derive(Clone)]
pub enum Handler {
    /// In-process function call
    Local(LocalHandler),

    /// Bridge-mediated call; `remote_name` is the provider's own name for it
    Remote {
        provider: Arc<dyn CapabilityProvider>,
        remote_name: String,
    },
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Local(_) => f.write_str("Handler::Local"),
            Handler::Remote { provider, remote_name } => f
                .debug_struct("Handler::Remote")
                .field("provider", &provider.id())
                .field("remote_name", remote_name)
                .finish(),
        }
    }
}

/// A registered capability
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub parameters: Vec<Parameter>,
    pub output: ParamType,
    pub origin: Origin,
    pub handler: Handler,
}

impl Capability {
    /// Build a local capability from a plain function
    ///
    /// Example:
    /// ```rust
    /// use masterpiece::capability::{Capability, ParamType, Parameter};
    /// use serde_json::json;
    ///
    /// let echo = Capability::local(
    ///     "echo",
    ///     "Echo the input back",
    ///     vec![Parameter::required("text", ParamType::String)],
    ///     ParamType::String,
    ///     |args| Ok(args["text"].clone()),
    /// );
    /// assert_eq!(echo.origin.to_string(), "local");
    /// ```
    pub fn local<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<Parameter>,
        output: ParamType,
        handler: F,
    ) -> Self
    where
        F: Fn(&Arguments) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            output,
            origin: Origin::Local,
            handler: Handler::Local(Arc::new(handler)),
        }
    }

    /// Check `args` against the input schema
    ///
    /// Collects every problem (missing required, mistyped, unexpected) into a
    /// single `InvalidArguments` error. `null` is accepted for optional
    /// parameters.
    pub fn validate(&self, args: &Arguments) -> Result<()> {
        let mut problems = Vec::new();

        for param in &self.parameters {
            match args.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    problems.push(format!("missing required parameter '{}'", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.kind.matches(value) => {
                    problems.push(format!(
                        "parameter '{}' expected {}, got {}",
                        param.name,
                        param.kind,
                        json_type_name(value)
                    ));
                }
                Some(_) => {}
            }
        }

        for key in args.keys() {
            if !self.parameters.iter().any(|p| &p.name == key) {
                problems.push(format!("unexpected parameter '{}'", key));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MasterpieceError::InvalidArguments {
                capability: self.name.clone(),
                problems,
            })
        }
    }

    /// Provider id when the capability is provider-hosted
    pub fn provider_id(&self) -> Option<&str> {
        match &self.origin {
            Origin::Provider(id) => Some(id),
            Origin::Local => None,
        }
    }

    pub fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
            output: self.output,
            origin: self.origin.clone(),
        }
    }
}

/// Serializable view of a capability, handed to reasoning behaviors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
    pub parameters: Vec<Parameter>,
    pub output: ParamType,
    pub origin: Origin,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema_capability() -> Capability {
        Capability::local(
            "generate_kotlin_code",
            "Generates Kotlin code",
            vec![
                Parameter::required("description", ParamType::String),
                Parameter::required("layout_type", ParamType::String),
                Parameter::optional("line_limit", ParamType::Integer),
            ],
            ParamType::String,
            |_| Ok(json!("ok")),
        )
    }

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validate_accepts_conforming_args() {
        let cap = schema_capability();
        assert!(cap
            .validate(&args(json!({"description": "login", "layout_type": "compose"})))
            .is_ok());
        assert!(cap
            .validate(&args(json!({"description": "login", "layout_type": "xml", "line_limit": null})))
            .is_ok());
    }

    #[test]
    fn test_validate_lists_every_problem() {
        let cap = schema_capability();
        let err = cap
            .validate(&args(json!({"layout_type": 3, "line_limit": 1.5, "theme": "dark"})))
            .unwrap_err();

        match err {
            MasterpieceError::InvalidArguments { capability, problems } => {
                assert_eq!(capability, "generate_kotlin_code");
                assert_eq!(
                    problems,
                    vec![
                        "missing required parameter 'description'".to_string(),
                        "parameter 'layout_type' expected string, got integer".to_string(),
                        "parameter 'line_limit' expected integer, got number".to_string(),
                        "unexpected parameter 'theme'".to_string(),
                    ]
                );
            }
            other => panic!("Expected InvalidArguments, got {:?}", other),
        }
    }

    #[test]
    fn test_param_type_from_json_schema() {
        assert_eq!(ParamType::from_json_schema(&json!({"type": "string"})), ParamType::String);
        assert_eq!(ParamType::from_json_schema(&json!({"type": "array"})), ParamType::Array);
        assert_eq!(ParamType::from_json_schema(&json!({})), ParamType::Any);
    }

    #[test]
    fn test_origin_display_and_namespace() {
        assert_eq!(Origin::Local.to_string(), "local");
        assert_eq!(Origin::Provider("fs".into()).to_string(), "provider:fs");
        assert_eq!(namespaced("fs", "list_directory"), "provider:fs/list_directory");
    }

    #[test]
    fn test_parameter_required_by_default_on_the_wire() {
        let param: Parameter = serde_json::from_value(json!({"name": "path", "type": "string"})).unwrap();
        assert!(param.required);
        assert_eq!(param.kind, ParamType::String);
    }
}
