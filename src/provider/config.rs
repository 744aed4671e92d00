//! Provider Configuration Types
//!
//! Design Decision: JSON-based configuration with environment variable substitution
//!
//! Rationale: Providers are declared in the same JSON files as the rest of the
//! runtime, while secrets (bearer tokens, API keys handed to a child process)
//! stay in the environment and are referenced as `${VAR}` or `${VAR:-default}`.
//!
//! Path handling: a subprocess provider must never depend on the ambient
//! working directory. Relative `scope`, `working_dir` and relative command
//! paths are resolved against the directory of the config file at load time
//! (`resolve_paths`), and the stdio strategy makes any remaining relative path
//! absolute before spawning.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{ProviderError, Result};

/// All providers known to the runtime
///
/// Example:
///     {
///       "subprocess": [ { "id": "filesystem", "command": "masterpiece-fs-provider", "scope": "./workspace" } ],
///       "http": [ { "id": "design", "url": "https://tools.example.com", "auth": { "type": "bearer", "token": "${DESIGN_TOKEN}" } } ]
///     }
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Providers spawned as child processes (line-delimited frames over stdio)
    #[serde(default)]
    pub subprocess: Vec<SubprocessConfig>,

    /// Providers reached over HTTP
    #[serde(default)]
    pub http: Vec<HttpConfig>,
}

/// Configuration for a subprocess provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessConfig {
    /// Unique provider id, also the capability namespace (`provider:<id>/...`)
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Executable to spawn
    ///
    /// A bare name is looked up on PATH by the OS; anything containing a path
    /// separator is treated as a path.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides, values support `${VAR}` substitution
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Directory the provider is allowed to operate on
    ///
    /// Passed to the child as its final argument, always absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Configuration for a remote HTTP provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Base URL; discovery is `GET <url>/capabilities`, invocation `POST <url>/invoke`
    pub url: String,

    /// Extra headers sent with every request, values support `${VAR}`
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

/// Authentication configuration for HTTP providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    None,

    /// Static bearer token (Authorization: Bearer <token>)
    ///
    /// Example:
    ///     { "type": "bearer", "token": "${API_TOKEN}" }
    Bearer { token: String },

    /// Basic authentication (Authorization: Basic <base64(user:pass)>)
    Basic { username: String, password: String },
}

fn default_true() -> bool {
    true
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_call_timeout() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    5
}

impl SubprocessConfig {
    /// Minimal config for a command with default timeouts
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            scope: None,
            enabled: true,
            handshake_timeout_secs: default_handshake_timeout(),
            call_timeout_secs: default_call_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Anchor relative paths at `base`
    ///
    /// Touches `scope`, `working_dir`, and `command` when the command is a
    /// relative path (contains a separator). Bare command names are left for
    /// PATH lookup.
    pub fn resolve_paths(&mut self, base: &Path) {
        if let Some(scope) = &self.scope {
            if scope.is_relative() {
                self.scope = Some(base.join(scope));
            }
        }
        if let Some(dir) = &self.working_dir {
            if dir.is_relative() {
                self.working_dir = Some(base.join(dir));
            }
        }
        let command = Path::new(&self.command);
        if command.is_relative() && command.components().count() > 1 {
            self.command = base.join(command).to_string_lossy().into_owned();
        }
    }
}

impl HttpConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            url: url.into(),
            headers: HashMap::new(),
            auth: None,
            enabled: true,
            call_timeout_secs: default_call_timeout(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl ProviderConfig {
    /// Load configuration from a JSON file
    ///
    /// Relative paths inside the file are anchored at the file's directory.
    ///
    /// Error Conditions:
    /// - File not found: Returns Io error
    /// - Invalid JSON: Returns Json error
    /// - Validation failure: Returns Config error
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ProviderConfig = serde_json::from_str(&content)?;
        config.validate()?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Validate configuration for common errors
    ///
    /// Validation Rules:
    /// 1. Provider ids are non-empty and unique across both strategies
    /// 2. Provider ids contain no '/' (it separates namespace from name)
    /// 3. Subprocess providers have a command, HTTP providers a URL
    ///
    /// Environment variable resolution is deferred until the provider starts.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();

        let all_ids = self
            .subprocess
            .iter()
            .map(|s| s.id.as_str())
            .chain(self.http.iter().map(|h| h.id.as_str()));
        for id in all_ids {
            if id.is_empty() {
                return Err(ProviderError::Config("Provider ID cannot be empty".to_string()));
            }
            if id.contains('/') {
                return Err(ProviderError::Config(format!(
                    "Provider ID '{}' must not contain '/'",
                    id
                )));
            }
            if !ids.insert(id) {
                return Err(ProviderError::Config(format!("Duplicate provider ID: {}", id)));
            }
        }

        for server in &self.subprocess {
            if server.command.is_empty() {
                return Err(ProviderError::Config(format!(
                    "Provider '{}' has empty command",
                    server.id
                )));
            }
            // A zero deadline would fire before the child could answer
            for (field, secs) in [
                ("handshake_timeout_secs", server.handshake_timeout_secs),
                ("call_timeout_secs", server.call_timeout_secs),
            ] {
                if secs == 0 {
                    return Err(ProviderError::Config(format!(
                        "Provider '{}' has {} of 0",
                        server.id, field
                    )));
                }
            }
        }
        for service in &self.http {
            if service.url.is_empty() {
                return Err(ProviderError::Config(format!(
                    "Provider '{}' has empty URL",
                    service.id
                )));
            }
            if service.call_timeout_secs == 0 {
                return Err(ProviderError::Config(format!(
                    "Provider '{}' has call_timeout_secs of 0",
                    service.id
                )));
            }
        }

        Ok(())
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for server in &mut self.subprocess {
            server.resolve_paths(base);
        }
    }
}

/// Resolve an environment variable reference
///
/// Patterns:
/// - `${VAR_NAME}`: required, error if unset
/// - `${VAR_NAME:-default}`: falls back to `default`
/// - anything else is returned as-is
pub fn resolve_env_var(value: &str) -> Result<String> {
    let Some(inner) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) else {
        return Ok(value.to_string());
    };

    match inner.split_once(":-") {
        Some((var_name, fallback)) => {
            Ok(std::env::var(var_name).unwrap_or_else(|_| fallback.to_string()))
        }
        None => std::env::var(inner).map_err(|_| {
            ProviderError::Config(format!("Environment variable not found: {}", inner))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let json = r#"{
            "subprocess": [ { "id": "filesystem", "command": "masterpiece-fs-provider" } ],
            "http": [ { "id": "design", "url": "http://localhost:9000" } ]
        }"#;
        let config: ProviderConfig = serde_json::from_str(json).unwrap();

        let fs = &config.subprocess[0];
        assert!(fs.enabled);
        assert_eq!(fs.handshake_timeout_secs, 10);
        assert_eq!(fs.call_timeout(), Duration::from_secs(60));
        assert!(config.http[0].auth.is_none());
    }

    #[test]
    fn test_auth_config_tagging() {
        let json = r#"{ "id": "design", "url": "http://x", "auth": { "type": "bearer", "token": "${TOKEN}" } }"#;
        let config: HttpConfig = serde_json::from_str(json).unwrap();
        match config.auth {
            Some(AuthConfig::Bearer { token }) => assert_eq!(token, "${TOKEN}"),
            other => panic!("Expected bearer auth, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_id_across_strategies() {
        let config = ProviderConfig {
            subprocess: vec![SubprocessConfig::new("shared", "cmd")],
            http: vec![HttpConfig::new("shared", "http://localhost")],
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("Duplicate provider ID"));
    }

    #[test]
    fn test_id_with_slash_rejected() {
        let config = ProviderConfig {
            subprocess: vec![SubprocessConfig::new("fs/one", "cmd")],
            http: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = ProviderConfig {
            subprocess: vec![SubprocessConfig::new("fs", "")],
            http: vec![],
        };
        assert!(config.validate().unwrap_err().to_string().contains("empty command"));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut server = SubprocessConfig::new("fs", "fs-provider");
        server.call_timeout_secs = 0;
        let config = ProviderConfig { subprocess: vec![server], http: vec![] };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("call_timeout_secs"));

        let mut server = SubprocessConfig::new("fs", "fs-provider");
        server.handshake_timeout_secs = 0;
        let config = ProviderConfig { subprocess: vec![server], http: vec![] };
        assert!(config.validate().unwrap_err().to_string().contains("handshake_timeout_secs"));

        let mut service = HttpConfig::new("design", "https://tools.example.com");
        service.call_timeout_secs = 0;
        let config = ProviderConfig { subprocess: vec![], http: vec![service] };
        assert!(config.validate().unwrap_err().to_string().contains("call_timeout_secs"));

        // Zero grace just means an immediate kill
        let mut server = SubprocessConfig::new("fs", "fs-provider");
        server.shutdown_grace_secs = 0;
        let config = ProviderConfig { subprocess: vec![server], http: vec![] };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(
            &path,
            r#"{ "subprocess": [ {
                "id": "fs",
                "command": "bin/provider",
                "scope": "workspace",
                "working_dir": "/tmp"
            } ] }"#,
        )
        .unwrap();

        let config = ProviderConfig::load_from_file(&path).unwrap();
        let fs = &config.subprocess[0];
        assert_eq!(fs.scope.as_deref(), Some(dir.path().join("workspace").as_path()));
        assert_eq!(fs.working_dir.as_deref(), Some(Path::new("/tmp")));
        assert_eq!(
            fs.command,
            dir.path().join("bin/provider").to_string_lossy()
        );
    }

    #[test]
    fn test_bare_command_left_for_path_lookup() {
        let mut config = SubprocessConfig::new("fs", "node");
        config.resolve_paths(Path::new("/etc/masterpiece"));
        assert_eq!(config.command, "node");
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let result = ProviderConfig::load_from_file(file.path());
        assert!(matches!(result, Err(ProviderError::Json(_))));
    }

    #[test]
    fn test_env_var_resolution() {
        env::set_var("MASTERPIECE_TEST_TOKEN", "secret");

        assert_eq!(resolve_env_var("${MASTERPIECE_TEST_TOKEN}").unwrap(), "secret");
        assert_eq!(resolve_env_var("literal").unwrap(), "literal");
        assert_eq!(
            resolve_env_var("${MASTERPIECE_UNSET_12345:-fallback}").unwrap(),
            "fallback"
        );

        env::remove_var("MASTERPIECE_TEST_TOKEN");
    }

    #[test]
    fn test_missing_env_var() {
        let result = resolve_env_var("${MASTERPIECE_NONEXISTENT_VAR_12345}");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Environment variable not found"));
    }
}
