// Runtime configuration
//
// Design Decision: One JSON document, secrets from the environment
//
// Rationale: Registry policy, run guards, providers and the delegate tree are
// versioned together in one file. Secrets never live there: `.env` is read
// through dotenvy and provider fields reference variables as `${VAR}`.
//
// Lookup order for `RuntimeConfig::load`:
// 1. `$MASTERPIECE_CONFIG` (must exist when set)
// 2. `<config dir>/masterpiece/config.json` (platform dir from `dirs`)
// 3. built-in defaults: no providers, the product team tree

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::capability::ReplacePolicy;
use crate::delegate::catalog::{product_team, PRODUCT_TEAM_ROOT};
use crate::delegate::{DelegateSetConfig, DelegateSpec};
use crate::error::{MasterpieceError, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::provider::ProviderConfig;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "MASTERPIECE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub policy: ReplacePolicy,
}

/// Example:
///     {
///       "registry": { "policy": "strict" },
///       "orchestrator": { "max_steps": 40, "decision_timeout_secs": 60 },
///       "providers": { "subprocess": [ { "id": "fs", "command": "masterpiece-fs-provider", "scope": "./workspace" } ] },
///       "delegates": { "root": "product_manager_agent", "directories": ["delegates"] },
///       "workspace": "./workspace"
///     }
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub providers: ProviderConfig,

    /// Empty means the built-in product team
    #[serde(default)]
    pub delegates: DelegateSetConfig,

    /// Base directory for the built-in file capabilities
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            providers: ProviderConfig::default(),
            delegates: DelegateSetConfig::default(),
            workspace: default_workspace(),
        }
    }
}

impl RuntimeConfig {
    /// Load `.env`, then the first config file found, else defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let explicit = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        match locate(explicit, dirs::config_dir()) {
            Some(path) => {
                tracing::info!("Loading configuration from {:?}", path);
                Self::load_from_file(&path)
            }
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse and validate one file, anchoring relative paths at its directory
    ///
    /// Error Conditions:
    /// - File not found: `Io`
    /// - Invalid JSON: `Serde`
    /// - Provider or delegate validation failure: `Provider` / `Config`
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RuntimeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.providers.validate()?;
        if self.orchestrator.max_steps == 0 {
            return Err(MasterpieceError::Config("orchestrator.max_steps must be at least 1".into()));
        }
        if !self.delegates.is_empty() && self.delegates.root.trim().is_empty() {
            return Err(MasterpieceError::Config(
                "delegates.root is required when delegates are configured".into(),
            ));
        }
        Ok(())
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        self.providers.resolve_paths(base);
        self.delegates.resolve_paths(base);
        if self.workspace.is_relative() {
            self.workspace = base.join(&self.workspace);
        }
    }

    /// Root name and specs of the delegate tree to build
    pub fn delegate_specs(&self) -> Result<(String, Vec<DelegateSpec>)> {
        if self.delegates.is_empty() {
            return Ok((PRODUCT_TEAM_ROOT.to_string(), product_team()));
        }
        Ok((self.delegates.root.clone(), self.delegates.specs()?))
    }
}

/// Explicit path wins; otherwise the platform config file if it exists
fn locate(explicit: Option<PathBuf>, config_dir: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        config_dir
            .map(|dir| dir.join("masterpiece").join("config.json"))
            .filter(|path| path.exists())
    })
}
