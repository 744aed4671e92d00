use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::DelegateSpec;
use crate::error::{MasterpieceError, Result};

/// JSON definition of a single delegate
///
/// Example:
/// ```json
/// {
///   "name": "architect_agent",
///   "instruction": "You are a Software Architect...",
///   "capabilities": ["suggest_tech_stack", "design_database_schema"],
///   "children": ["engineer_lead_agent"]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub instruction: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub children: Vec<String>,

    /// Disabled delegates are skipped by the loader
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DelegateConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DelegateConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Name and instruction must be non-blank
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MasterpieceError::Config("Delegate name cannot be empty".into()));
        }
        if self.instruction.trim().is_empty() {
            return Err(MasterpieceError::Config(format!(
                "Delegate '{}' has an empty instruction",
                self.name
            )));
        }
        Ok(())
    }
}

impl From<DelegateConfig> for DelegateSpec {
    fn from(config: DelegateConfig) -> Self {
        DelegateSpec {
            name: config.name,
            instruction: config.instruction,
            capabilities: config.capabilities,
            children: config.children,
        }
    }
}

/// A whole tree in one document: `{ "root": "...", "delegates": [...] }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegateSetConfig {
    #[serde(default)]
    pub root: String,

    #[serde(default)]
    pub delegates: Vec<DelegateConfig>,

    /// Extra directories of single-delegate JSON files
    #[serde(default)]
    pub directories: Vec<PathBuf>,
}

impl DelegateSetConfig {
    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty() && self.directories.is_empty()
    }

    /// Inline delegates plus everything the loader finds in `directories`
    pub fn specs(&self) -> Result<Vec<DelegateSpec>> {
        let mut specs = Vec::new();
        for delegate in self.delegates.iter().filter(|d| d.enabled) {
            delegate.validate()?;
            specs.push(delegate.clone().into());
        }

        let mut loader = DelegateLoader::empty();
        for dir in &self.directories {
            loader.add_search_path(dir);
        }
        specs.extend(loader.load_all()?.into_iter().map(DelegateSpec::from));
        Ok(specs)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in &mut self.directories {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
}

/// Loads delegate definitions from directories of `*.json` files
///
/// One file per delegate. A file that fails to parse or validate is logged
/// and skipped; the others still load.
pub struct DelegateLoader {
    search_paths: Vec<PathBuf>,
}

impl DelegateLoader {
    /// Loader over `delegates/presets` and `delegates/custom`
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("delegates/presets"),
                PathBuf::from("delegates/custom"),
            ],
        }
    }

    pub fn empty() -> Self {
        Self {
            search_paths: Vec::new(),
        }
    }

    pub fn add_search_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.search_paths.push(path.into());
    }

    /// Load every enabled delegate from every existing search path
    ///
    /// Missing directories are skipped.
    pub fn load_all(&self) -> Result<Vec<DelegateConfig>> {
        let mut delegates = Vec::new();
        for search_path in &self.search_paths {
            if !search_path.exists() {
                tracing::debug!("Delegate search path does not exist: {:?}", search_path);
                continue;
            }
            match self.load_from_directory(search_path) {
                Ok(found) => delegates.extend(found),
                Err(e) => tracing::warn!("Failed to load delegates from {:?}: {}", search_path, e),
            }
        }
        Ok(delegates)
    }

    /// Load a single directory, sorted by file name for stable ordering
    pub fn load_from_directory(&self, path: &Path) -> Result<Vec<DelegateConfig>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        files.sort();

        let mut delegates = Vec::new();
        for file in files {
            match DelegateConfig::from_file(&file) {
                Ok(config) if !config.enabled => {
                    tracing::debug!("Skipping disabled delegate '{}' from {:?}", config.name, file);
                }
                Ok(config) => {
                    tracing::info!("Loaded delegate '{}' from {:?}", config.name, file);
                    delegates.push(config);
                }
                Err(e) => {
                    tracing::error!("Failed to load delegate from {:?}: {}", file, e);
                }
            }
        }
        Ok(delegates)
    }
}

impl Default for DelegateLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, file: &str, content: &str) {
        fs::write(dir.path().join(file), content).unwrap();
    }

    #[test]
    fn test_config_defaults() {
        let config: DelegateConfig =
            serde_json::from_str(r#"{"name": "qa_agent", "instruction": "Test things."}"#).unwrap();
        assert!(config.enabled);
        assert!(config.children.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_blank_instruction_rejected() {
        let config: DelegateConfig =
            serde_json::from_str(r#"{"name": "qa_agent", "instruction": "  "}"#).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("empty instruction"));
    }

    #[test]
    fn test_loader_skips_bad_and_disabled_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a_pm.json", r#"{"name": "pm", "instruction": "Plan.", "children": ["qa"]}"#);
        write(&dir, "b_qa.json", r#"{"name": "qa", "instruction": "Test."}"#);
        write(&dir, "c_broken.json", "{ not json");
        write(&dir, "d_off.json", r#"{"name": "off", "instruction": "x", "enabled": false}"#);
        write(&dir, "notes.txt", "ignored");

        let mut loader = DelegateLoader::empty();
        loader.add_search_path(dir.path());
        let delegates = loader.load_all().unwrap();

        let names: Vec<&str> = delegates.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["pm", "qa"]);
    }

    #[test]
    fn test_loader_missing_directory() {
        let mut loader = DelegateLoader::empty();
        loader.add_search_path("/nonexistent/masterpiece/delegates");
        assert!(loader.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_set_combines_inline_and_directories() {
        let dir = TempDir::new().unwrap();
        write(&dir, "qa.json", r#"{"name": "qa", "instruction": "Test."}"#);

        let mut set: DelegateSetConfig = serde_json::from_str(
            r#"{
                "root": "pm",
                "delegates": [ {"name": "pm", "instruction": "Plan.", "children": ["qa"]} ],
                "directories": ["extra"]
            }"#,
        )
        .unwrap();
        fs::create_dir(dir.path().join("extra")).unwrap();
        fs::rename(dir.path().join("qa.json"), dir.path().join("extra/qa.json")).unwrap();
        set.resolve_paths(dir.path());

        let specs = set.specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].children, vec!["qa".to_string()]);
        assert_eq!(specs[1].name, "qa");
    }
}
