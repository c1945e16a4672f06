//! Configuration file handling for the implementation loop
//!
//! Reads and writes `{data_dir}/config.yaml`. Secrets never live here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImplementationConfig {
    /// Loop pacing and budgets
    #[serde(default, rename = "loop")]
    pub loop_settings: LoopSettings,

    /// Repository context sent to the model
    #[serde(default)]
    pub context: ContextSettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub git_host: GitHostSettings,

    #[serde(default)]
    pub rollback: RollbackSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopSettings {
    /// Iteration budget for sessions that do not override it
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Pause between iterations
    #[serde(default = "default_inter_iteration_delay_ms")]
    pub inter_iteration_delay_ms: u64,

    /// How often a waiting session re-reads its status
    #[serde(default = "default_feedback_poll_interval_ms")]
    pub feedback_poll_interval_ms: u64,

    /// How long a session waits for a human before going stuck
    #[serde(default = "default_feedback_timeout_secs")]
    pub feedback_timeout_secs: u64,

    /// Minimum self-reported confidence for an all-passed iteration to count
    #[serde(default = "default_success_confidence")]
    pub success_confidence_threshold: f64,

    /// Open pull requests as drafts
    #[serde(default = "default_true")]
    pub draft_prs: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            inter_iteration_delay_ms: default_inter_iteration_delay_ms(),
            feedback_poll_interval_ms: default_feedback_poll_interval_ms(),
            feedback_timeout_secs: default_feedback_timeout_secs(),
            success_confidence_threshold: default_success_confidence(),
            draft_prs: true,
        }
    }
}

impl LoopSettings {
    pub fn inter_iteration_delay(&self) -> Duration {
        Duration::from_millis(self.inter_iteration_delay_ms)
    }

    pub fn feedback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feedback_poll_interval_ms.max(1))
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_secs(self.feedback_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSettings {
    /// Upper bound on files whose content is embedded in the prompt
    #[serde(default = "default_max_key_files")]
    pub max_key_files: usize,

    /// Per-file character cap for embedded content
    #[serde(default = "default_max_file_chars")]
    pub max_file_chars: usize,

    /// Upper bound on paths listed in the repository structure section
    #[serde(default = "default_max_tree_entries")]
    pub max_tree_entries: usize,

    /// Files always considered first when present
    #[serde(default = "default_priority_files")]
    pub priority_files: Vec<String>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_key_files: default_max_key_files(),
            max_file_chars: default_max_file_chars(),
            max_tree_entries: default_max_tree_entries(),
            priority_files: default_priority_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSettings {
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Bound on a single completion call
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            api_base_url: None,
        }
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitHostSettings {
    #[serde(default = "default_git_host_url")]
    pub api_base_url: String,

    /// Bound on a single git host call
    #[serde(default = "default_host_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GitHostSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_git_host_url(),
            timeout_secs: default_host_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RollbackSettings {
    /// Force-move the branch to the target iteration's commit on partial rollback
    #[serde(default)]
    pub reset_branch: bool,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_inter_iteration_delay_ms() -> u64 {
    2_000
}

fn default_feedback_poll_interval_ms() -> u64 {
    5_000
}

fn default_feedback_timeout_secs() -> u64 {
    3_600
}

fn default_success_confidence() -> f64 {
    0.8
}

fn default_true() -> bool {
    true
}

fn default_max_key_files() -> usize {
    10
}

fn default_max_file_chars() -> usize {
    12_000
}

fn default_max_tree_entries() -> usize {
    400
}

fn default_priority_files() -> Vec<String> {
    [
        "README.md",
        "package.json",
        "Cargo.toml",
        "pyproject.toml",
        "go.mod",
        "tsconfig.json",
        "requirements.txt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}

fn default_llm_model() -> String {
    crate::llm::DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    8_192
}

fn default_llm_timeout_secs() -> u64 {
    600
}

fn default_git_host_url() -> String {
    crate::github::DEFAULT_API_BASE_URL.to_string()
}

fn default_host_timeout_secs() -> u64 {
    120
}

/// Configuration file manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a config manager for a data directory
    pub fn new(data_dir: &Path) -> Self {
        Self {
            config_path: data_dir.join("config.yaml"),
        }
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read config from file, returning defaults if not found
    pub fn read(&self) -> Result<ImplementationConfig, String> {
        if !self.config_path.exists() {
            return Ok(ImplementationConfig::default());
        }

        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        serde_yaml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    pub fn write(&self, config: &ImplementationConfig) -> Result<(), String> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content = serde_yaml::to_string(config)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| format!("Failed to write config file: {}", e))
    }

    /// Initialize config with defaults if it doesn't exist
    pub fn initialize(&self) -> Result<ImplementationConfig, String> {
        if self.exists() {
            return self.read();
        }

        let config = ImplementationConfig::default();
        self.write(&config)?;
        Ok(config)
    }

    /// Update specific fields in the config
    pub fn update<F>(&self, updater: F) -> Result<ImplementationConfig, String>
    where
        F: FnOnce(&mut ImplementationConfig),
    {
        let mut config = self.read()?;
        updater(&mut config);
        self.write(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_read_defaults_when_missing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path());

        let config = manager.read().unwrap();
        assert_eq!(config.loop_settings.max_iterations, 10);
        assert_eq!(config.loop_settings.inter_iteration_delay_ms, 2_000);
        assert_eq!(config.loop_settings.feedback_poll_interval_ms, 5_000);
        assert_eq!(config.loop_settings.feedback_timeout_secs, 3_600);
        assert_eq!(config.loop_settings.success_confidence_threshold, 0.8);
        assert!(!config.rollback.reset_branch);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "loop:\n  max_iterations: 3\nrollback:\n  reset_branch: true\n";
        let config: ImplementationConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.loop_settings.max_iterations, 3);
        assert_eq!(config.loop_settings.feedback_timeout_secs, 3_600);
        assert!(config.rollback.reset_branch);
        assert_eq!(config.context.max_key_files, 10);
        assert!(config.context.priority_files.contains(&"README.md".to_string()));
    }

    #[test]
    fn test_config_initialize_and_update() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path());

        assert!(!manager.exists());
        manager.initialize().unwrap();
        assert!(manager.exists());

        manager
            .update(|cfg| cfg.llm.timeout_secs = 30)
            .unwrap();
        let read_back = manager.read().unwrap();
        assert_eq!(read_back.llm.timeout_secs, 30);
        assert_eq!(read_back.llm.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("config.yaml"), "loop: [unclosed").unwrap();
        let manager = ConfigManager::new(temp_dir.path());
        assert!(manager.read().unwrap_err().contains("Failed to parse config file"));
    }
}
