// Credentials for the git host and the LLM provider
//
// Stored in {data_dir}/secrets.toml, never in config.yaml. Values given on the
// command line or in the environment take precedence over the file.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Contents of secrets.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SecretsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
}

impl SecretsConfig {
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("secrets.toml")
    }

    /// Load secrets, returning an empty set if the file does not exist
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path_in(data_dir);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read secrets file '{}': {}", path.display(), e))?;

        toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse secrets file '{}': {}", path.display(), e))
    }

    /// Save secrets with owner-only permissions
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir).map_err(|e| {
            anyhow!(
                "Failed to create data directory '{}': {}",
                data_dir.display(),
                e
            )
        })?;

        let path = Self::path_in(data_dir);
        let contents = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize secrets: {}", e))?;
        fs::write(&path, contents)
            .map_err(|e| anyhow!("Failed to write secrets file '{}': {}", path.display(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(|e| {
                anyhow!(
                    "Failed to set permissions on secrets file '{}': {}",
                    path.display(),
                    e
                )
            })?;
        }

        log::info!("Saved secrets to: {}", path.display());
        Ok(())
    }

    /// Prefer an explicit value, falling back to the file
    pub fn resolve(explicit: Option<String>, stored: &Option<String>) -> Option<String> {
        explicit
            .filter(|v| !v.trim().is_empty())
            .or_else(|| stored.clone().filter(|v| !v.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        assert_eq!(SecretsConfig::load(temp.path()).unwrap(), SecretsConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let secrets = SecretsConfig {
            github_token: Some("ghp_123".to_string()),
            anthropic_api_key: None,
        };
        secrets.save(temp.path()).unwrap();

        let raw = fs::read_to_string(SecretsConfig::path_in(temp.path())).unwrap();
        assert!(raw.contains("github_token"));
        assert!(!raw.contains("anthropic_api_key"));

        assert_eq!(SecretsConfig::load(temp.path()).unwrap(), secrets);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        SecretsConfig::default().save(temp.path()).unwrap();
        let mode = fs::metadata(SecretsConfig::path_in(temp.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_resolve_prefers_explicit_value() {
        let stored = Some("from-file".to_string());
        assert_eq!(
            SecretsConfig::resolve(Some("from-env".to_string()), &stored).as_deref(),
            Some("from-env")
        );
        assert_eq!(
            SecretsConfig::resolve(Some("  ".to_string()), &stored).as_deref(),
            Some("from-file")
        );
        assert_eq!(SecretsConfig::resolve(None, &None), None);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        fs::write(SecretsConfig::path_in(temp.path()), "github_token = [").unwrap();
        assert!(SecretsConfig::load(temp.path()).is_err());
    }
}
