//! Configuration loader.
//!
//! Resolves an explicit path, the `HERMES_CONFIG` environment variable, or
//! `hermes.yaml` in the working directory, in that order. There is no merge
//! chain: one deployment, one file.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;
use crate::HermesConfig;

/// Configuration file name probed in the working directory.
const CONFIG_FILE_NAME: &str = "hermes.yaml";

/// Environment variable overriding the config path.
const CONFIG_ENV_VAR: &str = "HERMES_CONFIG";

/// Loads and validates the HermesIndex configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Create a new loader.
    pub fn new() -> Self {
        Self
    }

    /// Resolve the config path from an optional CLI argument.
    pub fn resolve_path(&self, explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            return PathBuf::from(env_path);
        }
        PathBuf::from(CONFIG_FILE_NAME)
    }

    /// Load and validate configuration from the resolved path.
    pub fn load(&self, explicit: Option<&Path>) -> Result<HermesConfig, ConfigError> {
        let path = self.resolve_path(explicit);
        if !path.exists() {
            return Err(ConfigError::NotFound { path });
        }

        debug!("Loading config from {:?}", path);
        let config = load_config_file(&path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document directly.
    ///
    /// Used by tests and by callers that already hold the file contents.
    pub fn load_str(&self, content: &str) -> Result<HermesConfig, ConfigError> {
        let config: HermesConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::parse_yaml(CONFIG_FILE_NAME, e))?;
        config.validate()?;
        Ok(config)
    }
}

/// Load a configuration file from disk.
fn load_config_file(path: &Path) -> Result<HermesConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::parse_yaml(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
postgres:
  dsn: postgres://localhost/db
embedding:
  url: http://localhost:9100
sources:
  - name: torrents
    table_or_view: torrents
    id_field: info_hash
    text_field: name
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let loader = ConfigLoader::new();
        let config = loader.load(Some(file.path())).unwrap();
        assert_eq!(config.sources[0].name, "torrents");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let loader = ConfigLoader::new();
        let err = loader
            .load(Some(Path::new("/nonexistent/hermes.yaml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_load_str_validates() {
        let loader = ConfigLoader::new();
        assert!(loader.load_str(MINIMAL).is_ok());
        // Missing sources fails validation, not parsing
        let err = loader
            .load_str("postgres:\n  dsn: postgres://x/y\nembedding:\n  url: http://e\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_resolve_explicit_path_wins() {
        let loader = ConfigLoader::new();
        let path = loader.resolve_path(Some(Path::new("/etc/hermes/custom.yaml")));
        assert_eq!(path, PathBuf::from("/etc/hermes/custom.yaml"));
    }
}
