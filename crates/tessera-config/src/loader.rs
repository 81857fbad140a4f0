//! Configuration loader with multi-source merging

use crate::{ConfigError, Paths, TesseraConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default deployment directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "TESSERA".to_string(),
            include_user_config: true,
        }
    }

    /// Set the deployment directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "TESSERA")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip `~/.config/tessera/config.toml`.
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    fn toml_source(path: PathBuf) -> impl config::Source + Send + Sync + 'static {
        config::File::from(path)
            .required(false)
            .format(config::FileFormat::Toml)
    }

    /// Load configuration from all sources with proper precedence, then validate.
    pub fn load(self) -> Result<TesseraConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = TesseraConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/tessera/config.toml)
        if self.include_user_config {
            if let Ok(user_config_file) = Paths::new().user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(Self::toml_source(user_config_file));
                }
            }
        }

        // 3. Deployment config (tessera.toml)
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(Self::toml_source(project_config_file));
        }

        // 4. Local config (tessera.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(Self::toml_source(local_config_file));
        }

        // 5. Environment variables (TESSERA_TIMEOUTS__RETRY_LIMIT=5)
        // Field names contain underscores, so nesting uses a double underscore.
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder
            .build()
            .map_err(|e| ConfigError::MergeError(e.to_string()))?;

        let tessera_config: TesseraConfig = merged
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        tessera_config.validate()?;
        Ok(tessera_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> TesseraConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .without_user_config()
            .with_env_prefix("TESSERA_LOADER_TEST")
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config, TesseraConfig::default());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[replica]
id = 2
total_replicas = 7

[timeouts]
retry_limit = 5

[consensus]
unsigned_allowed = ["ACK", "FAULT-DETECTION"]

[[peers]]
id = 0
address = "10.0.0.1:7400"
"#;
        fs::write(project_dir.join("tessera.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.replica.id, 2);
        assert_eq!(config.replica.total_replicas, 7);
        assert_eq!(config.timeouts.retry_limit, 5);
        // Untouched keys keep their defaults
        assert_eq!(config.timeouts.ack_timeout_ms, 10_000);
        assert_eq!(config.consensus.unsigned_allowed.len(), 2);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].address, "10.0.0.1:7400");
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("tessera.toml"),
            r#"
[timeouts]
retry_interval_ms = 2000
"#,
        )
        .expect("Failed to write deployment config");

        fs::write(
            project_dir.join("tessera.local.toml"),
            r#"
[timeouts]
retry_interval_ms = 250
"#,
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.timeouts.retry_interval_ms, 250);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("tessera.toml"),
            r#"
[replica]
id = 9
total_replicas = 4
"#,
        )
        .expect("Failed to write config");

        assert!(loader(project_dir).load().is_err());
        assert_eq!(loader(project_dir).load_or_default(), TesseraConfig::default());
    }
}
