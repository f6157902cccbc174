use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrataConfig {
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Author recorded on commits when the caller does not name one.
    pub default_author: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_strata_dir()
            .join("store.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_author: "anonymous".into(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Returns `~/.strata/`
pub fn default_strata_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".strata")
}

/// Returns the default config file path: `~/.strata/config.toml`
pub fn default_config_path() -> PathBuf {
    default_strata_dir().join("config.toml")
}

impl StrataConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            StrataConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (STRATA_DB, STRATA_AUTHOR,
    /// STRATA_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STRATA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("STRATA_AUTHOR") {
            self.session.default_author = val;
        }
        if let Ok(val) = std::env::var("STRATA_LOG_LEVEL") {
            self.log.level = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StrataConfig::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.session.default_author, "anonymous");
        assert!(config.storage.db_path.ends_with("store.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[storage]
db_path = "/tmp/test.db"

[session]
default_author = "alex"
"#;
        let config: StrataConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.session.default_author, "alex");
        // defaults still apply for unset fields
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = StrataConfig::default();
        std::env::set_var("STRATA_DB", "/tmp/override.db");
        std::env::set_var("STRATA_AUTHOR", "env-author");
        std::env::set_var("STRATA_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.session.default_author, "env-author");
        assert_eq!(config.log.level, "trace");

        // Clean up
        std::env::remove_var("STRATA_DB");
        std::env::remove_var("STRATA_AUTHOR");
        std::env::remove_var("STRATA_LOG_LEVEL");
    }
}
