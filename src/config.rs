use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::command::dispatcher::CommandConfig;
use crate::mqtt::config::BrokerConfig;
use crate::registry::handle::RegistryConfig;
use crate::sources::database::DatabaseConfig;
use crate::sources::device_http::DeviceHttpConfig;

const CONFIG_DIR: &str = ".config/relaydeck";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "RELAYDECK_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Fails on an unknown level name. Runs before logging is set up, so the
    /// caller reports the error.
    pub fn level(&self) -> Result<tracing::Level> {
        self.level
            .trim()
            .parse()
            .map_err(|_| eyre!("Unknown log level {:?}", self.level))
    }
}

/// Everything the core needs, one section per component.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub device_http: DeviceHttpConfig,
    pub registry: RegistryConfig,
    pub commands: CommandConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// `$RELAYDECK_CONFIG`, else `~/.config/relaydeck/config.toml`.
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            return Self::load(path).await;
        }

        info!("No config at {}, writing defaults", path.display());
        let config = Self::default();
        config.save(path).await?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        tokio::fs::write(path, self.to_toml_string()?)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
