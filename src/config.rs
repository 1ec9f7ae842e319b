//! Persisted client settings.
//!
//! The file lives at `~/.luxbox.yaml` unless another path is given. Loading
//! never fails: a missing, unreadable or malformed file yields the defaults,
//! and any field absent from the file keeps its default value. Saving always
//! writes the complete structure, replacing the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::protocol::{DEFAULT_HOST, DEFAULT_PORT};

pub const CONFIG_FILE: &str = ".luxbox.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the home directory")]
    NoHomeDir,
    #[error("failed to write configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub user: UserConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub user: String,
    pub token: String,
}

impl UserConfig {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.token.is_empty()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(s) => s,
        Port::Number(n) => n.to_string(),
    })
}

/// Reads and writes [`Config`] at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for `~/.luxbox.yaml`.
    pub fn in_home_dir() -> Result<Self> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(Self::new(home.join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Config {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {:?}, using defaults", self.path);
                return Config::default();
            }
            Err(e) => {
                warn!("Failed to read configuration {:?}: {}", self.path, e);
                return Config::default();
            }
        };

        match serde_yaml::from_str::<Option<Config>>(&content) {
            Ok(config) => config.unwrap_or_default(),
            Err(e) => {
                warn!("Failed to parse configuration {:?}: {}", self.path, e);
                Config::default()
            }
        }
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        let content = serde_yaml::to_string(config)?;
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&self.path, content).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }

        debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }
}
