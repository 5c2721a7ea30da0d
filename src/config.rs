//! Application configuration management.
//!
//! Settings are layered with figment, lowest priority first:
//!
//! 1. built-in defaults
//! 2. the TOML config file (`dbfixture.toml` unless another path is given)
//! 3. `DBFIXTURE_*` environment variables, `__` separating nested sections
//!    (`DBFIXTURE_BUILD__PROJECT_NAME` sets `build.project_name`)

use std::fs;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::build::BuildSettings;
use crate::db::{DriverKind, MysqlSettings};

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dbfixture.toml";
/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "DBFIXTURE_";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] figment::Error),

    #[error("could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the file-based driver keeps its databases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSettings {
    pub directory: PathBuf,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".dbfixture/databases"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverKind,
    pub sqlite: SqliteSettings,
    pub mysql: MysqlSettings,
    pub build: BuildSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverKind::Sqlite,
            sqlite: SqliteSettings::default(),
            mysql: MysqlSettings::default(),
            build: BuildSettings::default(),
        }
    }
}

impl Config {
    /// The provider chain for `path`, or the default config file.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        let file = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf);
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load the configuration, failing on a missing explicit file or on
    /// invalid values.
    pub fn try_load_from_path(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
        }
        Ok(Self::figment(path).extract()?)
    }

    /// Load the configuration, falling back to defaults on any error.
    #[must_use]
    pub fn load_from_path(path: Option<&Path>) -> Self {
        match Self::try_load_from_path(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Write the configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
