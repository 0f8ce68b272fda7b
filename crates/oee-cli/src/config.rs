//! Configuration loading and management.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use oee_refresh::SchedulerConfig;
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Background refresh settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("oee.db"),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: built-in defaults, `config.toml` in the user
    /// config directory, the given file, then `OEE_*` environment variables
    /// (`OEE_SCHEDULER__WORKERS=8` sets `scheduler.workers`).
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("OEE_").split("__"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory for oee.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("oee"))
}

/// Returns the platform-specific data directory for oee.
///
/// On Linux: `~/.local/share/oee`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("oee"))
}
