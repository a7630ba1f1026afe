//! Configuration loading for the hub client.
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/tui/config.toml` (system)
//! 2. `~/.config/tui/config.toml` (user)
//! 3. `./tui.toml` (local override) or a path given on the command line
//! 4. Environment variables (`TUI_*`, `RUST_LOG`, `OTEL_EXPORTER_OTLP_ENDPOINT`)
//!
//! # Example Config
//!
//! ```toml
//! [hub]
//! host = "hub35m.apo.nmsu.edu"
//! port = 9877
//! commander = "UW01.alice"
//!
//! [connection]
//! check_interval = 5.0
//! max_entry_age = 60.0
//! probe_timeout = 5.0
//!
//! [telemetry]
//! log_level = "info"
//!
//! [clock]
//! max_time_err = 10.0
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{ClockConfig, ConnectionConfig, HubSection, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub clock: ClockConfig,
}

impl HubConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional explicit file, then apply env overrides.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table_from_file(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = Self::from_table(merged, Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Parse a single TOML document (missing sections take defaults).
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let path = Path::new("<string>");
        let table = loader::parse_table(contents, path)?;
        let config = Self::from_table(table, path)?;
        config.validate()?;
        Ok(config)
    }

    fn from_table(table: toml::Table, path: &Path) -> Result<Self, ConfigError> {
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.commander.trim().is_empty() {
            return Err(ConfigError::Invalid("hub.commander must not be empty".into()));
        }
        if self.hub.commander.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "hub.commander {:?} must not contain whitespace",
                self.hub.commander
            )));
        }
        if self.connection.max_line_len == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_line_len must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self).unwrap_or_default();
        format!("# Hub client configuration\n\n{}", body)
    }
}
