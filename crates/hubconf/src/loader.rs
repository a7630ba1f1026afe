//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, HubConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/tui/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("tui/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("tui.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a config file as a raw TOML table.
pub fn load_table_from_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`; nested tables merge key by key, anything else
/// is replaced.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut HubConfig, sources: &mut ConfigSources) {
    apply_env_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary variable lookup (tests pass a map).
pub fn apply_env_overrides_from<F>(config: &mut HubConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("TUI_HUB_HOST") {
        config.hub.host = v;
        sources.env_overrides.push("TUI_HUB_HOST".to_string());
    }
    if let Some(v) = lookup("TUI_HUB_PORT") {
        if let Ok(port) = v.parse() {
            config.hub.port = port;
            sources.env_overrides.push("TUI_HUB_PORT".to_string());
        }
    }
    if let Some(v) = lookup("TUI_COMMANDER") {
        config.hub.commander = v;
        sources.env_overrides.push("TUI_COMMANDER".to_string());
    }

    // Connection tuning
    if let Some(v) = lookup("TUI_CHECK_INTERVAL") {
        if let Ok(secs) = v.parse() {
            config.connection.check_interval = secs;
            sources.env_overrides.push("TUI_CHECK_INTERVAL".to_string());
        }
    }
    if let Some(v) = lookup("TUI_MAX_ENTRY_AGE") {
        if let Ok(secs) = v.parse() {
            config.connection.max_entry_age = secs;
            sources.env_overrides.push("TUI_MAX_ENTRY_AGE".to_string());
        }
    }

    // Telemetry
    if let Some(v) = lookup("TUI_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
        sources.env_overrides.push("TUI_OTLP_ENDPOINT".to_string());
    }
    // Also support standard OTEL env var
    if let Some(v) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
        sources.env_overrides.push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }
    if let Some(v) = lookup("TUI_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("TUI_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
