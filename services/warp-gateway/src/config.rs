//! Configuration types and loading
//!
//! Settings live in `config/settings.json`. Every field is defaulted, so a
//! missing file starts the gateway with a sane configuration; only an
//! unreadable accounts directory is fatal at startup.

use std::path::{Path, PathBuf};

use common::{Error, Result};
use serde::Deserialize;
use tracing::info;

use warp_pool::{PoolPolicy, Strategy};
use warp_wire::HistoryLimits;

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Account selection strategy
    pub strategy: Strategy,
    /// Minutes before a 429-marked account re-enters the pool
    pub retry_429_interval: i64,
    /// Persist token rotations and status marks to the accounts directory
    pub auto_save_tokens: bool,
    /// Strip the upstream's built-in tool lists from every request
    pub disable_warp_tools: bool,
    pub max_history_messages: usize,
    pub max_tool_results: usize,
    /// Send multiple tool results as separate upstream requests
    pub split_toolcall_result: bool,
    /// Run the seed-session handshake for every account at startup
    pub init_sessions_on_startup: bool,
    /// Seconds to sleep between serial identity calls
    pub refresh_delay_secs: u64,
    pub accounts_dir: PathBuf,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            retry_429_interval: 60,
            auto_save_tokens: true,
            disable_warp_tools: false,
            max_history_messages: 20,
            max_tool_results: 10,
            split_toolcall_result: false,
            init_sessions_on_startup: false,
            refresh_delay_secs: 1,
            accounts_dir: PathBuf::from("config/accounts/warp"),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "settings file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(settings)
    }

    /// `--config <path>` override, else the conventional location.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        cli_path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config/settings.json"))
    }

    pub fn policy(&self) -> PoolPolicy {
        PoolPolicy {
            strategy: self.strategy,
            retry_429_interval: self.retry_429_interval,
            auto_save: self.auto_save_tokens,
        }
    }

    pub fn limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_history_messages: self.max_history_messages,
            max_tool_results: self.max_tool_results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.strategy, Strategy::RoundRobin);
        assert_eq!(settings.retry_429_interval, 60);
        assert!(settings.auto_save_tokens);
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"strategy": "quota-aware", "server": {"port": 9100}}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.strategy, Strategy::QuotaAware);
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.max_history_messages, 20);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{oops").unwrap();
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn resolve_path_prefers_cli() {
        assert_eq!(
            Settings::resolve_path(Some("/etc/warp/settings.json")),
            PathBuf::from("/etc/warp/settings.json")
        );
        assert_eq!(
            Settings::resolve_path(None),
            PathBuf::from("config/settings.json")
        );
    }
}
