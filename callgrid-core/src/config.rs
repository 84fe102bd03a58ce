use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub signal: SignalConfig,
    pub logging: LoggingConfig,
}

/// Media engine worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of engine workers to spawn at process start.
    pub num_workers: usize,
    /// Low end of the UDP port range handed to each worker.
    pub rtc_min_port: u16,
    /// High end of the UDP port range handed to each worker.
    pub rtc_max_port: u16,
    /// Log level forwarded to the engine workers.
    pub worker_log_level: String,
    /// Delay between a worker death and process exit, allowing the fatal
    /// log line to flush.
    pub death_grace_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            worker_log_level: "warn".to_string(),
            death_grace_seconds: 2,
        }
    }
}

/// Signaling plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// How long the server waits on an in-flight operation before answering
    /// the request with a timeout error. The operation itself keeps running
    /// to completion so registry state stays consistent.
    pub rpc_timeout_seconds: u64,
    /// Period of the online-users heartbeat broadcast.
    pub presence_heartbeat_seconds: u64,
    /// Maximum peers per room (0 = unlimited).
    pub max_peers_per_room: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_seconds: 4,
            presence_heartbeat_seconds: 30,
            max_peers_per_room: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file with `CALLGRID_`
    /// environment overrides (`CALLGRID_ENGINE__NUM_WORKERS=4`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("CALLGRID").separator("__"));
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.num_workers, 1);
        assert_eq!(config.signal.rpc_timeout_seconds, 4);
        assert_eq!(config.signal.max_peers_per_room, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_without_file() {
        let config = Config::load(None).expect("load");
        assert_eq!(config.engine.rtc_min_port, 40000);
        assert!(config.engine.rtc_min_port < config.engine.rtc_max_port);
    }
}
