use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::correlation::DEFAULT_DELEGATION_TOOL;
use crate::transport::TransportMode;
use crate::util::paths::config_path;

/// Example configuration file contents (bundled with the binary)
pub const EXAMPLE_CONFIG: &str = include_str!("config.toml.example");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub reconnect: ReconnectSettings,
    pub history: HistorySettings,
    pub correlation: CorrelationSettings,
    pub display: DisplaySettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Live event endpoint (ws:// for websocket, http(s):// stream for sse)
    pub endpoint: String,
    /// REST base URL for conversation CRUD, history and sse actions
    pub api_base: String,
    pub transport: TransportMode,
    /// Websocket ping interval; 0 disables it
    pub heartbeat_secs: u64,
    /// How long `stop_stream` waits on the server before giving up
    pub stop_timeout_ms: u64,
    /// Upper bound on any other client action send
    pub action_timeout_ms: u64,
    /// Capacity of transport and session event channels
    pub event_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8000/ws".to_string(),
            api_base: "http://localhost:8000/api".to_string(),
            transport: TransportMode::WebSocket,
            heartbeat_secs: 30,
            stop_timeout_ms: 2000,
            action_timeout_ms: 10000,
            event_buffer: 256,
        }
    }
}

impl ConnectionSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the base delay
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistorySettings {
    pub page_size: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationSettings {
    /// Tool names that mean "delegate to a sub-agent"
    pub delegation_tools: Vec<String>,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            delegation_tools: vec![DEFAULT_DELEGATION_TOOL.to_string()],
        }
    }
}

/// Display preferences. Never required for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySettings {
    /// Hide the avatar on consecutive turns from the same role
    pub group_by_role: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            group_by_role: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConnectionConfig {
    pub endpoint: Option<String>,
    pub api_base: Option<String>,
    pub transport: Option<TransportMode>,
    pub heartbeat_secs: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub action_timeout_ms: Option<u64>,
    pub event_buffer: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlReconnectConfig {
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub jitter: Option<f64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlHistoryConfig {
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlCorrelationConfig {
    pub delegation_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlDisplayConfig {
    pub group_by_role: Option<bool>,
}

/// TOML representation of the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub connection: Option<TomlConnectionConfig>,
    pub reconnect: Option<TomlReconnectConfig>,
    pub history: Option<TomlHistoryConfig>,
    pub correlation: Option<TomlCorrelationConfig>,
    pub display: Option<TomlDisplayConfig>,
}

impl Config {
    /// Load configuration from the default location, merging with defaults.
    /// A missing or broken file yields defaults.
    pub fn load() -> Self {
        let config_file = config_path();

        // Create example config on first run
        if !config_file.exists() {
            Self::create_default_config(&config_file);
        }

        match Self::load_from(&config_file) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Using default configuration");
                Config::default()
            }
        }
    }

    /// Load a specific file. Unlike [`Config::load`], errors are returned.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let toml_config = toml::from_str::<TomlConfig>(contents)?;
        let mut config = Config::default();
        config.merge(toml_config);
        Ok(config)
    }

    fn merge(&mut self, toml_config: TomlConfig) {
        if let Some(connection) = toml_config.connection {
            if let Some(endpoint) = connection.endpoint {
                self.connection.endpoint = endpoint;
            }
            if let Some(api_base) = connection.api_base {
                self.connection.api_base = api_base;
            }
            if let Some(transport) = connection.transport {
                self.connection.transport = transport;
            }
            if let Some(heartbeat_secs) = connection.heartbeat_secs {
                self.connection.heartbeat_secs = heartbeat_secs;
            }
            if let Some(stop_timeout_ms) = connection.stop_timeout_ms {
                self.connection.stop_timeout_ms = stop_timeout_ms;
            }
            if let Some(action_timeout_ms) = connection.action_timeout_ms {
                self.connection.action_timeout_ms = action_timeout_ms;
            }
            if let Some(event_buffer) = connection.event_buffer {
                self.connection.event_buffer = event_buffer.max(1);
            }
        }

        if let Some(reconnect) = toml_config.reconnect {
            if let Some(initial_delay_ms) = reconnect.initial_delay_ms {
                self.reconnect.initial_delay_ms = initial_delay_ms;
            }
            if let Some(max_delay_ms) = reconnect.max_delay_ms {
                self.reconnect.max_delay_ms = max_delay_ms;
            }
            if let Some(multiplier) = reconnect.multiplier {
                self.reconnect.multiplier = multiplier.max(1.0);
            }
            if let Some(jitter) = reconnect.jitter {
                self.reconnect.jitter = jitter.clamp(0.0, 1.0);
            }
            if let Some(max_attempts) = reconnect.max_attempts {
                self.reconnect.max_attempts = max_attempts;
            }
        }

        if let Some(history) = toml_config.history {
            if let Some(page_size) = history.page_size {
                self.history.page_size = page_size.max(1);
            }
        }

        if let Some(correlation) = toml_config.correlation {
            if let Some(delegation_tools) = correlation.delegation_tools {
                self.correlation.delegation_tools = delegation_tools;
            }
        }

        if let Some(display) = toml_config.display {
            if let Some(group_by_role) = display.group_by_role {
                self.display.group_by_role = group_by_role;
            }
        }
    }

    /// Create the default config file from the bundled example
    fn create_default_config(path: &Path) {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                if let Err(e) = fs::create_dir_all(parent) {
                    tracing::warn!(error = %e, "Failed to create config directory");
                    return;
                }
            }
        }

        if let Err(e) = fs::write(path, EXAMPLE_CONFIG) {
            tracing::warn!(error = %e, "Failed to write default config");
        }
    }
}
