mod settings;

pub use settings::{
    Config, ConfigError, ConnectionSettings, CorrelationSettings, DisplaySettings,
    HistorySettings, ReconnectSettings, EXAMPLE_CONFIG,
};
