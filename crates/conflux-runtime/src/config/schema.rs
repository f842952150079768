//! Configuration schema definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use conflux_framework::ManagerOptions;
use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Agent-wide behaviour.
    #[serde(default)]
    pub agent: AgentSettings,

    /// Raw configuration input per plugin, keyed by plugin name.
    ///
    /// Each section is validated against the plugin's config schema when the
    /// agent is built.
    #[serde(default)]
    pub plugins: BTreeMap<String, serde_json::Value>,
}

// =============================================================================
// Agent settings
// =============================================================================

/// Agent-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// How long a stopping plugin may take to drain its tasks.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Stop the whole agent as soon as any plugin fails.
    #[serde(default)]
    pub halt_on_plugin_error: bool,

    /// Capacity of the event and failure observer channels.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            halt_on_plugin_error: false,
            event_buffer: default_event_buffer(),
        }
    }
}

impl AgentSettings {
    /// Returns the stop timeout as a [`Duration`].
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Converts to the options the plugin manager understands.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            stop_timeout: self.stop_timeout(),
            event_buffer: self.event_buffer,
        }
    }
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_event_buffer() -> usize {
    256
}

// =============================================================================
// Logging
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Output destination.
    #[serde(default)]
    pub output: LogOutput,

    /// Log file path, required when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Log file rotation.
    #[serde(default)]
    pub rotation: LogRotation,

    /// Which span lifecycle events are logged.
    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Include thread ids.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include source file and line.
    #[serde(default)]
    pub file_location: bool,

    /// Per-target level overrides, e.g. `conflux_framework = "debug"`.
    #[serde(default)]
    pub filters: BTreeMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            rotation: LogRotation::Never,
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            filters: BTreeMap::new(),
        }
    }
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the level as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Newline-delimited JSON; needs the `json-log` feature.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Log file rotation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Span lifecycle events to log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.agent.event_buffer, 256);
        assert!(!config.agent.halt_on_plugin_error);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "agent": { "halt_on_plugin_error": true },
            "logging": { "level": "debug", "filters": { "conflux_framework": "trace" } },
            "plugins": { "counter": { "step": 2 } }
        }))
        .unwrap();

        assert!(config.agent.halt_on_plugin_error);
        assert_eq!(config.agent.stop_timeout_ms, 5000);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.filters["conflux_framework"], LogLevel::Trace);
        assert_eq!(config.plugins["counter"]["step"], 2);
    }

    #[test]
    fn test_unknown_level_rejected() {
        let result: Result<LoggingConfig, _> =
            serde_json::from_value(serde_json::json!({ "level": "loud" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_manager_options() {
        let settings = AgentSettings {
            stop_timeout_ms: 250,
            halt_on_plugin_error: false,
            event_buffer: 8,
        };
        let options = settings.manager_options();
        assert_eq!(options.stop_timeout, Duration::from_millis(250));
        assert_eq!(options.event_buffer, 8);
    }
}
