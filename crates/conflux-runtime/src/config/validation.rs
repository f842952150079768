//! Configuration validation utilities.

use std::collections::BTreeMap;

use super::error::{ConfigError, ConfigResult};
use super::schema::{AgentConfig, AgentSettings, LogOutput, LoggingConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &AgentConfig) -> ConfigResult<()> {
    validate_agent_settings(&config.agent)?;
    validate_logging_config(&config.logging)?;
    validate_plugin_sections(&config.plugins)?;
    Ok(())
}

fn validate_agent_settings(settings: &AgentSettings) -> ConfigResult<()> {
    if settings.stop_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "agent.stop_timeout_ms must be greater than 0",
        ));
    }
    if settings.event_buffer == 0 {
        return Err(ConfigError::validation(
            "agent.event_buffer must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.output = \"file\" requires logging.file_path",
        ));
    }
    if let Some(target) = logging.filters.keys().find(|t| t.trim().is_empty()) {
        return Err(ConfigError::validation(format!(
            "Invalid log filter target: {target:?}"
        )));
    }
    Ok(())
}

/// Plugin sections are either tables or absent; anything else is a typo.
fn validate_plugin_sections(plugins: &BTreeMap<String, serde_json::Value>) -> ConfigResult<()> {
    for (name, section) in plugins {
        if !(section.is_object() || section.is_null()) {
            return Err(ConfigError::validation(format!(
                "plugins.{name} must be a table, found {section}"
            )));
        }
    }
    Ok(())
}
