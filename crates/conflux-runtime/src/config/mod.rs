//! Configuration for the Conflux agent runtime.
//!
//! Configuration is layered with figment (defaults, files, `CONFLUX_*`
//! environment variables, programmatic merges), then checked by
//! [`validate_config`] before any plugin is instantiated.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    AgentConfig, AgentSettings, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    SpanEventConfig,
};
pub use validation::validate_config;
