//! Conflux Runtime: the agent layer of the Conflux plugin framework.
//!
//! This crate provides:
//! - The [`Agent`] and its builder: a configured plugin set with a lifecycle
//! - Layered configuration via figment (`conflux.toml`, `CONFLUX_*` variables)
//! - Logging setup over `tracing-subscriber`
//! - Signal handling (Ctrl+C / SIGTERM) and the halt-on-plugin-error policy
//!
//! ```ignore
//! use conflux_runtime::{Agent, ConfigLoader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let agent = Agent::builder()
//!         .plugin(counter())
//!         .config_loader(ConfigLoader::new().with_current_dir())
//!         .build()?;
//!
//!     agent.run().await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod logging;

pub use agent::{Agent, AgentBuilder, AgentPhase, shutdown_signal};
pub use config::{
    AgentConfig, AgentSettings, ConfigError, ConfigLoader, ConfigResult, LogFormat, LogLevel,
    LogOutput, LogRotation, LoggingConfig, Profile,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
