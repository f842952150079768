//! The agent: a configured set of plugins with a lifecycle.
//!
//! [`Agent`] wraps a [`PluginManager`] with configuration, logging setup,
//! signal handling and the halt-on-error policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use conflux_runtime::Agent;
//!
//! let agent = Agent::builder()
//!     .plugin(counter)
//!     .plugin(producer)
//!     .config_file("conflux.toml")
//!     .build()?;
//!
//! // Run until Ctrl+C / SIGTERM.
//! agent.run().await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;

use serde_json::Value;
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

use conflux_core::{ContextView, Event};
use conflux_framework::{PluginDefinition, PluginFailure, PluginManager, PluginState, PluginSummary};

use crate::config::{AgentConfig, ConfigLoader, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Where an agent is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    /// Built, not started yet.
    Idle,
    /// Plugins have been started.
    Running,
    /// Stopped for good.
    Stopped,
}

/// A running (or runnable) set of plugins.
pub struct Agent {
    manager: PluginManager,
    config: AgentConfig,
    phase: Mutex<AgentPhase>,
}

impl Agent {
    /// Creates an agent builder.
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Returns the effective configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Returns the underlying plugin manager.
    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Returns the current phase.
    pub async fn phase(&self) -> AgentPhase {
        *self.phase.lock().await
    }

    /// Starts every plugin in dependency order.
    ///
    /// Plugins that fail to start are left `errored` (with their dependents)
    /// while the rest keep running, unless `halt_on_plugin_error` is set, in
    /// which case the agent stops and reports them.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut phase = self.phase.lock().await;
        match *phase {
            AgentPhase::Running => {
                warn!("Agent is already running");
                return Ok(());
            }
            AgentPhase::Stopped => return Err(RuntimeError::Stopped),
            AgentPhase::Idle => {}
        }

        info!(layers = ?self.manager.layers(), "Starting agent");
        let failed = self.manager.start().await;
        *phase = AgentPhase::Running;

        if !failed.is_empty() && self.config.agent.halt_on_plugin_error {
            error!(failed = ?failed, "Plugins failed to start, halting agent");
            self.manager.stop().await;
            *phase = AgentPhase::Stopped;
            return Err(RuntimeError::StartFailed { plugins: failed });
        }

        info!("Agent started");
        Ok(())
    }

    /// Stops every plugin in reverse dependency order.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let mut phase = self.phase.lock().await;
        if *phase == AgentPhase::Stopped {
            warn!("Agent is already stopped");
            return Ok(());
        }

        info!("Stopping agent");
        self.manager.stop().await;
        *phase = AgentPhase::Stopped;
        info!("Agent stopped");
        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        info!("Agent is now running. Press Ctrl+C to stop.");
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` completes.
    ///
    /// With `halt_on_plugin_error`, the first plugin failure also ends the run
    /// and is returned as [`RuntimeError::PluginFailed`] after stopping.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        let failures = self.manager.subscribe_failures();
        self.start().await?;

        let halted = if self.config.agent.halt_on_plugin_error {
            tokio::select! {
                () = shutdown => None,
                failure = first_failure(failures) => Some(failure),
            }
        } else {
            shutdown.await;
            None
        };

        self.stop().await?;

        match halted {
            Some(failure) => {
                error!(plugin = %failure.plugin, error = %failure.error, "Agent halted by plugin failure");
                Err(RuntimeError::PluginFailed {
                    plugin: failure.plugin,
                    error: failure.error,
                })
            }
            None => Ok(()),
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    /// Returns the lifecycle state of a plugin, if it exists.
    pub fn state(&self, plugin: &str) -> Option<PluginState> {
        self.manager.state(plugin)
    }

    /// Returns a read-only view of a plugin's context.
    pub fn context(&self, plugin: &str) -> RuntimeResult<ContextView> {
        self.manager
            .context(plugin)
            .ok_or_else(|| RuntimeError::UnknownPlugin(plugin.to_owned()))
    }

    /// Calls a plugin method from outside the plugin graph.
    pub async fn call(&self, plugin: &str, method: &str, args: Value) -> RuntimeResult<Value> {
        Ok(self.manager.call(plugin, method, args).await?)
    }

    /// Describes every plugin of the agent.
    pub fn plugins(&self) -> Vec<PluginSummary> {
        self.manager.summaries()
    }

    /// Returns plugin names grouped by start layer.
    pub fn layers(&self) -> Vec<Vec<String>> {
        self.manager.layers()
    }

    /// Observes every event emitted by any plugin.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.manager.subscribe_events()
    }

    /// Observes plugin failures.
    pub fn failures(&self) -> broadcast::Receiver<PluginFailure> {
        self.manager.subscribe_failures()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

/// Resolves with the first failure; never resolves once the channel closes.
async fn first_failure(mut failures: broadcast::Receiver<PluginFailure>) -> PluginFailure {
    loop {
        match failures.recv().await {
            Ok(failure) => return failure,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Failure observer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
        }
    }
}

/// Waits for Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal as unix_signal};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

// =============================================================================
// AgentBuilder
// =============================================================================

/// Builder for an [`Agent`].
///
/// Configuration comes from, in order of preference: an explicit
/// [`AgentConfig`], a [`ConfigLoader`], or the built-in defaults. Plugin
/// sections set with [`plugin_config`](Self::plugin_config) override the
/// loaded ones.
pub struct AgentBuilder {
    plugins: Vec<PluginDefinition>,
    plugin_configs: HashMap<String, Value>,
    config: Option<AgentConfig>,
    loader: Option<ConfigLoader>,
    init_logging: bool,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    /// Creates a builder with no plugins and logging enabled.
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            plugin_configs: HashMap::new(),
            config: None,
            loader: None,
            init_logging: true,
        }
    }

    /// Adds a plugin; definitions it depends on are pulled in automatically.
    pub fn plugin(mut self, plugin: PluginDefinition) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Adds several plugins.
    pub fn plugins(mut self, plugins: impl IntoIterator<Item = PluginDefinition>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    /// Sets the raw config section of one plugin.
    pub fn plugin_config(mut self, name: impl Into<String>, config: Value) -> Self {
        self.plugin_configs.insert(name.into(), config);
        self
    }

    /// Uses this configuration as-is.
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads configuration with this loader at build time.
    pub fn config_loader(mut self, loader: ConfigLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Loads configuration from this file (plus `CONFLUX_*` variables).
    pub fn config_file(self, path: impl AsRef<Path>) -> Self {
        self.config_loader(ConfigLoader::new().file(path))
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    /// Loads and validates configuration, then resolves and instantiates the
    /// plugins. No plugin code runs here.
    pub fn build(self) -> RuntimeResult<Agent> {
        let mut config = match (self.config, self.loader) {
            (Some(config), _) => config,
            (None, Some(loader)) => loader.load()?,
            (None, None) => AgentConfig::default(),
        };
        config.plugins.extend(self.plugin_configs);
        validate_config(&config)?;

        if self.init_logging {
            logging::init_from_config(&config.logging);
        }

        let sections: HashMap<String, Value> = config
            .plugins
            .iter()
            .map(|(name, section)| (name.clone(), section.clone()))
            .collect();
        let manager = PluginManager::new(&self.plugins, &sections, config.agent.manager_options())?;

        info!(
            plugins = ?manager.names().collect::<Vec<_>>(),
            halt_on_plugin_error = config.agent.halt_on_plugin_error,
            "Agent built"
        );

        Ok(Agent {
            manager,
            config,
            phase: Mutex::new(AgentPhase::Idle),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
