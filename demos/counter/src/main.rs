//! Counter Demo
//!
//! Three plugins:
//!
//! ```text
//! producer ──(directed "increment")──▶ counter ──(broadcast "changed")──▶ gate
//! ```
//!
//! - `counter` owns a `count` and exposes an `add` method.
//! - `producer` depends on `counter` and sends it one `increment` per tick.
//! - `gate` depends on `counter`, intercepts its `changed` events and only
//!   lets even counts through to its service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package counter-demo -- --ticks 10
//! CONFLUX_PLUGINS__PRODUCER__INTERVAL_MS=100 cargo run --package counter-demo
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use conflux::prelude::*;
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug, Parser)]
#[command(about = "Run the Conflux counter demo")]
struct Args {
    /// Configuration file (defaults to searching for conflux.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many ticks instead of waiting for Ctrl+C.
    #[arg(short, long)]
    ticks: Option<u64>,
}

// ============================================================================
// Plugins
// ============================================================================

fn counter() -> Result<PluginDefinition> {
    let definition = PluginDefinition::builder("counter")
        .metadata(PluginMetadata::new("0.1.0").description("Counts increments"))
        .context(Schema::object([("count", Schema::Integer)]), json!({ "count": 0 }))
        .events([
            ("increment", None),
            ("changed", Some(Schema::object([("count", Schema::Integer)]))),
        ])
        .effect("increment", |scope: PluginScope, event: Event| async move {
            if event.is("increment") {
                scope.context().update_as("count", |n: i64| n + 1)?;
                let count = scope.context().get_key("count").unwrap_or_default();
                scope.emit("changed", json!({ "count": count }))?;
            }
            Ok::<_, BoxError>(())
        })
        .method(
            "add",
            MethodSignature::new(Schema::Integer, Schema::Integer),
            |scope: PluginScope, amount: Value| async move {
                let amount = amount.as_i64().unwrap_or_default();
                scope.context().update_as("count", |n: i64| n + amount)?;
                Ok::<_, BoxError>(scope.context().get_key("count").unwrap_or_default())
            },
        )
        .build()?;
    Ok(definition)
}

fn producer(counter: &PluginDefinition) -> Result<PluginDefinition> {
    let definition = PluginDefinition::builder("producer")
        .dependencies([counter])
        .config(
            Schema::object([("interval_ms", Schema::Integer.with_default(json!(500)))])
                .with_default(json!({})),
        )
        .service("tick", |scope: ServiceScope, _events: EventStream| async move {
            let interval = scope.config()["interval_ms"].as_u64().unwrap_or(500);
            let Some(counter) = scope.dependency("counter") else {
                return Err::<(), BoxError>("counter is not bound".into());
            };
            let mut ticker = tokio::time::interval(Duration::from_millis(interval));
            loop {
                tokio::select! {
                    () = scope.cancellation().cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        counter.emit("increment", None)?;
                    }
                }
            }
        })
        .build()?;
    Ok(definition)
}

fn gate(counter: &PluginDefinition) -> Result<PluginDefinition> {
    let definition = PluginDefinition::builder("gate")
        .dependencies([counter])
        .interceptor_for("even-only", "counter", |call: Intercept| async move {
            match call.event.field("count").and_then(Value::as_i64) {
                Some(n) if n % 2 == 0 => call.forward(),
                _ => call.drop("odd count"),
            }
            Ok::<_, BoxError>(())
        })
        .service("report", |scope: ServiceScope, events: EventStream| async move {
            while let Some(event) = events.next_until(scope.cancellation()).await {
                info!(count = ?event.field("count"), "Even count reached");
            }
            Ok::<_, BoxError>(())
        })
        .build()?;
    Ok(definition)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new().with_current_dir();
    if let Some(path) = &args.config {
        loader = loader.file(path);
    }

    let counter = counter()?;
    let agent = Agent::builder()
        .plugin(producer(&counter)?)
        .plugin(gate(&counter)?)
        .config_loader(loader)
        .build()?;

    for plugin in agent.plugins() {
        info!(plugin = %plugin.name, layer = plugin.layer, deps = ?plugin.dependencies, "Loaded plugin");
    }

    match args.ticks {
        Some(ticks) => {
            let view = agent.context("counter")?;
            let done = async move {
                loop {
                    let count = view.get_key("count").and_then(|v| v.as_u64());
                    if count.unwrap_or_default() >= ticks {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            };
            agent.run_until(done).await?;
        }
        None => agent.run().await?,
    }

    info!(final_count = ?agent.context("counter")?.get_key("count"), "Done");
    Ok(())
}
