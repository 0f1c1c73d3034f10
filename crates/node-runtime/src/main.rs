//! # Meshbus Node
//!
//! Runs a single node against the in-process broker: attaches an echo
//! service and a calculator RPC service, exercises them once and then
//! serves until Ctrl-C.
//!
//! ## Startup Sequence
//!
//! 1. Initialize telemetry (`MB_LOG_LEVEL`, `MB_JSON_LOGS`, ...)
//! 2. Load `NodeConfig` from `MB_*` variables
//! 3. Connect the node and attach services
//! 4. Signal ready, wait for shutdown
//! 5. Dispose the node

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use mb_03_service_dispatch::FnBehavior;
use meshbus_telemetry::{init_telemetry, TelemetryConfig};
use node_runtime::{AskOptions, Node, NodeConfig, NodeEvent, RpcBehavior, RpcClient};
use shared_bus::InMemoryBroker;
use shared_types::{Envelope, Headers, ServiceAddress, ServiceConfiguration};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::for_service("meshbus-node"))
        .context("failed to initialize telemetry")?;

    let config = NodeConfig::from_env().context("invalid node configuration")?;
    info!(app = %config.app_id, version = %config.app_version, "Starting Meshbus node");

    let broker = Arc::new(InMemoryBroker::new());
    let node = Node::connect(broker, config)
        .await
        .context("failed to connect node")?;
    spawn_event_logger(&node);

    let echo = ServiceAddress::parse("demo:echo")?;
    node.attach(
        echo.clone(),
        ServiceConfiguration::default(),
        Arc::new(FnBehavior::new(|envelope: Envelope| async move {
            if envelope.can_reply() {
                envelope.reply(envelope.body.clone(), Headers::new()).await?;
            }
            Ok::<(), anyhow::Error>(())
        })),
    )
    .await?;

    let calculator = ServiceAddress::parse("demo:calculator")?;
    let behavior = RpcBehavior::new(node.serializers())
        .operation("Calculator", "add", |(a, b): (i64, i64), _env| async move {
            Ok::<_, anyhow::Error>(a + b)
        })
        .operation("Calculator", "mul", |(a, b): (i64, i64), _env| async move {
            Ok::<_, anyhow::Error>(a * b)
        });
    node.attach(calculator.clone(), ServiceConfiguration::default(), Arc::new(behavior))
        .await?;

    let reply = node
        .ask(
            &echo,
            b"hello".to_vec(),
            AskOptions::new().with_timeout(Duration::from_secs(5)),
        )
        .await?;
    info!(reply = %String::from_utf8_lossy(&reply.body), "Echo round trip complete");

    let client = RpcClient::new(node.clone(), calculator, "Calculator");
    let sum: i64 = client.call("add", &(2, 3)).await?;
    info!(sum, "RPC round trip complete");

    info!(services = node.services().len(), "Node ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    node.dispose().await;
    Ok(())
}

/// Log owner notifications until the node goes away.
fn spawn_event_logger(node: &Node) {
    let mut events = node.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NodeEvent::Faulted { reason } => warn!(reason, "Node faulted"),
                other => info!(event = ?other, "Node event"),
            }
        }
    });
}
