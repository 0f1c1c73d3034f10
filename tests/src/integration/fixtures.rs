//! Shared test fixtures: broker, fast node configuration, small behaviors.

use mb_03_service_dispatch::{FnBehavior, ServiceBehavior};
use node_runtime::{Node, NodeConfig, NodeEvent};
use shared_bus::InMemoryBroker;
use shared_types::{Headers, ServiceAddress};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bound for any single scenario step.
pub(crate) const STEP: Duration = Duration::from_secs(5);

/// Short timeouts and a quick reconnect loop.
pub(crate) fn fast_config() -> NodeConfig {
    NodeConfig {
        app_id: "mb-tests".to_string(),
        default_timeout: Duration::from_secs(2),
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

pub(crate) async fn connect(broker: &InMemoryBroker) -> Arc<Node> {
    connect_with(broker, fast_config()).await
}

pub(crate) async fn connect_with(broker: &InMemoryBroker, config: NodeConfig) -> Arc<Node> {
    Node::connect(Arc::new(broker.clone()), config)
        .await
        .expect("node connects")
}

pub(crate) fn addr(text: &str) -> ServiceAddress {
    ServiceAddress::parse(text).expect("valid address")
}

/// Replies with the request body unchanged.
pub(crate) fn echo() -> Arc<dyn ServiceBehavior> {
    Arc::new(FnBehavior::new(|envelope: shared_types::Envelope| async move {
        envelope.reply(envelope.body.clone(), Headers::new()).await?;
        Ok::<_, anyhow::Error>(())
    }))
}

/// Replies with a fixed tag, whatever the request.
pub(crate) fn tagged(tag: &'static str) -> Arc<dyn ServiceBehavior> {
    Arc::new(FnBehavior::new(move |envelope: shared_types::Envelope| async move {
        envelope.reply(tag.as_bytes().to_vec(), Headers::new()).await?;
        Ok::<_, anyhow::Error>(())
    }))
}

/// Consumes without replying.
pub(crate) fn silent() -> Arc<dyn ServiceBehavior> {
    Arc::new(FnBehavior::new(|_envelope: shared_types::Envelope| async move {
        Ok::<_, anyhow::Error>(())
    }))
}

/// Poll `condition` until it holds or [`STEP`] elapses.
pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + STEP;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Next node event accepted by `select`, skipping the rest.
pub(crate) async fn next_event<T>(
    events: &mut broadcast::Receiver<NodeEvent>,
    select: impl Fn(NodeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(STEP, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = select(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected node event")
}
