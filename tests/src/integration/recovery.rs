//! # Connection Recovery and Disposal
//!
//! ```text
//!  sever() ──► Disconnected ──► waiters fail (ConnectionLost)
//!                 │
//!                 ├─ broker back ──► Reconnected, services re-bound
//!                 └─ broker gone ──► Faulted, node Disposed
//! ```

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use node_runtime::{AskOptions, NodeConfig, NodeEvent, NodeState};
    use shared_bus::InMemoryBroker;
    use shared_types::{Headers, MessagingError, ServiceConfiguration};
    use std::time::Duration;
    use tokio::time::timeout;

    // =========================================================================
    // RECONNECT
    // =========================================================================

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let mut events = node.events();
        node.attach(addr("demo:void"), ServiceConfiguration::default(), silent())
            .await
            .unwrap();

        let pending = {
            let node = node.clone();
            tokio::spawn(async move {
                node.ask(
                    &addr("demo:void"),
                    Vec::new(),
                    AskOptions::new().with_timeout(Duration::from_secs(30)),
                )
                .await
            })
        };
        assert!(eventually(|| node.pending_requests() == 1).await);

        broker.sever();

        let result = timeout(STEP, pending).await.unwrap().unwrap();
        assert!(
            matches!(result, Err(MessagingError::ConnectionLost(_))),
            "unexpected result: {result:?}"
        );
        next_event(&mut events, |event| match event {
            NodeEvent::Disconnected { .. } => Some(()),
            _ => None,
        })
        .await;
        let attempts = next_event(&mut events, |event| match event {
            NodeEvent::Reconnected { attempts } => Some(attempts),
            _ => None,
        })
        .await;
        assert_eq!(attempts, 1);
        assert_eq!(node.state(), NodeState::Running);
    }

    #[tokio::test]
    async fn test_services_survive_reconnect() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let mut events = node.events();
        let service = node
            .attach(addr("demo:echo"), ServiceConfiguration::default(), echo())
            .await
            .unwrap();
        let mut subscription = node.subscribe(&addr("audit:#")).await.unwrap();

        node.ask(&addr("demo:echo"), b"one".to_vec(), AskOptions::new())
            .await
            .unwrap();
        let reply_queue = node.reply_queue().unwrap();

        broker.sever();
        next_event(&mut events, |event| match event {
            NodeEvent::Reconnected { .. } => Some(()),
            _ => None,
        })
        .await;

        let reply = node
            .ask(&addr("demo:echo"), b"two".to_vec(), AskOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.body, b"two");
        assert_ne!(node.reply_queue().unwrap(), reply_queue);
        assert!(!broker.queue_exists(&reply_queue));
        assert!(eventually(|| service.counters().snapshot().completed == 2).await);

        node.emit(&addr("audit:login"), b"again".to_vec(), Headers::new())
            .await
            .unwrap();
        let event = timeout(STEP, subscription.recv()).await.unwrap().unwrap();
        assert_eq!(event.body, b"again");
    }

    #[tokio::test]
    async fn test_requests_wait_while_reconnecting() {
        let broker = InMemoryBroker::new();
        let node = connect_with(
            &broker,
            NodeConfig {
                reconnect_attempts: 100,
                ..fast_config()
            },
        )
        .await;
        node.attach(addr("demo:echo"), ServiceConfiguration::default(), echo())
            .await
            .unwrap();

        broker.set_available(false);
        broker.sever();
        assert!(eventually(|| node.state() == NodeState::Reconnecting).await);

        let waiting = {
            let node = node.clone();
            tokio::spawn(async move {
                node.ask(&addr("demo:echo"), b"held".to_vec(), AskOptions::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!waiting.is_finished());

        broker.set_available(true);
        let reply = timeout(STEP, waiting).await.unwrap().unwrap().unwrap();
        assert_eq!(reply.body, b"held");
        assert_eq!(node.state(), NodeState::Running);
    }

    #[tokio::test]
    async fn test_exhausted_reconnect_disposes_node() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let mut events = node.events();

        broker.set_available(false);
        broker.sever();

        let reason = next_event(&mut events, |event| match event {
            NodeEvent::Faulted { reason } => Some(reason),
            _ => None,
        })
        .await;
        assert!(reason.contains("3 attempts"), "reason: {reason}");
        assert_eq!(node.state(), NodeState::Disposed);

        let err = node
            .ask(&addr("demo:echo"), Vec::new(), AskOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, MessagingError::Disposed);
    }

    // =========================================================================
    // DISPOSAL
    // =========================================================================

    #[tokio::test]
    async fn test_dispose_fails_everything_after() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        node.attach(addr("demo:void"), ServiceConfiguration::default(), silent())
            .await
            .unwrap();
        assert_eq!(broker.channel_count(), 1);

        let pending = {
            let node = node.clone();
            tokio::spawn(async move {
                node.ask(&addr("demo:void"), Vec::new(), AskOptions::new())
                    .await
            })
        };
        assert!(eventually(|| node.pending_requests() == 1).await);

        node.dispose().await;
        // Second call is a no-op.
        node.dispose().await;

        let result = timeout(STEP, pending).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), MessagingError::Disposed);
        assert_eq!(node.state(), NodeState::Disposed);
        assert!(node.services().is_empty());
        assert!(node.reply_queue().is_none());
        assert_eq!(broker.channel_count(), 0);

        let send = node
            .send(&addr("demo:void"), Vec::new(), Headers::new())
            .await;
        assert_eq!(send.unwrap_err(), MessagingError::Disposed);
        let attach = node
            .attach(addr("demo:echo"), ServiceConfiguration::default(), echo())
            .await;
        assert!(matches!(attach, Err(MessagingError::Disposed)));
        assert!(node.subscribe(&addr("audit:#")).await.is_err());
    }
}
