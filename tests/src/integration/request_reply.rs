//! # Request/Reply Scenarios
//!
//! One-to-one asks across nodes sharing a broker: correlation under
//! concurrency, the three ways a wait ends early (return, timeout,
//! cancellation), remote errors and outbound address translation.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use futures::future::join_all;
    use mb_03_service_dispatch::FnBehavior;
    use node_runtime::{AskOptions, NodeConfig};
    use parking_lot::Mutex;
    use shared_bus::InMemoryBroker;
    use shared_types::{
        ConfigurationError, Envelope, ExecutionMode, Headers, MessagingError, ServiceConfiguration,
        TranslationRule,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    // =========================================================================
    // ROUND TRIPS
    // =========================================================================

    #[tokio::test]
    async fn test_ask_round_trip_between_nodes() {
        let broker = InMemoryBroker::new();
        let server = connect(&broker).await;
        let client = connect(&broker).await;
        server
            .attach(addr("demo:echo"), ServiceConfiguration::default(), echo())
            .await
            .unwrap();

        let reply = client
            .ask(&addr("demo:echo"), b"hello".to_vec(), AskOptions::new())
            .await
            .unwrap();

        assert_eq!(reply.body, b"hello");
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_ask_headers_reach_the_service() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let behavior = Arc::new(FnBehavior::new(|envelope: Envelope| async move {
            let tenant = envelope.header("x-tenant").unwrap_or("none").to_string();
            envelope.reply(tenant.into_bytes(), Headers::new()).await?;
            Ok::<_, anyhow::Error>(())
        }));
        node.attach(addr("demo:tenant"), ServiceConfiguration::default(), behavior)
            .await
            .unwrap();

        let reply = node
            .ask(
                &addr("demo:tenant"),
                Vec::new(),
                AskOptions::new().with_header("x-tenant", "acme"),
            )
            .await
            .unwrap();
        assert_eq!(reply.body, b"acme");
    }

    /// Replies arrive in reverse order of the requests; each caller still
    /// gets its own.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_asks_resolve_out_of_order() {
        let broker = InMemoryBroker::new();
        let server = connect(&broker).await;
        let client = connect(&broker).await;
        let behavior = Arc::new(FnBehavior::new(|envelope: Envelope| async move {
            let delay: u64 = std::str::from_utf8(&envelope.body)?.parse()?;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            envelope.reply(envelope.body.clone(), Headers::new()).await?;
            Ok::<_, anyhow::Error>(())
        }));
        server
            .attach(addr("demo:slow"), ServiceConfiguration::default(), behavior)
            .await
            .unwrap();

        let delays = [100u64, 80, 60, 40, 20];
        let asks = delays.iter().map(|delay| {
            let client = client.clone();
            async move {
                let body = delay.to_string().into_bytes();
                let reply = client
                    .ask(&addr("demo:slow"), body.clone(), AskOptions::new())
                    .await
                    .unwrap();
                (body, reply.body)
            }
        });

        let results = timeout(STEP, join_all(asks)).await.unwrap();
        for (sent, received) in results {
            assert_eq!(sent, received);
        }
        assert_eq!(client.pending_requests(), 0);
    }

    // =========================================================================
    // EARLY ENDINGS
    // =========================================================================

    #[tokio::test]
    async fn test_undeliverable_ask_fails_without_waiting_for_timeout() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;

        let result = timeout(
            Duration::from_secs(1),
            node.ask(
                &addr("nobody:home"),
                Vec::new(),
                AskOptions::new().with_timeout(Duration::from_secs(30)),
            ),
        )
        .await
        .expect("return should end the wait early");

        assert_eq!(
            result.unwrap_err(),
            MessagingError::NotDelivered {
                address: "nobody:home".to_string()
            }
        );
        assert_eq!(node.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_ask_times_out() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        node.attach(addr("demo:void"), ServiceConfiguration::default(), silent())
            .await
            .unwrap();

        let err = node
            .ask(
                &addr("demo:void"),
                Vec::new(),
                AskOptions::new().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "unexpected error: {err}");
        assert_eq!(node.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_ask_cancelled_by_token() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        node.attach(addr("demo:void"), ServiceConfiguration::default(), silent())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = timeout(
            STEP,
            node.ask(
                &addr("demo:void"),
                Vec::new(),
                AskOptions::new().with_cancel(cancel),
            ),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(err.is_cancelled(), "unexpected error: {err}");
        assert_eq!(node.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_reply() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let behavior = Arc::new(FnBehavior::new(|envelope: Envelope| async move {
            envelope.reply_error("Invalid", "quantity must be positive").await?;
            Ok::<_, anyhow::Error>(())
        }));
        node.attach(addr("shop:order"), ServiceConfiguration::default(), behavior)
            .await
            .unwrap();

        let err = node
            .ask(&addr("shop:order"), b"-1".to_vec(), AskOptions::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            MessagingError::remote("Invalid", "quantity must be positive")
        );
    }

    // =========================================================================
    // ADDRESSING
    // =========================================================================

    #[tokio::test]
    async fn test_translation_rewrites_outbound_namespace() {
        let broker = InMemoryBroker::new();
        let server = connect(&broker).await;
        server
            .attach(addr("billing:quote"), ServiceConfiguration::default(), tagged("billing"))
            .await
            .unwrap();

        let client = connect_with(
            &broker,
            NodeConfig {
                translation: Some(TranslationRule::new("legacy", "billing").unwrap()),
                ..fast_config()
            },
        )
        .await;

        assert_eq!(client.translate(&addr("legacy:quote")), addr("billing:quote"));
        let reply = client
            .ask(&addr("legacy:quote"), Vec::new(), AskOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.body, b"billing");
    }

    #[tokio::test]
    async fn test_pattern_is_not_a_valid_target() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;

        let err = node
            .ask(&addr("audit:user.*"), Vec::new(), AskOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Configuration(ConfigurationError::InvalidAddress(_))
        ));
    }

    // =========================================================================
    // FIRE AND FORGET
    // =========================================================================

    #[tokio::test]
    async fn test_send_delivers_without_reply() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = received.clone();
        let behavior = Arc::new(FnBehavior::new(move |envelope: Envelope| {
            let sink = sink.clone();
            async move {
                sink.lock().push(envelope.body);
                Ok::<_, anyhow::Error>(())
            }
        }));
        let serial = ServiceConfiguration::builder()
            .execution(ExecutionMode::Serial)
            .build()
            .unwrap();
        node.attach(addr("log:line"), serial, behavior).await.unwrap();

        node.send(&addr("log:line"), b"first".to_vec(), Headers::new())
            .await
            .unwrap();
        node.send(&addr("log:line"), b"second".to_vec(), Headers::new())
            .await
            .unwrap();

        assert!(eventually(|| received.lock().len() == 2).await);
        assert_eq!(*received.lock(), vec![b"first".to_vec(), b"second".to_vec()]);

        // Nobody listening is not an error for fire-and-forget.
        node.send(&addr("nobody:home"), Vec::new(), Headers::new())
            .await
            .unwrap();
    }
}
