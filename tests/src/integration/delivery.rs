//! # Delivery Semantics
//!
//! | Scenario | Expectation |
//! |----------|-------------|
//! | Balanced | competing consumers share the work |
//! | Fanout | every node gets its own copy |
//! | Singleton | a second consumer anywhere is refused |
//! | Broadcast | replies from every fanout consumer within the window |
//! | Events | topic patterns, ordering, close and stream form |

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use futures::StreamExt;
    use mb_03_service_dispatch::{FnBehavior, ServiceBehavior};
    use node_runtime::{AskOptions, BroadcastOptions};
    use parking_lot::Mutex;
    use shared_bus::InMemoryBroker;
    use shared_types::{
        ConfigurationError, DeliveryType, Envelope, Headers, MessagingError, ServiceConfiguration,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn with_delivery(delivery: DeliveryType) -> ServiceConfiguration {
        ServiceConfiguration::builder()
            .delivery(delivery)
            .build()
            .unwrap()
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn ServiceBehavior> {
        Arc::new(FnBehavior::new(move |_envelope: Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(()) }
        }))
    }

    // =========================================================================
    // SERVICE DELIVERY
    // =========================================================================

    #[tokio::test]
    async fn test_balanced_consumers_share_work() {
        let broker = InMemoryBroker::new();
        let first = connect(&broker).await;
        let second = connect(&broker).await;
        let sender = connect(&broker).await;
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let config = with_delivery(DeliveryType::Balanced);
        first
            .attach(addr("work:job"), config.clone(), counting(a.clone()))
            .await
            .unwrap();
        second
            .attach(addr("work:job"), config, counting(b.clone()))
            .await
            .unwrap();
        assert_eq!(broker.queue_info("work:job").unwrap().consumers, 2);

        for i in 0..10u8 {
            sender
                .send(&addr("work:job"), vec![i], Headers::new())
                .await
                .unwrap();
        }

        assert!(eventually(|| a.load(Ordering::SeqCst) + b.load(Ordering::SeqCst) == 10).await);
        assert!(a.load(Ordering::SeqCst) > 0);
        assert!(b.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_fanout_copies_to_every_node() {
        let broker = InMemoryBroker::new();
        let first = connect(&broker).await;
        let second = connect(&broker).await;
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let config = with_delivery(DeliveryType::Fanout);
        first
            .attach(addr("cache:flush"), config.clone(), counting(a.clone()))
            .await
            .unwrap();
        second
            .attach(addr("cache:flush"), config, counting(b.clone()))
            .await
            .unwrap();

        first
            .send(&addr("cache:flush"), Vec::new(), Headers::new())
            .await
            .unwrap();

        assert!(eventually(|| a.load(Ordering::SeqCst) == 1 && b.load(Ordering::SeqCst) == 1).await);
        // Fanout queues are per node, never the shared name.
        assert!(!broker.queue_exists("cache:flush"));
    }

    #[tokio::test]
    async fn test_singleton_refuses_second_consumer() {
        let broker = InMemoryBroker::new();
        let first = connect(&broker).await;
        let second = connect(&broker).await;
        let config = with_delivery(DeliveryType::Singleton);

        first
            .attach(addr("sched:leader"), config.clone(), silent())
            .await
            .unwrap();
        let err = second
            .attach(addr("sched:leader"), config.clone(), silent())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                MessagingError::Configuration(ConfigurationError::DuplicateSingleton(_))
            ),
            "unexpected error: {err}"
        );
        assert!(second.services().is_empty());

        // Once the holder lets go the other node can take over.
        first.detach(&addr("sched:leader")).await.unwrap();
        second
            .attach(addr("sched:leader"), config, silent())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attach_twice_on_one_node() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        node.attach(addr("demo:echo"), ServiceConfiguration::default(), echo())
            .await
            .unwrap();

        let err = node
            .attach(addr("demo:echo"), ServiceConfiguration::default(), echo())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Configuration(ConfigurationError::AlreadyAttached(_))
        ));

        node.detach(&addr("demo:echo")).await.unwrap();
        let err = node.detach(&addr("demo:echo")).await.unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Configuration(ConfigurationError::NotAttached(_))
        ));
    }

    #[tokio::test]
    async fn test_detached_service_no_longer_receives() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        node.attach(addr("demo:echo"), ServiceConfiguration::default(), echo())
            .await
            .unwrap();
        node.detach(&addr("demo:echo")).await.unwrap();

        let err = node
            .ask(&addr("demo:echo"), Vec::new(), AskOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_not_delivered(), "unexpected error: {err}");
    }

    // =========================================================================
    // BROADCAST
    // =========================================================================

    #[tokio::test]
    async fn test_broadcast_collects_every_reply() {
        let broker = InMemoryBroker::new();
        let config = with_delivery(DeliveryType::Fanout);
        let mut nodes = Vec::new();
        for tag in ["alpha", "beta", "gamma"] {
            let node = connect(&broker).await;
            node.attach(addr("fleet:status"), config.clone(), tagged(tag))
                .await
                .unwrap();
            nodes.push(node);
        }
        let caller = connect(&broker).await;

        let replies = timeout(
            STEP,
            caller.broadcast(
                &addr("fleet:status"),
                Vec::new(),
                BroadcastOptions::new().with_timeout(Duration::from_millis(300)),
            ),
        )
        .await
        .unwrap()
        .unwrap();

        let mut tags: Vec<String> = replies
            .iter()
            .map(|reply| String::from_utf8(reply.body.clone()).unwrap())
            .collect();
        tags.sort();
        assert_eq!(tags, vec!["alpha", "beta", "gamma"]);
        assert_eq!(caller.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_listeners_is_empty() {
        let broker = InMemoryBroker::new();
        let caller = connect(&broker).await;

        let replies = caller
            .broadcast(
                &addr("fleet:status"),
                Vec::new(),
                BroadcastOptions::new().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert!(replies.is_empty());
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    #[tokio::test]
    async fn test_subscription_matches_patterns_in_order() {
        let broker = InMemoryBroker::new();
        let publisher = connect(&broker).await;
        let listener = connect(&broker).await;
        let mut users = listener.subscribe(&addr("audit:user.*")).await.unwrap();
        let mut everything = listener.subscribe(&addr("audit:#")).await.unwrap();
        assert_eq!(users.pattern(), &addr("audit:user.*"));

        for (key, body) in [
            ("audit:user.created", "1"),
            ("audit:order.created", "2"),
            ("audit:user.deleted", "3"),
        ] {
            publisher
                .emit(&addr(key), body.as_bytes().to_vec(), Headers::new())
                .await
                .unwrap();
        }

        let first = timeout(STEP, users.recv()).await.unwrap().unwrap();
        let second = timeout(STEP, users.recv()).await.unwrap().unwrap();
        assert_eq!(first.body, b"1");
        assert_eq!(second.body, b"3");

        let mut all = Vec::new();
        for _ in 0..3 {
            all.push(timeout(STEP, everything.recv()).await.unwrap().unwrap().body);
        }
        assert_eq!(all, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(users.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_dropped() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        node.emit(&addr("audit:user.created"), Vec::new(), Headers::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_receiving() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let mut subscription = node.subscribe(&addr("metrics:#")).await.unwrap();

        node.emit(&addr("metrics:cpu"), b"before".to_vec(), Headers::new())
            .await
            .unwrap();
        let received = timeout(STEP, subscription.recv()).await.unwrap().unwrap();
        assert_eq!(received.body, b"before");

        subscription.close();
        node.emit(&addr("metrics:cpu"), b"after".to_vec(), Headers::new())
            .await
            .unwrap();
        assert!(timeout(STEP, subscription.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let stream = node
            .subscribe(&addr("orders:*"))
            .await
            .unwrap()
            .into_stream();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reader = tokio::spawn(async move {
            let mut stream = stream.take(2);
            while let Some(event) = stream.next().await {
                sink.lock().push(event.body);
            }
        });

        node.emit(&addr("orders:placed"), b"a".to_vec(), Headers::new())
            .await
            .unwrap();
        node.emit(&addr("orders:shipped"), b"b".to_vec(), Headers::new())
            .await
            .unwrap();

        timeout(STEP, reader).await.unwrap().unwrap();
        assert_eq!(*seen.lock(), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
