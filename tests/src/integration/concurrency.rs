//! # Execution Modes
//!
//! Serial services handle one message end-to-end at a time; parallel
//! services stay under `max_concurrency`. Handler failures are counted and
//! surfaced as node events without stopping the service.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use mb_03_service_dispatch::{FnBehavior, ServiceBehavior};
    use node_runtime::{AskOptions, NodeEvent};
    use shared_bus::InMemoryBroker;
    use shared_types::{Envelope, ExecutionMode, Headers, ServiceConfiguration};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Tracks how many handlers run at once.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    fn gauged(gauge: Arc<Gauge>, hold: Duration) -> Arc<dyn ServiceBehavior> {
        Arc::new(FnBehavior::new(move |_envelope: Envelope| {
            let gauge = gauge.clone();
            async move {
                let now = gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                gauge.active.fetch_sub(1, Ordering::SeqCst);
                gauge.done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serial_service_handles_one_at_a_time() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let gauge = Arc::new(Gauge::default());
        let config = ServiceConfiguration::builder()
            .execution(ExecutionMode::Serial)
            .build()
            .unwrap();
        let service = node
            .attach(addr("jobs:serial"), config, gauged(gauge.clone(), Duration::from_millis(20)))
            .await
            .unwrap();

        for _ in 0..5 {
            node.send(&addr("jobs:serial"), Vec::new(), Headers::new())
                .await
                .unwrap();
        }

        assert!(eventually(|| gauge.done.load(Ordering::SeqCst) == 5).await);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert!(eventually(|| service.counters().snapshot().completed == 5).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_service_respects_max_concurrency() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let gauge = Arc::new(Gauge::default());
        let config = ServiceConfiguration::builder()
            .execution(ExecutionMode::Parallel)
            .max_concurrency(2)
            .build()
            .unwrap();
        node.attach(addr("jobs:pool"), config, gauged(gauge.clone(), Duration::from_millis(20)))
            .await
            .unwrap();

        for _ in 0..20 {
            node.send(&addr("jobs:pool"), Vec::new(), Headers::new())
                .await
                .unwrap();
        }

        assert!(eventually(|| gauge.done.load(Ordering::SeqCst) == 20).await);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported_and_service_continues() {
        let broker = InMemoryBroker::new();
        let node = connect(&broker).await;
        let mut events = node.events();
        let behavior = Arc::new(FnBehavior::new(|envelope: Envelope| async move {
            if envelope.body == b"boom" {
                anyhow::bail!("exploded");
            }
            envelope.reply(b"ok".to_vec(), Headers::new()).await?;
            Ok(())
        }));
        let service = node
            .attach(addr("jobs:fragile"), ServiceConfiguration::default(), behavior)
            .await
            .unwrap();

        node.send(&addr("jobs:fragile"), b"boom".to_vec(), Headers::new())
            .await
            .unwrap();

        let (address, error) = next_event(&mut events, |event| match event {
            NodeEvent::UnhandledException { address, error, .. } => Some((address, error)),
            _ => None,
        })
        .await;
        assert_eq!(address, addr("jobs:fragile"));
        assert!(error.contains("exploded"));
        assert!(eventually(|| service.counters().snapshot().faulted == 1).await);

        let reply = node
            .ask(&addr("jobs:fragile"), b"fine".to_vec(), AskOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.body, b"ok");
    }
}
