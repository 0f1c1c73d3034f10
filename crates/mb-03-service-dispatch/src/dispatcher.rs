//! Inbound pipeline for one service.
//!
//! ```text
//! Received ──► Filtered ──► ConcurrencyGated ──► Executing ──► Acknowledged
//!                 │                                               ▲
//!                 └── Stop / Err ─────────────────────────────────┘
//! ```

use crate::ports::{Acknowledger, FilterDecision};
use crate::service::{Service, ServiceEvent};
use shared_bus::{Consumer, Delivery};
use shared_types::{CorrelationId, Envelope, ExecutionMode, ReplySink};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Drives deliveries from one consumer through a service.
#[derive(Clone)]
pub struct ServiceDispatcher {
    service: Arc<Service>,
    acknowledger: Arc<dyn Acknowledger>,
    reply_sink: Option<Arc<dyn ReplySink>>,
    gate: Arc<Semaphore>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ServiceDispatcher {
    /// `reply_sink` is attached to every delivery that names a reply-to
    /// address.
    pub fn new(
        service: Arc<Service>,
        acknowledger: Arc<dyn Acknowledger>,
        reply_sink: Option<Arc<dyn ReplySink>>,
    ) -> Self {
        let permits = service.configuration().effective_concurrency();
        Self {
            service,
            acknowledger,
            reply_sink,
            gate: Arc::new(Semaphore::new(permits)),
        }
    }

    #[must_use]
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Free concurrency slots.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Consume until the consumer ends, then wait for in-flight messages.
    pub async fn run(self, mut consumer: Consumer) {
        let address = self.service.address().clone();
        let serial = self.service.configuration().execution == ExecutionMode::Serial;
        debug!(address = %address, queue = consumer.queue(), serial, "Dispatcher started");

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                delivery = consumer.recv() => match delivery {
                    Some(delivery) if serial => self.dispatch(delivery).await,
                    Some(delivery) => {
                        let this = self.clone();
                        in_flight.spawn(async move { this.dispatch(delivery).await });
                    }
                    None => break,
                },
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        debug!(address = %address, "Dispatcher stopped");
    }

    /// Process one delivery end to end. The delivery is acknowledged exactly
    /// once unless the service consumes with auto-ack.
    pub async fn dispatch(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let mut envelope = delivery.into_envelope();
        if envelope.reply_to.is_some() {
            if let Some(sink) = &self.reply_sink {
                envelope = envelope.with_reply_sink(sink.clone());
            }
        }
        let correlation_id = envelope.correlation_id;
        let counters = self.service.counters();
        counters.received();

        let stage = {
            let this = self.clone();
            tokio::spawn(async move { this.filter_and_execute(envelope).await })
        };
        if let Err(e) = stage.await {
            let reason = if e.is_panic() {
                format!("behavior panicked: {}", panic_message(e.into_panic()))
            } else {
                "behavior task cancelled".to_string()
            };
            self.fault(correlation_id, reason);
        }

        if !self.service.configuration().auto_ack {
            if let Err(e) = self.acknowledger.ack(delivery_tag).await {
                warn!(
                    address = %self.service.address(),
                    delivery_tag,
                    error = %e,
                    "Failed to acknowledge delivery"
                );
            }
        }
        counters.finished();
    }

    async fn filter_and_execute(&self, mut envelope: Envelope) {
        let correlation_id = envelope.correlation_id;

        for filter in self.service.filters() {
            match filter.handle(&mut envelope).await {
                Ok(FilterDecision::Continue) => {}
                Ok(FilterDecision::Stop) => {
                    debug!(
                        address = %self.service.address(),
                        filter = filter.name(),
                        correlation_id = %correlation_id,
                        "Message stopped by filter"
                    );
                    self.service.counters().filtered();
                    return;
                }
                Err(e) => {
                    self.fault(correlation_id, format!("filter '{}' failed: {}", filter.name(), e));
                    return;
                }
            }
        }

        // Released on every exit path, including unwinding.
        let _permit = match self.gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.fault(correlation_id, "concurrency gate closed".to_string());
                return;
            }
        };

        match self.service.behavior().handle(envelope).await {
            Ok(()) => self.service.counters().completed(),
            Err(e) => self.fault(correlation_id, format!("{:#}", e)),
        }
    }

    fn fault(&self, correlation_id: CorrelationId, error: String) {
        warn!(
            address = %self.service.address(),
            correlation_id = %correlation_id,
            error = %error,
            "Unhandled exception in service"
        );
        self.service.counters().faulted();
        self.service.raise(ServiceEvent::UnhandledException {
            address: self.service.address().clone(),
            correlation_id,
            error,
        });
    }
}
