//! Attached service: address, configuration, filter chain, behavior, counters.

use crate::ports::{ServiceBehavior, ServiceFilter};
use shared_types::{ConfigurationError, CorrelationId, ServiceAddress, ServiceConfiguration};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

// =============================================================================
// COUNTERS
// =============================================================================

/// Live message counters for a service.
#[derive(Debug, Default)]
pub struct ServiceCounters {
    pending: AtomicU64,
    completed: AtomicU64,
    faulted: AtomicU64,
    filtered: AtomicU64,
}

/// Point-in-time copy of [`ServiceCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Received but not yet acknowledged.
    pub pending: u64,
    /// Handled successfully.
    pub completed: u64,
    /// Behavior or filter failed.
    pub faulted: u64,
    /// Stopped by a filter.
    pub filtered: u64,
}

impl ServiceCounters {
    pub(crate) fn received(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn finished(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn faulted(&self) {
        self.faulted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn filtered(&self) {
        self.filtered.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pending: self.pending.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            faulted: self.faulted.load(Ordering::SeqCst),
            filtered: self.filtered.load(Ordering::SeqCst),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Notifications raised to the service owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The behavior (or a filter) failed on a message.
    UnhandledException {
        address: ServiceAddress,
        correlation_id: CorrelationId,
        error: String,
    },
}

// =============================================================================
// SERVICE
// =============================================================================

/// A behavior attached at an address.
///
/// The `Service` outlives any one consumer: when the node reconnects it
/// starts a new dispatcher for the same service, so counters carry over.
pub struct Service {
    address: ServiceAddress,
    configuration: ServiceConfiguration,
    filters: Vec<Arc<dyn ServiceFilter>>,
    behavior: Arc<dyn ServiceBehavior>,
    counters: ServiceCounters,
    events: broadcast::Sender<ServiceEvent>,
}

impl Service {
    /// Create a service.
    ///
    /// # Errors
    ///
    /// Rejects an invalid configuration or a pattern address.
    pub fn new(
        address: ServiceAddress,
        configuration: ServiceConfiguration,
        filters: Vec<Arc<dyn ServiceFilter>>,
        behavior: Arc<dyn ServiceBehavior>,
    ) -> Result<Self, ConfigurationError> {
        configuration.validate()?;
        if address.is_pattern() {
            return Err(ConfigurationError::InvalidAddress(format!(
                "cannot attach a service at pattern address '{}'",
                address
            )));
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            address,
            configuration,
            filters,
            behavior,
            counters: ServiceCounters::default(),
            events,
        })
    }

    #[must_use]
    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }

    #[must_use]
    pub fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    #[must_use]
    pub fn filters(&self) -> &[Arc<dyn ServiceFilter>] {
        &self.filters
    }

    #[must_use]
    pub fn behavior(&self) -> &Arc<dyn ServiceBehavior> {
        &self.behavior
    }

    #[must_use]
    pub fn counters(&self) -> &ServiceCounters {
        &self.counters
    }

    /// Subscribe to unhandled-exception notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub(crate) fn raise(&self, event: ServiceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("address", &self.address)
            .field("configuration", &self.configuration)
            .field("filters", &self.filters.iter().map(|x| x.name()).collect::<Vec<_>>())
            .field("counters", &self.counters.snapshot())
            .finish()
    }
}
