//! Correlation Registry - maps correlation ids to pending waiters.
//!
//! Flow for a request with reply:
//! 1. Caller generates a `CorrelationId` and calls `register_single()`
//! 2. Caller enqueues the publish (the waiter already exists, so an early
//!    reply cannot be lost)
//! 3. The reply listener calls `resolve()`, or the channel-event pump calls
//!    `mark_undelivered()`, or the supervisor calls `fail_all()`
//! 4. Caller awaits the handle, racing timeout and cancellation
//!
//! Whoever removes the entry from the map owns the resolution. Every later
//! attempt finds nothing and is a no-op.

use dashmap::DashMap;
use shared_types::{CorrelationId, Envelope, MessagingError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ReplyResult = Result<Envelope, MessagingError>;

/// A registered waiter.
enum Waiter {
    /// Resolved by the first reply.
    Single(oneshot::Sender<ReplyResult>),
    /// Collects replies until its window closes.
    Multi(mpsc::UnboundedSender<ReplyResult>),
}

impl Waiter {
    fn is_single(&self) -> bool {
        matches!(self, Waiter::Single(_))
    }

    fn complete(self, result: ReplyResult) {
        match self {
            Waiter::Single(tx) => {
                let _ = tx.send(result);
            }
            Waiter::Multi(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// Statistics for the registry.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Waiters registered
    pub registered: AtomicU64,
    /// Replies delivered to a waiter
    pub resolved: AtomicU64,
    /// Single waiters that timed out
    pub timed_out: AtomicU64,
    /// Waiters cancelled by the caller
    pub cancelled: AtomicU64,
    /// Waiters failed (non-delivery, connectivity)
    pub failed: AtomicU64,
}

struct Inner {
    waiters: DashMap<CorrelationId, Waiter>,
    stats: RegistryStats,
}

/// Handle for a single-reply waiter.
///
/// Dropping the handle unregisters the waiter.
pub struct SingleHandle {
    id: CorrelationId,
    receiver: oneshot::Receiver<ReplyResult>,
    inner: Arc<Inner>,
}

impl SingleHandle {
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }
}

impl Drop for SingleHandle {
    fn drop(&mut self) {
        self.inner.waiters.remove(&self.id);
    }
}

/// Handle for a multi-reply collector.
///
/// Dropping the handle unregisters the collector.
pub struct MultiHandle {
    id: CorrelationId,
    receiver: mpsc::UnboundedReceiver<ReplyResult>,
    inner: Arc<Inner>,
}

impl MultiHandle {
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }
}

impl Drop for MultiHandle {
    fn drop(&mut self) {
        self.inner.waiters.remove(&self.id);
    }
}

/// Maps correlation ids to waiters. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<Inner>,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn duplicate(id: CorrelationId) -> MessagingError {
    MessagingError::Dispatch(format!("correlation id {} is already registered", id))
}

impl CorrelationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                waiters: DashMap::new(),
                stats: RegistryStats::default(),
            }),
        }
    }

    fn insert(&self, id: CorrelationId, waiter: Waiter) -> Result<(), MessagingError> {
        if id.is_none() {
            return Err(MessagingError::Dispatch(
                "cannot register the empty correlation id".to_string(),
            ));
        }
        match self.inner.waiters.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(duplicate(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(waiter);
                self.inner.stats.registered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Register a waiter for exactly one reply.
    ///
    /// # Errors
    ///
    /// Fails for the empty id or an id that is already registered.
    pub fn register_single(&self, id: CorrelationId) -> Result<SingleHandle, MessagingError> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Waiter::Single(tx))?;
        debug!(correlation_id = %id, "Registered single waiter");
        Ok(SingleHandle {
            id,
            receiver: rx,
            inner: self.inner.clone(),
        })
    }

    /// Register a collector for zero or more replies.
    ///
    /// # Errors
    ///
    /// Fails for the empty id or an id that is already registered.
    pub fn register_multi(&self, id: CorrelationId) -> Result<MultiHandle, MessagingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(id, Waiter::Multi(tx))?;
        debug!(correlation_id = %id, "Registered multi waiter");
        Ok(MultiHandle {
            id,
            receiver: rx,
            inner: self.inner.clone(),
        })
    }

    /// Deliver a reply. Returns true if a waiter took it.
    pub fn resolve(&self, id: CorrelationId, envelope: Envelope) -> bool {
        if id.is_none() {
            return false;
        }

        if let Some((_, waiter)) = self.inner.waiters.remove_if(&id, |_, w| w.is_single()) {
            waiter.complete(Ok(envelope));
            self.inner.stats.resolved.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let delivered = match self.inner.waiters.get(&id) {
            Some(entry) => match entry.value() {
                Waiter::Multi(tx) => tx.send(Ok(envelope)).is_ok(),
                Waiter::Single(_) => false,
            },
            None => false,
        };
        if delivered {
            self.inner.stats.resolved.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Fail a waiter of either kind. Returns true if one existed.
    pub fn fail(&self, id: CorrelationId, error: MessagingError) -> bool {
        match self.inner.waiters.remove(&id) {
            Some((_, waiter)) => {
                debug!(correlation_id = %id, error = %error, "Failing waiter");
                waiter.complete(Err(error));
                self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Handle a broker return for `id`.
    ///
    /// A single waiter fails with `NotDelivered`. A multi waiter ignores the
    /// return: broadcasts tolerate partial non-delivery.
    pub fn mark_undelivered(&self, id: CorrelationId, address: &str) -> bool {
        match self.inner.waiters.remove_if(&id, |_, w| w.is_single()) {
            Some((_, waiter)) => {
                warn!(correlation_id = %id, address, "Request returned as undeliverable");
                waiter.complete(Err(MessagingError::NotDelivered {
                    address: address.to_string(),
                }));
                self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                debug!(correlation_id = %id, address, "Return ignored (no single waiter)");
                false
            }
        }
    }

    /// Fail every waiter. Returns how many were failed.
    pub fn fail_all(&self, error: MessagingError) -> usize {
        let ids: Vec<CorrelationId> = self.inner.waiters.iter().map(|e| *e.key()).collect();
        let failed = ids
            .into_iter()
            .filter(|id| self.fail(*id, error.clone()))
            .count();
        if failed > 0 {
            warn!(failed, error = %error, "Failed all pending waiters");
        }
        failed
    }

    /// Wait for a single reply, racing timeout and cancellation.
    ///
    /// # Errors
    ///
    /// `Timeout`, `Cancelled`, or whatever error resolved the waiter.
    pub async fn await_single(
        &self,
        mut handle: SingleHandle,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Envelope, MessagingError> {
        let id = handle.id;
        let cancel = cancel.unwrap_or_default();
        let deadline = timeout.map(|t| Instant::now() + t);

        let lost = tokio::select! {
            biased;
            result = &mut handle.receiver => {
                return result.unwrap_or_else(|_| {
                    Err(MessagingError::ConnectionLost("correlation registry dropped".into()))
                });
            }
            _ = cancel.cancelled() => MessagingError::Cancelled { correlation_id: id },
            _ = deadline_elapsed(deadline) => MessagingError::Timeout {
                correlation_id: id,
                timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
            },
        };

        if self.inner.waiters.remove(&id).is_some() {
            if lost.is_cancelled() {
                self.inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            } else {
                self.inner.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            debug!(correlation_id = %id, error = %lost, "Single waiter closed");
            return Err(lost);
        }

        // A resolver removed the entry first; its result is already in flight.
        (&mut handle.receiver).await.unwrap_or(Err(lost))
    }

    /// Collect replies until the window closes.
    ///
    /// Timeout and cancellation are not errors: they close the window and the
    /// replies received so far are returned in arrival order.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the collector (e.g. a lost connection).
    pub async fn await_multi(
        &self,
        mut handle: MultiHandle,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Envelope>, MessagingError> {
        let id = handle.id;
        let cancel = cancel.unwrap_or_default();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut replies = Vec::new();

        loop {
            tokio::select! {
                biased;
                item = handle.receiver.recv() => match item {
                    Some(Ok(envelope)) => replies.push(envelope),
                    Some(Err(error)) => return Err(error),
                    None => break,
                },
                _ = cancel.cancelled() => break,
                _ = deadline_elapsed(deadline) => break,
            }
        }

        self.inner.waiters.remove(&id);
        while let Ok(item) = handle.receiver.try_recv() {
            match item {
                Ok(envelope) => replies.push(envelope),
                Err(error) => return Err(error),
            }
        }

        debug!(correlation_id = %id, replies = replies.len(), "Multi waiter closed");
        Ok(replies)
    }

    /// Number of live waiters.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.waiters.len()
    }

    #[must_use]
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.inner.waiters.contains_key(&id)
    }

    #[must_use]
    pub fn stats(&self) -> &RegistryStats {
        &self.inner.stats
    }
}
