//! # In-Memory Broker
//!
//! A single-process broker with AMQP-style semantics, used by tests and by
//! nodes that share one process.
//!
//! ## Behavior
//!
//! | Feature | Semantics |
//! |---------|-----------|
//! | Default exchange (`""`) | routes to the queue named by the routing key |
//! | Direct / Topic / Fanout | routed through queue bindings |
//! | Mandatory publish | unroutable messages come back as [`ChannelEvent::Returned`] |
//! | Competing consumers | round-robin across a queue's consumers |
//! | Exclusive consumer | a second consumer fails with [`BrokerError::ExclusiveConsumer`] |
//! | Exclusive queue | owned by its channel, deleted when the channel closes |
//! | Auto-delete queue | deleted when its last consumer is cancelled |
//! | Channel close | unacknowledged deliveries are requeued as redelivered |
//!
//! [`InMemoryBroker::sever`] simulates a dropped connection and
//! [`InMemoryBroker::set_available`] simulates an unreachable broker.

use crate::routing::topic_matches;
use crate::subscriber::Consumer;
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerError, ChannelEvent, Delivery, ExchangeKind,
    MessageProperties, QueueOptions, ReturnedMessage,
};
use crate::DEFAULT_EXCHANGE;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// AMQP reply code for an unroutable mandatory message.
const NO_ROUTE: u16 = 312;

/// Snapshot of a queue, for inspection in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub expires: Option<Duration>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    exclusive: bool,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    exclusive_owner: Option<u64>,
    auto_delete: bool,
    expires: Option<Duration>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Exchange {
    kind: ExchangeKind,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    events: mpsc::UnboundedSender<ChannelEvent>,
    unacked: BTreeMap<u64, Unacked>,
    next_tag: u64,
}

#[derive(Default)]
struct BrokerCore {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, ChannelState>,
    next_consumer: u64,
}

struct BrokerState {
    core: Mutex<BrokerCore>,
    available: AtomicBool,
    next_channel: AtomicU64,
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                core: Mutex::new(BrokerCore::default()),
                available: AtomicBool::new(true),
                next_channel: AtomicU64::new(0),
            }),
        }
    }

    /// Close every open channel as if the connection dropped.
    ///
    /// Each channel receives [`ChannelEvent::Shutdown`].
    pub fn sever(&self) {
        let mut core = self.state.core.lock();
        let ids: Vec<u64> = core.channels.keys().copied().collect();
        warn!(channels = ids.len(), "Severing broker connection");
        for id in ids {
            core.close_channel(id, Some("connection severed"));
        }
    }

    /// When false, new channels cannot be created.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
        info!(available, "Broker availability changed");
    }

    /// Inspect a queue.
    #[must_use]
    pub fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        let core = self.state.core.lock();
        let queue = core.queues.get(name)?;
        let unacked = core
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == name)
            .count();
        Some(QueueInfo {
            name: name.to_string(),
            ready: queue.ready.len(),
            unacked,
            consumers: queue.consumers.len(),
            exclusive: queue.exclusive_owner.is_some(),
            auto_delete: queue.auto_delete,
            expires: queue.expires,
        })
    }

    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.core.lock().queues.contains_key(name)
    }

    /// Number of open channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.state.core.lock().channels.len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerConnection for InMemoryBroker {
    fn create_channel(
        &self,
    ) -> Result<(Arc<dyn BrokerChannel>, mpsc::UnboundedReceiver<ChannelEvent>), BrokerError> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker is not accepting connections".into()));
        }

        let id = self.state.next_channel.fetch_add(1, Ordering::Relaxed) + 1;
        let (events, receiver) = mpsc::unbounded_channel();
        self.state.core.lock().channels.insert(
            id,
            ChannelState {
                events,
                unacked: BTreeMap::new(),
                next_tag: 0,
            },
        );
        debug!(channel = id, "Channel opened");

        let channel = MemoryChannel {
            id,
            state: self.state.clone(),
        };
        Ok((Arc::new(channel), receiver))
    }
}

// =============================================================================
// CORE OPERATIONS
// =============================================================================

impl BrokerCore {
    fn ensure_open(&self, channel: u64) -> Result<(), BrokerError> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn ensure_accessible(&self, channel: u64, queue: &str) -> Result<(), BrokerError> {
        match self.queues.get(queue) {
            None => Err(BrokerError::QueueNotFound(queue.to_string())),
            Some(q) => match q.exclusive_owner {
                Some(owner) if owner != channel => {
                    Err(BrokerError::ResourceLocked(queue.to_string()))
                }
                _ => Ok(()),
            },
        }
    }

    fn remove_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(queue, _)| queue != name);
            }
            debug!(queue = name, "Queue deleted");
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let ex = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &ex.bindings {
            let hit = match ex.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
                ExchangeKind::Fanout => true,
            };
            if hit && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    /// Hand ready messages to consumers round-robin.
    fn dispatch(&mut self, name: &str) {
        let Self {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);

            let (channel_id, no_ack, sender) = {
                let slot = &queue.consumers[index];
                (slot.channel, slot.no_ack, slot.sender.clone())
            };
            let Some(channel) = channels.get_mut(&channel_id) else {
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if sender.send(delivery).is_err() {
                // Receiver dropped without cancelling.
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }
            if !no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: name.to_string(),
                        message,
                    },
                );
            }
        }
    }

    fn close_channel(&mut self, id: u64, reason: Option<&str>) {
        let Some(state) = self.channels.remove(&id) else {
            return;
        };

        let mut touched: Vec<String> = Vec::new();

        // Requeue in original order at the head of each queue.
        for (_, unacked) in state.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                if !touched.contains(&unacked.queue) {
                    touched.push(unacked.queue);
                }
            }
        }

        let mut doomed: Vec<String> = Vec::new();
        for (name, queue) in &mut self.queues {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != id);
            let lost_consumers = queue.consumers.len() != before;
            if queue.exclusive_owner == Some(id)
                || (lost_consumers && queue.auto_delete && queue.consumers.is_empty())
            {
                doomed.push(name.clone());
            }
        }
        for name in &doomed {
            self.remove_queue(name);
        }

        for name in touched {
            self.dispatch(&name);
        }

        match reason {
            Some(reason) => {
                let _ = state.events.send(ChannelEvent::Shutdown {
                    reason: reason.to_string(),
                });
                warn!(channel = id, reason, "Channel shut down");
            }
            None => debug!(channel = id, "Channel closed"),
        }
    }
}

// =============================================================================
// CHANNEL HANDLE
// =============================================================================

struct MemoryChannel {
    id: u64,
    state: Arc<BrokerState>,
}

impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut core = self.state.core.lock();
        core.ensure_open(self.id)?;
        if name == DEFAULT_EXCHANGE {
            return Ok(());
        }
        match core.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed(
                format!("exchange '{}' exists as {:?}", name, existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                core.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = name, ?kind, "Exchange declared");
                Ok(())
            }
        }
    }

    fn declare_queue(&self, options: QueueOptions) -> Result<String, BrokerError> {
        let mut core = self.state.core.lock();
        core.ensure_open(self.id)?;

        let name = if options.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            options.name
        };

        if core.queues.contains_key(&name) {
            core.ensure_accessible(self.id, &name)?;
            return Ok(name);
        }

        core.queues.insert(
            name.clone(),
            Queue {
                exclusive_owner: options.exclusive.then_some(self.id),
                auto_delete: options.auto_delete,
                expires: options.expires,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        debug!(queue = %name, exclusive = options.exclusive, "Queue declared");
        Ok(name)
    }

    fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut core = self.state.core.lock();
        core.ensure_open(self.id)?;
        if !core.queues.contains_key(name) {
            return Ok(());
        }
        core.ensure_accessible(self.id, name)?;
        core.remove_queue(name);
        Ok(())
    }

    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut core = self.state.core.lock();
        core.ensure_open(self.id)?;
        core.ensure_accessible(self.id, queue)?;
        let ex = core
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut core = self.state.core.lock();
        core.ensure_open(self.id)?;
        let targets = core.route(exchange, routing_key)?;

        if targets.is_empty() {
            debug!(exchange, routing_key, mandatory, "Message unroutable");
            if mandatory {
                if let Some(channel) = core.channels.get(&self.id) {
                    let _ = channel.events.send(ChannelEvent::Returned(ReturnedMessage {
                        reply_code: NO_ROUTE,
                        reply_text: "NO_ROUTE".to_string(),
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        properties,
                        body,
                    }));
                }
            }
            return Ok(());
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
            redelivered: false,
        };
        for name in &targets {
            if let Some(queue) = core.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
            core.dispatch(name);
        }
        Ok(())
    }

    fn consume(&self, queue: &str, exclusive: bool, no_ack: bool) -> Result<Consumer, BrokerError> {
        let mut core = self.state.core.lock();
        core.ensure_open(self.id)?;
        core.ensure_accessible(self.id, queue)?;

        core.next_consumer += 1;
        let tag = format!("ctag-{}", core.next_consumer);
        let (sender, receiver) = mpsc::unbounded_channel();

        let q = core
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let exclusive_held = q.consumers.iter().any(|c| c.exclusive);
        if exclusive_held || (exclusive && !q.consumers.is_empty()) {
            return Err(BrokerError::ExclusiveConsumer {
                queue: queue.to_string(),
            });
        }
        q.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel: self.id,
            exclusive,
            no_ack,
            sender,
        });
        core.dispatch(queue);

        debug!(queue, consumer_tag = %tag, exclusive, "Consumer started");
        Ok(Consumer::new(tag, queue.to_string(), receiver))
    }

    fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut core = self.state.core.lock();
        core.ensure_open(self.id)?;

        let mut found: Option<(String, bool)> = None;
        for (name, queue) in &mut core.queues {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel == self.id));
            if queue.consumers.len() != before {
                found = Some((name.clone(), queue.auto_delete && queue.consumers.is_empty()));
                break;
            }
        }

        match found {
            None => Err(BrokerError::UnknownConsumer(consumer_tag.to_string())),
            Some((queue, delete)) => {
                if delete {
                    core.remove_queue(&queue);
                }
                debug!(queue = %queue, consumer_tag, "Consumer cancelled");
                Ok(())
            }
        }
    }

    fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut core = self.state.core.lock();
        let channel = core
            .channels
            .get_mut(&self.id)
            .ok_or(BrokerError::ChannelClosed)?;
        channel
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    fn close(&self) -> Result<(), BrokerError> {
        self.state.core.lock().close_channel(self.id, None);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.core.lock().channels.contains_key(&self.id)
    }
}
