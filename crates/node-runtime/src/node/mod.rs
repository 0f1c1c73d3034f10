//! # Node
//!
//! One application instance on the bus. A node owns a single broker
//! channel (through its [`Link`]), the correlation registry for its
//! outstanding requests and the services attached to it.
//!
//! ## Request Flow
//!
//! ```text
//!   ask(addr) ──► translate ──► register waiter ──► executor: publish(mandatory)
//!                                     ▲                          │
//!                                     │                          ▼
//!   reply queue ──► ReplyListener ────┘            broker return ──► NotDelivered
//! ```
//!
//! ## Lifecycle
//!
//! | State | Requests | Entered by |
//! |-------|----------|------------|
//! | `Running` | published immediately | `connect`, successful rebuild |
//! | `Reconnecting` | wait at the barrier | channel shutdown |
//! | `Disposed` | fail with `Disposed` | `dispose`, failed recovery |

mod events;
mod subscription;
mod supervisor;

pub use events::{NodeEvent, NodeState};
pub use subscription::{EventStream, EventSubscription};

use crate::adapters::{NodeReplySink, NodeTransport};
use crate::container::link::Link;
use crate::container::NodeConfig;
use crate::rpc::SerializerRegistry;
use crate::wiring::topology;
use dashmap::DashMap;
use mb_02_correlation::{CorrelationRegistry, ListenerEvent, ReplyListener};
use mb_03_service_dispatch::{
    ExecutorAcknowledger, Service, ServiceBehavior, ServiceDispatcher, ServiceEvent, ServiceFilter,
};
use mb_04_secure_channel::{SecureClient, SecureServiceFilter, SecureTransport, ServerIdentity};
use parking_lot::RwLock;
use shared_bus::{
    BrokerConnection, ChannelEvent, Consumer, MessageProperties, ReturnedMessage, DEFAULT_EXCHANGE,
};
use shared_types::{
    ConfigurationError, CorrelationId, Envelope, Headers, MessagingError, ReplySink,
    ServiceAddress, ServiceConfiguration,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use supervisor::ReconnectSupervisor;
use tokio::sync::{broadcast, mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

// =============================================================================
// OPTIONS
// =============================================================================

/// Per-call options for [`Node::ask`].
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Falls back to [`NodeConfig::default_timeout`].
    pub timeout: Option<Duration>,
    pub headers: Headers,
    pub cancel: Option<CancellationToken>,
}

impl AskOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Options for [`Node::broadcast`]. The timeout closes the collection
/// window rather than failing the call.
pub type BroadcastOptions = AskOptions;

// =============================================================================
// BOOKKEEPING
// =============================================================================

/// A service bound to the current channel.
struct Attachment {
    service: Arc<Service>,
    consumer_tag: String,
    task: JoinHandle<()>,
}

struct SubscriptionEntry {
    pattern: ServiceAddress,
    sender: mpsc::UnboundedSender<Envelope>,
    consumer_tag: String,
    task: JoinHandle<()>,
}

fn reject_pattern(address: &ServiceAddress) -> Result<(), MessagingError> {
    if address.is_pattern() {
        return Err(ConfigurationError::InvalidAddress(format!(
            "{} is a pattern, not a target",
            address
        ))
        .into());
    }
    Ok(())
}

// =============================================================================
// NODE
// =============================================================================

/// A connected application instance.
pub struct Node {
    id: Uuid,
    config: NodeConfig,
    connection: Arc<dyn BrokerConnection>,
    registry: CorrelationRegistry,
    listener: Arc<ReplyListener>,
    link: RwLock<Option<Arc<Link>>>,
    generation: AtomicU64,
    state: watch::Sender<NodeState>,
    /// Serializes attach, detach, subscribe and rebuild.
    topology: Mutex<()>,
    services: DashMap<ServiceAddress, Attachment>,
    subscriptions: DashMap<u64, SubscriptionEntry>,
    next_subscription: AtomicU64,
    events: broadcast::Sender<NodeEvent>,
    secure: SecureClient,
    serializers: Arc<SerializerRegistry>,
    shutdown: CancellationToken,
    this: Weak<Node>,
}

impl Node {
    /// Open a channel on `connection` and start the node.
    ///
    /// # Errors
    ///
    /// `Configuration` for an invalid config, `ConnectionLost` if the broker
    /// refuses the channel.
    pub async fn connect(
        connection: Arc<dyn BrokerConnection>,
        config: NodeConfig,
    ) -> Result<Arc<Self>, MessagingError> {
        config.validate()?;
        let (link, channel_events, replies) = Link::open(&*connection, 1, &config).await?;

        let registry = CorrelationRegistry::new();
        let listener = Arc::new(ReplyListener::new(registry.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(NodeState::Running);
        let secure_config = config.secure.clone();

        let node = Arc::new_cyclic(|this: &Weak<Node>| {
            let transport: Arc<dyn SecureTransport> = Arc::new(NodeTransport::new(this.clone()));
            Self {
                id: Uuid::new_v4(),
                config,
                connection,
                registry,
                listener,
                link: RwLock::new(Some(link)),
                generation: AtomicU64::new(1),
                state,
                topology: Mutex::new(()),
                services: DashMap::new(),
                subscriptions: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                events,
                secure: SecureClient::new(transport, secure_config),
                serializers: Arc::new(SerializerRegistry::new()),
                shutdown: CancellationToken::new(),
                this: this.clone(),
            }
        });

        node.spawn_listener(replies);
        node.forward_listener_events();
        ReconnectSupervisor::spawn(Arc::downgrade(&node), node.shutdown.clone(), channel_events);

        info!(
            node = %node.id,
            app = %node.config.app_id,
            version = %node.config.app_version,
            "Node connected"
        );
        Ok(node)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    /// Subscribe to owner notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Requests still waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.registry.pending_count()
    }

    /// Name of the private reply queue, while a channel is open.
    #[must_use]
    pub fn reply_queue(&self) -> Option<String> {
        self.link.read().as_ref().map(|l| l.reply_queue().to_string())
    }

    /// RPC serializers shared by this node's clients and behaviors.
    #[must_use]
    pub fn serializers(&self) -> Arc<SerializerRegistry> {
        self.serializers.clone()
    }

    #[must_use]
    pub fn secure_client(&self) -> &SecureClient {
        &self.secure
    }

    /// Attached services.
    #[must_use]
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.iter().map(|e| e.service.clone()).collect()
    }

    #[must_use]
    pub fn service(&self, address: &ServiceAddress) -> Option<Arc<Service>> {
        self.services.get(address).map(|e| e.service.clone())
    }

    /// Apply the translation rule, if any.
    #[must_use]
    pub fn translate(&self, address: &ServiceAddress) -> ServiceAddress {
        match &self.config.translation {
            Some(rule) => rule.apply(address),
            None => address.clone(),
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Request/reply.
    ///
    /// # Errors
    ///
    /// `NotDelivered` when nothing consumes `address`, `Timeout`,
    /// `Cancelled`, `Remote` for an error reply, `ConnectionLost` when the
    /// channel drops while waiting, `Disposed` after disposal.
    pub async fn ask(
        &self,
        address: &ServiceAddress,
        body: Vec<u8>,
        options: AskOptions,
    ) -> Result<Envelope, MessagingError> {
        reject_pattern(address)?;
        let target = self.translate(address);
        self.ask_translated(&target, body, options).await
    }

    /// [`ask`](Self::ask) without translation.
    pub(crate) async fn ask_translated(
        &self,
        address: &ServiceAddress,
        body: Vec<u8>,
        options: AskOptions,
    ) -> Result<Envelope, MessagingError> {
        let link = self.current_link().await?;
        let id = CorrelationId::new();
        let handle = self.registry.register_single(id)?;

        let properties = Self::request_properties(id, &link, options.headers);
        if let Err(e) = Self::publish_on(&link, address, true, properties, body).await {
            self.registry.fail(id, e.clone());
            return Err(e);
        }
        debug!(correlation_id = %id, address = %address, "Request published");

        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let reply = self
            .registry
            .await_single(handle, Some(timeout), options.cancel)
            .await?;
        match reply.remote_error() {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }

    /// Encrypted request/reply with a service attached via
    /// [`attach_secure`](Self::attach_secure).
    ///
    /// # Errors
    ///
    /// As [`ask`](Self::ask), plus `Protocol` for handshake and encryption
    /// failures. The timeout and cancel token cover the handshake too.
    pub async fn ask_secure(
        &self,
        address: &ServiceAddress,
        body: Vec<u8>,
        options: AskOptions,
    ) -> Result<Envelope, MessagingError> {
        reject_pattern(address)?;
        let target = self.translate(address);
        let timeout = options.timeout.or(Some(self.config.default_timeout));
        let reply = self
            .secure
            .ask(&target, body, options.headers, timeout, options.cancel)
            .await?;
        match reply.remote_error() {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }

    /// Fire-and-forget to a service.
    ///
    /// # Errors
    ///
    /// Only local failures (channel, disposal); delivery is not confirmed.
    pub async fn send(
        &self,
        address: &ServiceAddress,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), MessagingError> {
        reject_pattern(address)?;
        let target = self.translate(address);
        let link = self.current_link().await?;
        let properties = MessageProperties {
            message_id: Some(Uuid::new_v4().to_string()),
            headers,
            ..MessageProperties::default()
        };
        Self::publish_on(&link, &target, false, properties, body).await
    }

    /// Ask every consumer of `address` and collect replies until the
    /// window closes.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` or `Disposed` if the node loses its channel during
    /// the window. Recipients that cannot be reached are skipped.
    pub async fn broadcast(
        &self,
        address: &ServiceAddress,
        body: Vec<u8>,
        options: BroadcastOptions,
    ) -> Result<Vec<Envelope>, MessagingError> {
        reject_pattern(address)?;
        let target = self.translate(address);
        let link = self.current_link().await?;
        let id = CorrelationId::new();
        let handle = self.registry.register_multi(id)?;

        let properties = Self::request_properties(id, &link, options.headers);
        if let Err(e) = Self::publish_on(&link, &target, true, properties, body).await {
            self.registry.fail(id, e.clone());
            return Err(e);
        }
        debug!(correlation_id = %id, address = %target, "Broadcast published");

        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let replies = self
            .registry
            .await_multi(handle, Some(timeout), options.cancel)
            .await?;
        debug!(correlation_id = %id, replies = replies.len(), "Broadcast window closed");
        Ok(replies)
    }

    /// Publish an event to every matching subscription.
    ///
    /// # Errors
    ///
    /// Only local failures; events nobody subscribes to are dropped.
    pub async fn emit(
        &self,
        address: &ServiceAddress,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), MessagingError> {
        reject_pattern(address)?;
        let target = self.translate(address);
        let link = self.current_link().await?;
        let properties = MessageProperties {
            message_id: Some(Uuid::new_v4().to_string()),
            headers,
            ..MessageProperties::default()
        };
        Self::publish_on(&link, &target, false, properties, body).await?;
        debug!(address = %target, "Event emitted");
        Ok(())
    }

    /// Subscribe to events matching `pattern` (`*` one word, `#` zero or
    /// more).
    ///
    /// # Errors
    ///
    /// Channel failures, or `Disposed`.
    pub async fn subscribe(&self, pattern: &ServiceAddress) -> Result<EventSubscription, MessagingError> {
        let (_topology, link) = self.lock_topology().await?;
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        let (consumer_tag, task) = self.bind_subscription(&link, pattern, sender.clone()).await?;
        self.subscriptions.insert(
            id,
            SubscriptionEntry {
                pattern: pattern.clone(),
                sender,
                consumer_tag,
                task,
            },
        );
        info!(node = %self.id, pattern = %pattern, subscription = id, "Subscribed");
        Ok(EventSubscription::new(id, pattern.clone(), receiver, self.this.clone()))
    }

    /// Drop a subscription. Called from [`EventSubscription`].
    pub(crate) fn unsubscribe(&self, id: u64) {
        let Some((_, entry)) = self.subscriptions.remove(&id) else {
            return;
        };
        entry.task.abort();
        if let Some(link) = self.link.read().clone() {
            let tag = entry.consumer_tag;
            link.enqueue("cancel-subscription", move |ops| {
                ops.channel().cancel(&tag)?;
                Ok(())
            });
        }
        debug!(pattern = %entry.pattern, subscription = id, "Unsubscribed");
    }

    // =========================================================================
    // SERVICES
    // =========================================================================

    /// Attach `behavior` at `address`.
    ///
    /// # Errors
    ///
    /// `AlreadyAttached`, `DuplicateSingleton`, an invalid configuration, or
    /// channel failures.
    pub async fn attach(
        &self,
        address: ServiceAddress,
        configuration: ServiceConfiguration,
        behavior: Arc<dyn ServiceBehavior>,
    ) -> Result<Arc<Service>, MessagingError> {
        self.attach_with_filters(address, configuration, Vec::new(), behavior)
            .await
    }

    /// Attach with an ordered filter chain in front of the behavior.
    ///
    /// # Errors
    ///
    /// As [`attach`](Self::attach).
    pub async fn attach_with_filters(
        &self,
        address: ServiceAddress,
        configuration: ServiceConfiguration,
        filters: Vec<Arc<dyn ServiceFilter>>,
        behavior: Arc<dyn ServiceBehavior>,
    ) -> Result<Arc<Service>, MessagingError> {
        reject_pattern(&address)?;
        let (_topology, link) = self.lock_topology().await?;
        if self.services.contains_key(&address) {
            return Err(ConfigurationError::AlreadyAttached(address.to_string()).into());
        }

        let service = Arc::new(Service::new(address.clone(), configuration, filters, behavior)?);
        let attachment = self.bind_service(&link, service.clone()).await?;
        self.services.insert(address.clone(), attachment);
        self.forward_service_events(&service);

        info!(
            node = %self.id,
            address = %address,
            delivery = ?service.configuration().delivery,
            execution = ?service.configuration().execution,
            "Service attached"
        );
        Ok(service)
    }

    /// Attach behind the secure-channel filter. Plaintext requests are
    /// rejected; the behavior sees decrypted bodies and its replies are
    /// encrypted.
    ///
    /// # Errors
    ///
    /// As [`attach`](Self::attach).
    pub async fn attach_secure(
        &self,
        address: ServiceAddress,
        configuration: ServiceConfiguration,
        behavior: Arc<dyn ServiceBehavior>,
        identity: Arc<ServerIdentity>,
    ) -> Result<Arc<Service>, MessagingError> {
        let filters: Vec<Arc<dyn ServiceFilter>> = vec![Arc::new(SecureServiceFilter::new(identity))];
        self.attach_with_filters(address, configuration, filters, behavior)
            .await
    }

    /// Stop consuming for `address` and wait for in-flight messages.
    ///
    /// # Errors
    ///
    /// `NotAttached` if nothing is attached there.
    pub async fn detach(&self, address: &ServiceAddress) -> Result<(), MessagingError> {
        let _topology = self.topology.lock().await;
        let (_, attachment) = self
            .services
            .remove(address)
            .ok_or_else(|| ConfigurationError::NotAttached(address.to_string()))?;
        self.release(attachment).await;
        info!(node = %self.id, address = %address, "Service detached");
        Ok(())
    }

    // =========================================================================
    // DISPOSAL
    // =========================================================================

    /// Tear the node down. Idempotent.
    ///
    /// Services are detached (in-flight messages finish), pending requests
    /// fail with `Disposed` and the channel is closed.
    pub async fn dispose(&self) {
        if self.state.send_replace(NodeState::Disposed) == NodeState::Disposed {
            return;
        }
        self.shutdown.cancel();

        let _topology = self.topology.lock().await;
        let addresses: Vec<ServiceAddress> = self.services.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            if let Some((_, attachment)) = self.services.remove(&address) {
                self.release(attachment).await;
            }
        }
        let ids: Vec<u64> = self.subscriptions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.unsubscribe(id);
        }

        let failed = self.registry.fail_all(MessagingError::Disposed);
        let link = self.link.write().take();
        if let Some(link) = link {
            link.close().await;
        }
        info!(node = %self.id, failed_requests = failed, "Node disposed");
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Wait at the barrier for a running link.
    async fn current_link(&self) -> Result<Arc<Link>, MessagingError> {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                NodeState::Disposed => return Err(MessagingError::Disposed),
                NodeState::Running => {
                    if let Some(link) = self.link.read().clone() {
                        return Ok(link);
                    }
                }
                NodeState::Reconnecting => {}
            }
            if state.changed().await.is_err() {
                return Err(MessagingError::Disposed);
            }
        }
    }

    /// Link for replies. Unlike requests, replies still go out while a
    /// disposing node drains its services.
    async fn reply_link(&self) -> Result<Arc<Link>, MessagingError> {
        if let Some(link) = self.link.read().clone() {
            return Ok(link);
        }
        self.current_link().await
    }

    /// Take the topology lock on the link that is current once it is held.
    async fn lock_topology(&self) -> Result<(MutexGuard<'_, ()>, Arc<Link>), MessagingError> {
        loop {
            let link = self.current_link().await?;
            let guard = self.topology.lock().await;
            let unchanged = self
                .link
                .read()
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &link));
            if unchanged {
                return Ok((guard, link));
            }
        }
    }

    fn request_properties(id: CorrelationId, link: &Link, headers: Headers) -> MessageProperties {
        MessageProperties {
            message_id: Some(Uuid::new_v4().to_string()),
            correlation_id: id,
            reply_to: Some(link.reply_queue().to_string()),
            headers,
        }
    }

    async fn publish_on(
        link: &Link,
        address: &ServiceAddress,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), MessagingError> {
        let exchange = address.namespace().to_string();
        let key = address.key().to_string();
        link.run(move |ops| {
            ops.ensure_exchange(&exchange)?;
            ops.channel()
                .publish(&exchange, &key, mandatory, properties, body)?;
            Ok(())
        })
        .await
    }

    /// Publish a reply to `reply_to` on the default exchange.
    pub(crate) async fn publish_reply(
        &self,
        reply_to: &str,
        correlation_id: CorrelationId,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<(), MessagingError> {
        let link = self.reply_link().await?;
        let properties = MessageProperties {
            message_id: Some(Uuid::new_v4().to_string()),
            correlation_id,
            reply_to: None,
            headers,
        };
        let queue = reply_to.to_string();
        link.run(move |ops| {
            ops.channel()
                .publish(DEFAULT_EXCHANGE, &queue, false, properties, body)?;
            Ok(())
        })
        .await?;
        debug!(correlation_id = %correlation_id, reply_to, "Reply published");
        Ok(())
    }

    /// Start a consumer and dispatcher for `service` on `link`.
    async fn bind_service(&self, link: &Link, service: Arc<Service>) -> Result<Attachment, MessagingError> {
        let plan = topology::service_plan(service.address(), service.configuration().delivery, self.id);
        let no_ack = service.configuration().auto_ack;
        let consumer = link.run(move |ops| plan.start_consumer(ops, no_ack)).await?;

        let acknowledger = Arc::new(ExecutorAcknowledger::new(link.executor(), link.channel()));
        let sink: Arc<dyn ReplySink> = Arc::new(NodeReplySink::new(self.this.clone()));
        let dispatcher = ServiceDispatcher::new(service.clone(), acknowledger, Some(sink));

        let consumer_tag = consumer.tag().to_string();
        let task = tokio::spawn(dispatcher.run(consumer));
        debug!(
            address = %service.address(),
            queue = %consumer_tag,
            generation = link.generation(),
            "Service bound"
        );
        Ok(Attachment {
            service,
            consumer_tag,
            task,
        })
    }

    async fn bind_subscription(
        &self,
        link: &Link,
        pattern: &ServiceAddress,
        sender: mpsc::UnboundedSender<Envelope>,
    ) -> Result<(String, JoinHandle<()>), MessagingError> {
        let plan = topology::subscription_plan(pattern);
        let mut consumer = link.run(move |ops| plan.start_consumer(ops, true)).await?;
        let consumer_tag = consumer.tag().to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                if sender.send(delivery.into_envelope()).is_err() {
                    break;
                }
            }
        });
        Ok((consumer_tag, task))
    }

    /// Cancel an attachment's consumer and wait for its dispatcher to drain.
    async fn release(&self, attachment: Attachment) {
        let link = self.link.read().clone();
        if let Some(link) = link {
            let tag = attachment.consumer_tag.clone();
            if let Err(e) = link
                .run(move |ops| {
                    ops.channel().cancel(&tag)?;
                    Ok(())
                })
                .await
            {
                debug!(address = %attachment.service.address(), error = %e, "Consumer cancel failed");
            }
        }
        if let Err(e) = attachment.task.await {
            warn!(address = %attachment.service.address(), error = %e, "Dispatcher task failed");
        }
    }

    fn spawn_listener(&self, replies: Consumer) {
        let listener = self.listener.clone();
        tokio::spawn(async move { listener.run(replies).await });
    }

    fn forward_listener_events(&self) {
        let mut updates = self.listener.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(ListenerEvent::UnroutableReply {
                        correlation_id,
                        reason,
                    }) => {
                        let _ = events.send(NodeEvent::UnroutableReply {
                            correlation_id,
                            reason,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reply listener events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn forward_service_events(&self, service: &Service) {
        let mut updates = service.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(ServiceEvent::UnhandledException {
                        address,
                        correlation_id,
                        error,
                    }) => {
                        let _ = events.send(NodeEvent::UnhandledException {
                            address,
                            correlation_id,
                            error,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Service events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// A mandatory publish came back unroutable.
    fn handle_return(&self, returned: ReturnedMessage) {
        let id = returned.properties.correlation_id;
        if id.is_none() {
            debug!(
                exchange = %returned.exchange,
                routing_key = %returned.routing_key,
                "Uncorrelated message returned"
            );
            return;
        }
        let address = format!("{}:{}", returned.exchange, returned.routing_key);
        self.registry.mark_undelivered(id, &address);
    }

    // =========================================================================
    // RECOVERY (driven by the supervisor)
    // =========================================================================

    fn is_disposed(&self) -> bool {
        *self.state.borrow() == NodeState::Disposed
    }

    /// Raise the barrier and fail everything that was in flight.
    fn begin_reconnect(&self, reason: &str) {
        let raised = self.state.send_if_modified(|state| {
            if *state == NodeState::Running {
                *state = NodeState::Reconnecting;
                true
            } else {
                false
            }
        });
        if !raised {
            return;
        }
        if let Some(old) = self.link.write().take() {
            old.abandon();
        }
        let failed = self
            .registry
            .fail_all(MessagingError::ConnectionLost(reason.to_string()));
        warn!(node = %self.id, reason, failed_requests = failed, "Channel lost, reconnecting");
        let _ = self.events.send(NodeEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Open a new link and re-bind every service and subscription to it.
    ///
    /// Services keep their `Service` objects, so counters carry over.
    async fn rebuild(&self) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, MessagingError> {
        let _topology = self.topology.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(MessagingError::Disposed);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (link, channel_events, replies) =
            Link::open(&*self.connection, generation, &self.config).await?;

        let services: Vec<Arc<Service>> = self.services.iter().map(|e| e.service.clone()).collect();
        let mut attachments = Vec::with_capacity(services.len());
        for service in services {
            match self.bind_service(&link, service).await {
                Ok(attachment) => attachments.push(attachment),
                Err(e) => {
                    link.close().await;
                    return Err(e);
                }
            }
        }

        let subscriptions: Vec<(u64, ServiceAddress, mpsc::UnboundedSender<Envelope>)> = self
            .subscriptions
            .iter()
            .map(|e| (*e.key(), e.pattern.clone(), e.sender.clone()))
            .collect();
        let mut rebound = Vec::with_capacity(subscriptions.len());
        for (id, pattern, sender) in subscriptions {
            match self.bind_subscription(&link, &pattern, sender).await {
                Ok((tag, task)) => rebound.push((id, tag, task)),
                Err(e) => {
                    link.close().await;
                    return Err(e);
                }
            }
        }

        if self.shutdown.is_cancelled() {
            link.close().await;
            return Err(MessagingError::Disposed);
        }

        let services = attachments.len();
        for attachment in attachments {
            self.services
                .insert(attachment.service.address().clone(), attachment);
        }
        for (id, tag, task) in rebound {
            match self.subscriptions.get_mut(&id) {
                Some(mut entry) => {
                    entry.task.abort();
                    entry.consumer_tag = tag;
                    entry.task = task;
                }
                None => {
                    // Closed while rebinding.
                    task.abort();
                    link.enqueue("cancel-subscription", move |ops| {
                        ops.channel().cancel(&tag)?;
                        Ok(())
                    });
                }
            }
        }

        self.spawn_listener(replies);
        *self.link.write() = Some(link);
        self.state.send_if_modified(|state| {
            if *state == NodeState::Reconnecting {
                *state = NodeState::Running;
                true
            } else {
                false
            }
        });
        info!(node = %self.id, generation, services, "Channel rebuilt");
        Ok(channel_events)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(link) = self.link.get_mut().take() {
            // No other owner can issue commands once the node is gone.
            let _ = link.channel().close();
            link.abandon();
        }
    }
}
