//! One broker channel and everything bound to its lifetime.
//!
//! A [`Link`] is replaced wholesale when the supervisor rebuilds the
//! connection; nothing from an old link is reused.

use crate::container::config::NodeConfig;
use mb_01_serial_executor::SerialExecutor;
use parking_lot::Mutex;
use shared_bus::{BrokerChannel, BrokerConnection, ChannelEvent, Consumer, ExchangeKind, QueueOptions};
use shared_types::MessagingError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Channel handle passed into executor operations.
#[derive(Clone)]
pub(crate) struct ChannelOps {
    channel: Arc<dyn BrokerChannel>,
    exchanges: Arc<Mutex<HashSet<String>>>,
}

impl ChannelOps {
    fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            channel,
            exchanges: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub(crate) fn channel(&self) -> &dyn BrokerChannel {
        &*self.channel
    }

    /// Declare the topic exchange for a namespace once per channel.
    pub(crate) fn ensure_exchange(&self, name: &str) -> Result<(), MessagingError> {
        if self.exchanges.lock().contains(name) {
            return Ok(());
        }
        self.channel.declare_exchange(name, ExchangeKind::Topic)?;
        self.exchanges.lock().insert(name.to_string());
        Ok(())
    }
}

/// A channel, its serial executor and the private reply queue.
pub(crate) struct Link {
    generation: u64,
    ops: ChannelOps,
    executor: Arc<SerialExecutor>,
    reply_queue: String,
}

impl Link {
    /// Open a channel, start its executor and begin consuming the reply
    /// queue.
    ///
    /// Returns the link, the channel's event stream and the reply consumer.
    pub(crate) async fn open(
        connection: &dyn BrokerConnection,
        generation: u64,
        config: &NodeConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>, Consumer), MessagingError> {
        let (channel, events) = connection.create_channel()?;
        let executor = Arc::new(SerialExecutor::start(format!(
            "{}-{}",
            config.app_id, generation
        ))?);

        let expiry = config.reply_queue_expiry;
        let reply_channel = channel.clone();
        let declared = executor
            .enqueue_and_await(move || {
                let queue = reply_channel.declare_queue(
                    QueueOptions::named("")
                        .exclusive(true)
                        .auto_delete(true)
                        .expires(expiry),
                )?;
                Ok(reply_channel.consume(&queue, true, true)?)
            })
            .await;
        let replies = match declared {
            Ok(consumer) => consumer,
            Err(e) => {
                let _ = channel.close();
                executor.shutdown();
                return Err(e);
            }
        };

        let link = Arc::new(Self {
            generation,
            ops: ChannelOps::new(channel),
            executor,
            reply_queue: replies.queue().to_string(),
        });
        info!(
            generation,
            channel = link.ops.channel.id(),
            reply_queue = %link.reply_queue,
            "Broker link established"
        );
        Ok((link, events, replies))
    }

    #[must_use]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub(crate) fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub(crate) fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.ops.channel.clone()
    }

    pub(crate) fn executor(&self) -> Arc<SerialExecutor> {
        self.executor.clone()
    }

    /// Run a channel operation on the executor and wait for it.
    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T, MessagingError>
    where
        F: FnOnce(&ChannelOps) -> Result<T, MessagingError> + Send + 'static,
        T: Send + 'static,
    {
        let ops = self.ops.clone();
        self.executor.enqueue_and_await(move || op(&ops)).await
    }

    /// Queue a channel operation without waiting.
    pub(crate) fn enqueue<F>(&self, label: &'static str, op: F)
    where
        F: FnOnce(&ChannelOps) -> Result<(), MessagingError> + Send + 'static,
    {
        let ops = self.ops.clone();
        self.executor.enqueue(label, move || op(&ops));
    }

    /// Stop the executor without touching the channel (already gone).
    pub(crate) fn abandon(&self) {
        self.executor.shutdown();
    }

    /// Close the channel, then stop the executor.
    pub(crate) async fn close(&self) {
        if let Err(e) = self
            .run(|ops| {
                ops.channel().close()?;
                Ok(())
            })
            .await
        {
            debug!(generation = self.generation, error = %e, "Channel close failed");
        }
        self.executor.shutdown();
    }
}
