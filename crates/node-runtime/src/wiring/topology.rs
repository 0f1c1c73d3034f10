//! Queue plans for services and event subscriptions.

use crate::container::link::ChannelOps;
use shared_bus::{Consumer, QueueOptions};
use shared_types::{DeliveryType, MessagingError, ServiceAddress};
use uuid::Uuid;

/// Separates the address from the node id in per-node queue names.
const NODE_SUFFIX_SEPARATOR: char = '%';

/// Everything needed to declare, bind and consume one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuePlan {
    pub(crate) queue: QueueOptions,
    pub(crate) exchange: String,
    pub(crate) binding_key: String,
    /// Request exclusive consumer access.
    pub(crate) exclusive_consumer: bool,
}

/// Plan for a service attached with the given delivery type.
pub(crate) fn service_plan(address: &ServiceAddress, delivery: DeliveryType, node_id: Uuid) -> QueuePlan {
    let shared_name = address.to_string();
    let (queue, exclusive_consumer) = match delivery {
        DeliveryType::Balanced => (QueueOptions::named(shared_name).auto_delete(true), false),
        DeliveryType::Fanout => (
            QueueOptions::named(format!(
                "{}{}{}",
                shared_name,
                NODE_SUFFIX_SEPARATOR,
                node_id.simple()
            ))
            .exclusive(true)
            .auto_delete(true),
            false,
        ),
        DeliveryType::Singleton => (QueueOptions::named(shared_name).auto_delete(true), true),
    };

    QueuePlan {
        queue,
        exchange: address.namespace().to_string(),
        binding_key: address.key().to_string(),
        exclusive_consumer,
    }
}

/// Plan for an event subscription. `pattern` may use `*` and `#`.
pub(crate) fn subscription_plan(pattern: &ServiceAddress) -> QueuePlan {
    QueuePlan {
        queue: QueueOptions::named("").exclusive(true).auto_delete(true),
        exchange: pattern.namespace().to_string(),
        binding_key: pattern.key().to_string(),
        exclusive_consumer: false,
    }
}

impl QueuePlan {
    /// Declare the exchange and queue and bind them. Returns the queue name.
    pub(crate) fn declare(&self, ops: &ChannelOps) -> Result<String, MessagingError> {
        ops.ensure_exchange(&self.exchange)?;
        let name = ops.channel().declare_queue(self.queue.clone())?;
        ops.channel().bind_queue(&name, &self.exchange, &self.binding_key)?;
        Ok(name)
    }

    /// Declare, bind and start consuming.
    ///
    /// # Errors
    ///
    /// `DuplicateSingleton` when another node already consumes a singleton
    /// queue.
    pub(crate) fn start_consumer(&self, ops: &ChannelOps, no_ack: bool) -> Result<Consumer, MessagingError> {
        let name = self.declare(ops)?;
        Ok(ops.channel().consume(&name, self.exclusive_consumer, no_ack)?)
    }
}
