//! # Consumers
//!
//! The receiving side of a queue subscription.

use crate::transport::Delivery;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// The consumer was cancelled or its channel closed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("consumer closed")]
pub struct ConsumerClosed;

/// A queue subscription handle.
///
/// The delivery stream ends when the consumer is cancelled or its channel
/// closes.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    queue: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub(crate) fn new(
        tag: String,
        queue: String,
        receiver: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            tag,
            queue,
            receiver,
        }
    }

    /// Tag used to cancel this consumer.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Queue being consumed.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Receive the next delivery. `None` once the consumer has ended.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Receive without waiting.
    ///
    /// - `Ok(Some(delivery))` - a delivery was buffered
    /// - `Ok(None)` - nothing buffered yet
    /// - `Err(ConsumerClosed)` - the consumer has ended
    pub fn try_recv(&mut self) -> Result<Option<Delivery>, ConsumerClosed> {
        match self.receiver.try_recv() {
            Ok(delivery) => Ok(Some(delivery)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ConsumerClosed),
        }
    }

    /// Convert into a [`Stream`].
    #[must_use]
    pub fn into_stream(self) -> DeliveryStream {
        DeliveryStream { consumer: self }
    }
}

/// Stream adapter over a [`Consumer`].
#[derive(Debug)]
pub struct DeliveryStream {
    consumer: Consumer,
}

impl DeliveryStream {
    #[must_use]
    pub fn tag(&self) -> &str {
        self.consumer.tag()
    }
}

impl Stream for DeliveryStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.consumer.receiver.poll_recv(cx)
    }
}
