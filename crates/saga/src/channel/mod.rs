//! Publish/subscribe transport between saga steps.
//!
//! Every orchestrator publishes to and consumes from one topic. Delivery is
//! at-least-once: a delivery that is not acknowledged comes back after a
//! backoff until the attempt bound is reached, then it is dead-lettered.

pub mod memory;
pub mod postgres;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::ChannelError;
use crate::event::Event;

pub use memory::{DEFAULT_HISTORY_LIMIT, DeadLetter, InMemoryChannel};
pub use postgres::{PostgresChannel, PostgresChannelConfig};

/// Stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// A message transport with at-least-once delivery.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Publishes an event to a topic.
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), ChannelError>;

    /// Subscribes to a topic. Several subscriptions on the same topic compete
    /// for messages; each message goes to one of them.
    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, ChannelError>;

    /// Deletes dead-lettered messages older than `older_than`, on every
    /// topic. Returns how many were deleted.
    async fn purge_dead_letters(&self, older_than: Duration) -> Result<u64, ChannelError>;
}

/// Settles a single delivery with the channel it came from.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The message was processed; it will not be delivered again.
    async fn ack(self: Box<Self>) -> Result<(), ChannelError>;

    /// Processing failed; redeliver after a backoff, or dead-letter the
    /// message if this was the last attempt.
    async fn nack(self: Box<Self>, reason: &str) -> Result<(), ChannelError>;

    /// Processing can never succeed; dead-letter the message now.
    async fn reject(self: Box<Self>, reason: &str) -> Result<(), ChannelError>;
}

/// One received message together with the means to settle it.
pub struct Delivery {
    event: Event,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(event: Event, attempt: u32, acker: impl Acknowledger + 'static) -> Self {
        Self {
            event,
            attempt,
            acker: Box::new(acker),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// 1-based delivery attempt of this message.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub async fn ack(self) -> Result<(), ChannelError> {
        self.acker.ack().await
    }

    pub async fn nack(self, reason: &str) -> Result<(), ChannelError> {
        self.acker.nack(reason).await
    }

    pub async fn reject(self, reason: &str) -> Result<(), ChannelError> {
        self.acker.reject(reason).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
