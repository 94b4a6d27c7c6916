//! Message bus abstraction.
//!
//! The discovery runtime talks to an AMQP-style broker: named exchanges of a
//! given [`ExchangeKind`], queues bound to them by routing key, per-consumer
//! prefetch and explicit acknowledgement. [`MemoryBus`] implements the same
//! semantics in process.

mod memory;
mod topic;

use std::fmt;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::BusError;

pub use memory::{MemoryBroker, MemoryBus};
pub use topic::topic_matches;

/// The nameless exchange that routes straight to the queue named by the
/// routing key.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// Removed once its last consumer goes away.
    pub auto_delete: bool,
    /// Owned by the declaring connection and removed with it.
    pub exclusive: bool,
    pub max_priority: Option<u8>,
    pub dead_letter_exchange: Option<String>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    pub fn auto_delete() -> Self {
        Self {
            auto_delete: true,
            ..Self::default()
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub priority: u8,
    pub reply_to: Option<String>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, BusError> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries held by this consumer; 0 means
    /// unlimited.
    pub prefetch: u16,
}

impl ConsumeOptions {
    pub fn with_prefetch(prefetch: u16) -> Self {
        Self { prefetch }
    }
}

/// Broker operations used by the discovery runtime.
#[async_trait]
pub trait MessageBus: Send + Sync + fmt::Debug + 'static {
    /// Idempotent; fails if the exchange exists with another kind.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), BusError>;

    /// Idempotent; fails if the queue exists with other options. An empty
    /// name asks the broker to generate one. Returns the queue name.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BusError>;

    /// Checks that a queue exists without creating it.
    async fn declare_queue_passive(&self, name: &str) -> Result<(), BusError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BusError>;

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, BusError>;
}

/// Transport side of a [`Consumer`].
#[async_trait]
pub trait DeliveryStream: Send + 'static {
    /// `None` once the consumer has been cancelled or its connection lost.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}

/// Transport side of a [`Delivery`] acknowledgement.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), BusError>;
    async fn reject(&self, requeue: bool) -> Result<(), BusError>;
}

pub struct Consumer {
    queue: String,
    stream: Box<dyn DeliveryStream>,
}

impl Consumer {
    pub fn new(queue: impl Into<String>, stream: Box<dyn DeliveryStream>) -> Self {
        Self {
            queue: queue.into(),
            stream,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.stream.next_delivery().await
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("queue", &self.queue).finish()
    }
}

/// A message handed to a consumer. It stays unacknowledged (and counts
/// against the consumer's prefetch) until [`ack`](Self::ack) or
/// [`reject`](Self::reject) is called.
pub struct Delivery {
    pub message: Message,
    pub redelivered: bool,
    pub delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        message: Message,
        redelivered: bool,
        delivery_tag: u64,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            message,
            redelivered,
            delivery_tag,
            acker,
        }
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.message.reply_to.as_deref()
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.message.body.len())
            .field("reply_to", &self.message.reply_to)
            .finish()
    }
}
