pub mod manager;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Fixed consumer parameters every subscription is created with, plus the
/// discovery endpoints from configuration.
#[derive(Debug, Clone)]
pub struct ConsumerParams {
    pub lookupd_addresses: Vec<String>,
    pub max_in_flight: usize,
    /// Delivery attempts before the transport gives a message up.
    pub max_attempts: u16,
    pub default_requeue_delay: Duration,
    pub max_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub msg_timeout: Duration,
}

impl Default for ConsumerParams {
    fn default() -> Self {
        Self {
            lookupd_addresses: Vec::new(),
            max_in_flight: 1000,
            max_attempts: 5,
            default_requeue_delay: Duration::ZERO,
            max_backoff: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            msg_timeout: Duration::from_secs(60),
        }
    }
}

/// A delivery as it arrives off the wire, before decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: String,
    pub body: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub attempts: u16,
}

/// One in-flight delivery. Exactly one of `finish`/`requeue` decides its
/// fate; a drop without either counts as finished.
pub trait BusDelivery: Send {
    fn raw(&self) -> &RawMessage;

    /// Acknowledge the delivery as processed.
    fn finish(self: Box<Self>);

    /// Hand the delivery back for redelivery per the transport's policy.
    fn requeue(self: Box<Self>);
}

/// An open subscription on one `(topic, channel)` pair.
#[async_trait]
pub trait BusSubscription: Send {
    /// Next delivery; `None` once the subscription yields nothing again.
    async fn next(&mut self) -> Option<Box<dyn BusDelivery>>;
}

/// Seam to the message-broker client. Implementations own connection
/// management and endpoint discovery; the consumer manager only subscribes.
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        params: &ConsumerParams,
    ) -> Result<Box<dyn BusSubscription>>;
}
