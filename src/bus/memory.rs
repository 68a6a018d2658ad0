use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusDelivery, BusSubscription, BusTransport, ConsumerParams, RawMessage};
use crate::error::Result;

/// In-process transport: a topic fans out to every subscribed channel, and
/// a requeue redelivers with a bumped attempt counter until the attempt
/// cap. Backs the test suite and single-process deployments.
pub struct InMemoryBus {
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
}

struct SubscriptionEntry {
    topic: String,
    tx: mpsc::UnboundedSender<RawMessage>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Publish a message to every channel subscribed on `topic`.
    pub fn publish(&self, topic: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        let mut subscriptions = self.subscriptions.lock().unwrap();
        // Closed subscriptions are pruned as a side effect.
        subscriptions.retain(|entry| {
            if entry.topic != topic {
                return true;
            }
            let message = RawMessage {
                id: Uuid::new_v4().simple().to_string(),
                body: body.clone(),
                timestamp: Utc::now(),
                attempts: 1,
            };
            entry.tx.send(message).is_ok()
        });
    }
}

#[async_trait]
impl BusTransport for InMemoryBus {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        params: &ConsumerParams,
    ) -> Result<Box<dyn BusSubscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push(SubscriptionEntry {
            topic: topic.to_string(),
            tx: tx.clone(),
        });
        debug!(topic, channel, "Subscription opened");

        Ok(Box::new(InMemorySubscription {
            rx,
            requeue_tx: tx,
            requeue_delay: params.default_requeue_delay,
            max_attempts: params.max_attempts,
        }))
    }
}

struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<RawMessage>,
    requeue_tx: mpsc::UnboundedSender<RawMessage>,
    requeue_delay: Duration,
    max_attempts: u16,
}

#[async_trait]
impl BusSubscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Box<dyn BusDelivery>> {
        let message = self.rx.recv().await?;
        Some(Box::new(InMemoryDelivery {
            message,
            requeue_tx: self.requeue_tx.clone(),
            requeue_delay: self.requeue_delay,
            max_attempts: self.max_attempts,
        }))
    }
}

struct InMemoryDelivery {
    message: RawMessage,
    requeue_tx: mpsc::UnboundedSender<RawMessage>,
    requeue_delay: Duration,
    max_attempts: u16,
}

impl BusDelivery for InMemoryDelivery {
    fn raw(&self) -> &RawMessage {
        &self.message
    }

    fn finish(self: Box<Self>) {}

    fn requeue(self: Box<Self>) {
        let mut message = self.message;
        if message.attempts >= self.max_attempts {
            warn!(id = %message.id, attempts = message.attempts, "Delivery exceeded attempt cap, dropping");
            return;
        }
        message.attempts += 1;

        if self.requeue_delay.is_zero() {
            let _ = self.requeue_tx.send(message);
        } else {
            let tx = self.requeue_tx;
            let delay = self.requeue_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(message);
            });
        }
    }
}
