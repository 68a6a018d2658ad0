use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusSubscription, BusTransport, ConsumerParams};
use crate::catalog::Catalog;
use crate::engine::executor::Executor;
use crate::engine::types::{BusMessage, WorkflowConfig};
use crate::error::{Error, Result};

/// Per-consumer counters, mirroring the broker client's notion of stats.
#[derive(Default)]
struct ConsumerStats {
    received: AtomicU64,
    finished: AtomicU64,
    requeued: AtomicU64,
    connections: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub topic: String,
    pub channel: String,
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub connections: u64,
}

struct ConsumerHandle {
    topic: String,
    channel: String,
    stats: Arc<ConsumerStats>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Keeps the live consumer set in sync with the enabled workflows and
/// dispatches every delivery to the executor.
pub struct ConsumerManager {
    transport: Arc<dyn BusTransport>,
    executor: Arc<Executor>,
    catalog: Arc<dyn Catalog>,
    params: ConsumerParams,
    consumers: RwLock<HashMap<String, ConsumerHandle>>,
    cancel: CancellationToken,
}

impl ConsumerManager {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        executor: Arc<Executor>,
        catalog: Arc<dyn Catalog>,
        params: ConsumerParams,
    ) -> Self {
        Self {
            transport,
            executor,
            catalog,
            params,
            consumers: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn key(topic: &str, channel: &str) -> String {
        format!("{}:{}", topic, channel)
    }

    /// Subscribe a consumer for `(topic, channel)`. Refuses if one already
    /// exists; a subscription failure leaves no entry behind.
    pub async fn add(&self, topic: &str, channel: &str) -> Result<()> {
        let key = Self::key(topic, channel);
        let mut consumers = self.consumers.write().await;
        if consumers.contains_key(&key) {
            return Err(Error::Config(format!(
                "consumer for topic {} channel {} already exists",
                topic, channel
            )));
        }

        let subscription = self.transport.subscribe(topic, channel, &self.params).await?;

        let stats = Arc::new(ConsumerStats::default());
        // The intake token stops this consumer's loop; executions hang off
        // the manager token so removing one consumer does not abort
        // workflows it already dispatched.
        let intake_cancel = self.cancel.child_token();
        let join = tokio::spawn(consume_loop(
            subscription,
            topic.to_string(),
            channel.to_string(),
            self.executor.clone(),
            self.catalog.clone(),
            stats.clone(),
            intake_cancel.clone(),
            self.cancel.clone(),
            self.params.max_in_flight,
        ));

        consumers.insert(
            key,
            ConsumerHandle {
                topic: topic.to_string(),
                channel: channel.to_string(),
                stats,
                cancel: intake_cancel,
                join,
            },
        );

        info!(topic, channel, "Consumer added");
        Ok(())
    }

    /// Stop the consumer for `(topic, channel)`, wait for its loop to drain
    /// in-flight handler invocations, and drop the entry.
    pub async fn remove(&self, topic: &str, channel: &str) -> Result<()> {
        let key = Self::key(topic, channel);
        let mut consumers = self.consumers.write().await;
        let handle = consumers.remove(&key).ok_or_else(|| {
            Error::NotFound(format!(
                "consumer for topic {} channel {} not found",
                topic, channel
            ))
        })?;

        handle.cancel.cancel();
        if let Err(e) = handle.join.await {
            error!(%key, error = %e, "Consumer task join failed");
        }

        info!(topic, channel, "Consumer removed");
        Ok(())
    }

    /// Snapshot of the live consumer keys.
    pub async fn list(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }

    /// Per-consumer counters.
    pub async fn stats(&self) -> HashMap<String, ConsumerStatsSnapshot> {
        self.consumers
            .read()
            .await
            .iter()
            .map(|(key, handle)| {
                (
                    key.clone(),
                    ConsumerStatsSnapshot {
                        topic: handle.topic.clone(),
                        channel: handle.channel.clone(),
                        messages_received: handle.stats.received.load(Ordering::Relaxed),
                        messages_finished: handle.stats.finished.load(Ordering::Relaxed),
                        messages_requeued: handle.stats.requeued.load(Ordering::Relaxed),
                        connections: handle.stats.connections.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    /// Reconcile the consumer set to the enabled workflows: tear down
    /// consumers no longer required, add consumers for new keys, leave
    /// matching ones untouched.
    pub async fn reload(&self, workflows: &[WorkflowConfig]) -> Result<()> {
        info!("Reloading consumers");

        let required: HashSet<String> = workflows
            .iter()
            .filter(|w| w.enabled)
            .map(|w| w.subscription_key())
            .collect();

        // Removals happen under the write lock; additions go through add(),
        // which re-acquires it, so the lock is released in between.
        {
            let mut consumers = self.consumers.write().await;
            let stale: Vec<String> = consumers
                .keys()
                .filter(|key| !required.contains(*key))
                .cloned()
                .collect();
            for key in stale {
                if let Some(handle) = consumers.remove(&key) {
                    handle.cancel.cancel();
                    if let Err(e) = handle.join.await {
                        error!(%key, error = %e, "Consumer task join failed");
                    }
                    info!(%key, "Removed consumer");
                }
            }
        }

        for workflow in workflows.iter().filter(|w| w.enabled) {
            let key = workflow.subscription_key();
            let exists = self.consumers.read().await.contains_key(&key);
            if !exists {
                if let Err(e) = self.add(&workflow.topic, &workflow.channel).await {
                    error!(%key, error = %e, "Failed to add consumer");
                }
            }
        }

        let active = self.consumers.read().await.len();
        info!(active, "Consumers reloaded");
        Ok(())
    }

    /// Cancel the manager context and tear down every consumer. In-flight
    /// executions abort with a cancellation error.
    pub async fn stop(&self) {
        info!("Stopping consumer manager");
        self.cancel.cancel();

        let handles: Vec<(String, ConsumerHandle)> = {
            let mut consumers = self.consumers.write().await;
            consumers.drain().collect()
        };
        for (key, handle) in handles {
            if let Err(e) = handle.join.await {
                error!(%key, error = %e, "Consumer task join failed");
            }
        }

        info!("Consumer manager stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn consume_loop(
    mut subscription: Box<dyn BusSubscription>,
    topic: String,
    channel: String,
    executor: Arc<Executor>,
    catalog: Arc<dyn Catalog>,
    stats: Arc<ConsumerStats>,
    intake_cancel: CancellationToken,
    exec_cancel: CancellationToken,
    max_in_flight: usize,
) {
    stats.connections.store(1, Ordering::Relaxed);
    let in_flight = Arc::new(Semaphore::new(max_in_flight));

    loop {
        let delivery = tokio::select! {
            _ = intake_cancel.cancelled() => break,
            delivery = subscription.next() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        stats.received.fetch_add(1, Ordering::Relaxed);

        let permit = tokio::select! {
            _ = intake_cancel.cancelled() => break,
            permit = in_flight.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let topic = topic.clone();
        let channel = channel.clone();
        let executor = executor.clone();
        let catalog = catalog.clone();
        let stats = stats.clone();
        let cancel = exec_cancel.child_token();

        tokio::spawn(async move {
            let raw = delivery.raw();
            let message =
                BusMessage::decode(&topic, &channel, &raw.id, &raw.body, raw.timestamp, raw.attempts);

            match handle_message(&executor, catalog.as_ref(), message, cancel).await {
                Ok(instance_id) => {
                    debug!(%topic, %channel, instance = %instance_id, "Message dispatched");
                    stats.finished.fetch_add(1, Ordering::Relaxed);
                    delivery.finish();
                }
                Err(e) => {
                    warn!(%topic, %channel, error = %e, "Message handling failed, requeueing");
                    stats.requeued.fetch_add(1, Ordering::Relaxed);
                    delivery.requeue();
                }
            }
            drop(permit);
        });
    }

    // Cooperative stop: drain in-flight handlers before reporting stopped.
    let _ = in_flight.acquire_many(max_in_flight as u32).await;
    stats.connections.store(0, Ordering::Relaxed);
    debug!(%topic, %channel, "Consumer loop stopped");
}

/// The message-handler contract: look up the active workflow and dispatch
/// to the executor. Any error is the bus's redelivery signal; workflow-level
/// retries are independent of it.
async fn handle_message(
    executor: &Executor,
    catalog: &dyn Catalog,
    message: BusMessage,
    cancel: CancellationToken,
) -> Result<String> {
    let workflow = catalog
        .find_enabled_workflow(&message.topic, &message.channel)
        .await?;
    executor.execute(&workflow, message, cancel).await
}
