//! Bus supervisor
//!
//! Registry of running consumers, one per agent, behind a single
//! enable/disable switch. Supervisor operations never fail; problems are
//! logged and the call carries on.

use super::address::AgentId;
use super::consumer::{ConsumerStatus, LogConsumer};
use super::sinks::MessageHandler;
use super::store::MessageStore;
use crate::config::BusConfig;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Snapshot of the whole bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusStatus {
    pub enabled: bool,
    pub count: usize,
    pub consumers: BTreeMap<String, ConsumerStatus>,
}

/// Owns the consumers of one bus instance
pub struct BusSupervisor {
    config: Arc<BusConfig>,
    enabled: AtomicBool,
    consumers: Mutex<HashMap<AgentId, Arc<LogConsumer>>>,
}

impl BusSupervisor {
    pub fn new(config: BusConfig) -> Self {
        Self::with_shared_config(Arc::new(config))
    }

    pub fn with_shared_config(config: Arc<BusConfig>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// A store writing into this bus's message directory
    pub fn store(&self) -> MessageStore {
        MessageStore::from_config(&self.config)
    }

    /// Allow new consumers to start
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        info!("Message bus enabled");
    }

    /// Refuse new consumers; running ones are left alone
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("Message bus disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start a consumer for `agent`, or return the one already registered
    ///
    /// The consumer is registered before its backlog replay, so
    /// `stop_consumer` reaches it while it is still starting. Returns `None`
    /// when the bus is disabled, the consumer failed to start, or it was
    /// stopped before it finished starting.
    pub async fn start_consumer(
        &self,
        agent: &AgentId,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<LogConsumer>> {
        if !self.is_enabled() {
            debug!(agent = %agent, "Bus disabled, not starting consumer");
            return None;
        }

        let consumer = {
            let mut consumers = self.consumers.lock().await;
            if let Some(existing) = consumers.get(agent) {
                debug!(agent = %agent, "Consumer already registered");
                return Some(existing.clone());
            }
            let consumer = Arc::new(LogConsumer::new(
                agent.clone(),
                self.config.clone(),
                handler,
            ));
            consumers.insert(agent.clone(), consumer.clone());
            consumer
        };

        // Started outside the lock; backlog replay may take a while
        if let Err(e) = consumer.start().await {
            warn!(agent = %agent, error = %e, "Failed to start consumer");
            self.deregister(agent, &consumer).await;
            return None;
        }

        // stop_consumer may have run between registration and start
        if !self.is_registered(agent, &consumer).await {
            debug!(agent = %agent, "Consumer deregistered while starting");
            if let Err(e) = consumer.stop().await {
                warn!(agent = %agent, error = %e, "Failed to stop deregistered consumer");
            }
            return None;
        }

        info!(agent = %agent, "Consumer registered");
        Some(consumer)
    }

    async fn is_registered(&self, agent: &AgentId, consumer: &Arc<LogConsumer>) -> bool {
        self.consumers
            .lock()
            .await
            .get(agent)
            .is_some_and(|current| Arc::ptr_eq(current, consumer))
    }

    /// Remove `consumer` unless another instance has replaced it
    async fn deregister(&self, agent: &AgentId, consumer: &Arc<LogConsumer>) {
        let mut consumers = self.consumers.lock().await;
        if consumers
            .get(agent)
            .is_some_and(|current| Arc::ptr_eq(current, consumer))
        {
            consumers.remove(agent);
        }
    }

    /// Stop and deregister a consumer
    pub async fn stop_consumer(&self, agent: &AgentId) {
        let removed = self.consumers.lock().await.remove(agent);
        match removed {
            Some(consumer) => {
                if let Err(e) = consumer.stop().await {
                    warn!(agent = %agent, error = %e, "Consumer did not stop cleanly");
                }
            }
            None => warn!(agent = %agent, "No consumer registered"),
        }
    }

    /// Stop every consumer concurrently
    pub async fn stop_all(&self) {
        let drained: Vec<(AgentId, Arc<LogConsumer>)> =
            self.consumers.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        let results = join_all(drained.into_iter().map(|(agent, consumer)| async move {
            let result = consumer.stop().await;
            (agent, result)
        }))
        .await;

        for (agent, result) in results {
            if let Err(e) = result {
                warn!(agent = %agent, error = %e, "Consumer did not stop cleanly");
            }
        }
        info!(count, "Stopped all consumers");
    }

    /// The registered consumer for `agent`, if any
    pub async fn consumer(&self, agent: &AgentId) -> Option<Arc<LogConsumer>> {
        self.consumers.lock().await.get(agent).cloned()
    }

    pub async fn status(&self) -> BusStatus {
        let consumers = self.consumers.lock().await;
        BusStatus {
            enabled: self.is_enabled(),
            count: consumers.len(),
            consumers: consumers
                .iter()
                .map(|(agent, consumer)| (agent.to_string(), consumer.status()))
                .collect(),
        }
    }

    /// Disable the bus and stop everything
    pub async fn shutdown(&self) {
        self.disable();
        self.stop_all().await;
    }
}
