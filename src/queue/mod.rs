//! Queues and the queue registry
//!
//! A [`Queue`] is the immutable half of a named queue: its identity and
//! configuration. The mutable half lives in [`QueueData`]. A configuration
//! reload builds a fresh `Queue` around the *same* `QueueData`, swaps it
//! into the registry, and lets in-flight callers finish against the value
//! they resolved.

pub mod data;

pub use data::{QueueData, QueueStats, RrCursor, WaitingEntry, WaitingList};

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::QueueConfig;
use crate::error::{AcdError, Result};

/// One named queue: identity plus configuration
///
/// Immutable post-construction; mutation happens in [`QueueData`] or by
/// replacing the whole value through [`QueueRegistry::reload`].
#[derive(Debug)]
pub struct Queue {
    name: String,
    config: QueueConfig,
    data: Arc<QueueData>,
}

impl Queue {
    fn build(name: &str, config: QueueConfig, data: Arc<QueueData>) -> Result<Arc<Self>> {
        if name.is_empty() {
            return Err(AcdError::configuration("queue name cannot be empty"));
        }
        config.validate()?;
        Ok(Arc::new(Queue { name: name.to_string(), config, data }))
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The shared mutable half.
    pub fn data(&self) -> &Arc<QueueData> {
        &self.data
    }

    /// Whether another waiting caller fits under `maxlen`.
    pub fn has_room(&self) -> bool {
        self.config.maxlen == 0 || self.data.count() < self.config.maxlen
    }
}

/// Registry of queues by name
///
/// # Examples
///
/// ```
/// use acd_engine::queue::QueueRegistry;
/// use acd_engine::config::QueueConfig;
///
/// let registry = QueueRegistry::new();
/// registry.create("support", QueueConfig::default()).unwrap();
/// assert!(registry.get("support").is_some());
/// assert!(registry.create("support", QueueConfig::default()).is_err());
/// ```
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: DashMap<String, Arc<Queue>>,
}

impl QueueRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        QueueRegistry { queues: DashMap::new() }
    }

    /// Create a queue with fresh state.
    pub fn create(&self, name: &str, config: QueueConfig) -> Result<Arc<Queue>> {
        if self.queues.contains_key(name) {
            return Err(AcdError::already_exists(format!("queue {} already exists", name)));
        }
        let queue = Queue::build(name, config, Arc::new(QueueData::new()))?;
        info!("📋 Created queue {} (strategy {})", name, queue.config().strategy);
        self.queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Look up a queue by name.
    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|entry| entry.value().clone())
    }

    /// Look up a queue, surfacing a typed error for unknown names.
    pub fn require(&self, name: &str) -> Result<Arc<Queue>> {
        self.get(name)
            .ok_or_else(|| AcdError::not_found(format!("queue not found: {}", name)))
    }

    /// Replace a queue's configuration
    ///
    /// Builds a fresh immutable [`Queue`] sharing the old value's
    /// [`QueueData`], so live statistics and the waiting list survive.
    /// Callers that already resolved the old value keep it until they
    /// finish.
    pub fn reload(&self, name: &str, config: QueueConfig) -> Result<Arc<Queue>> {
        let old = self.require(name)?;
        let queue = Queue::build(name, config, old.data().clone())?;
        info!("📋 Reloaded queue {} (strategy {})", name, queue.config().strategy);
        self.queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Remove a queue entirely. In-flight callers keep their reference.
    pub fn remove(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.remove(name).map(|(_, queue)| queue)
    }

    /// Names of every queue.
    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every queue, for cross-queue scans (weight preemption,
    /// autopause-all, device fan-out).
    pub fn snapshot(&self) -> Vec<Arc<Queue>> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
