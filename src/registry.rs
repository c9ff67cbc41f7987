use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Notify, RwLock};

use crate::store::ConsumerSpec;

/// In-memory state for a queue currently being consumed (spec §3).
///
/// Lifetime runs from a successful `Subscribe` until explicit stop,
/// queue-drained, queue-deleted, or a channel-epoch change.
#[derive(Debug, Clone)]
pub struct RuntimeConsumer {
  pub queue: String,
  pub webhook: String,
  pub min_interval_ms: u64,
  pub max_interval_ms: u64,
  pub business_hours_start: u8,
  pub business_hours_end: u8,
  pub broker_tag: String,
  pub epoch: u64,
  pub paused: bool,
  pub last_message: Option<Value>,
  pub next_interval_ms: Option<u64>,
  /// Fired by the Supervisor on epoch bump so a consumer sleeping through
  /// its inter-message delay wakes promptly (spec §4.E, "interruptible by
  /// epoch change at implementer's discretion").
  pub wake: Arc<Notify>,
}

impl RuntimeConsumer {
  pub fn from_spec(spec: &ConsumerSpec, broker_tag: String, epoch: u64) -> Self {
    RuntimeConsumer {
      queue: spec.queue.clone(),
      webhook: spec.webhook.clone(),
      min_interval_ms: spec.min_interval_ms,
      max_interval_ms: spec.max_interval_ms,
      business_hours_start: spec.business_hours_start,
      business_hours_end: spec.business_hours_end,
      broker_tag,
      epoch,
      paused: spec.paused,
      last_message: None,
      next_interval_ms: None,
      wake: Arc::new(Notify::new()),
    }
  }
}

/// Thread-safe `queue -> RuntimeConsumer` map; the runtime source of truth
/// for what is currently being consumed (spec §4.D).
#[derive(Debug, Default, Clone)]
pub struct ConsumerRegistry {
  inner: Arc<RwLock<HashMap<String, RuntimeConsumer>>>,
}

impl ConsumerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn insert(&self, consumer: RuntimeConsumer) {
    self.inner.write().await.insert(consumer.queue.clone(), consumer);
  }

  pub async fn remove(&self, queue: &str) -> Option<RuntimeConsumer> {
    self.inner.write().await.remove(queue)
  }

  pub async fn get(&self, queue: &str) -> Option<RuntimeConsumer> {
    self.inner.read().await.get(queue).cloned()
  }

  pub async fn snapshot(&self) -> Vec<RuntimeConsumer> {
    self.inner.read().await.values().cloned().collect()
  }

  /// Used by the Supervisor immediately before restoration from the Store.
  pub async fn clear(&self) -> Vec<RuntimeConsumer> {
    let mut guard = self.inner.write().await;
    guard.drain().map(|(_, v)| v).collect()
  }

  pub async fn set_paused(&self, queue: &str, paused: bool) -> bool {
    let mut guard = self.inner.write().await;
    match guard.get_mut(queue) {
      Some(consumer) => {
        consumer.paused = paused;
        true
      }
      None => false,
    }
  }

  pub async fn update_last(&self, queue: &str, payload: Value) {
    if let Some(consumer) = self.inner.write().await.get_mut(queue) {
      consumer.last_message = Some(payload);
    }
  }

  pub async fn set_next_interval(&self, queue: &str, interval_ms: Option<u64>) {
    if let Some(consumer) = self.inner.write().await.get_mut(queue) {
      consumer.next_interval_ms = interval_ms;
    }
  }
}
