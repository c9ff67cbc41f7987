use std::sync::Arc;

use rand::distributions::{Distribution, Uniform};
use serde_json::Value;

use crate::broker::{Broker, QueueCheck};
use crate::epoch::EpochManager;
use crate::hours::within_business_hours;
use crate::registry::ConsumerRegistry;
use crate::store::Store;
use crate::webhook::{self, WebhookOutcome, WebhookSender};

/// A raw message handed up from the broker, decoupled from `lapin::message::Delivery`
/// so the pipeline can be driven in tests without a live channel.
#[derive(Debug, Clone)]
pub struct RawDelivery {
  pub delivery_tag: u64,
  pub body: Vec<u8>,
}

/// Shared, cloneable handles the Delivery Loop needs. One `DeliveryContext`
/// is built at startup and handed to every per-queue pipeline task.
#[derive(Clone)]
pub struct DeliveryContext {
  pub broker: Arc<dyn Broker>,
  pub registry: ConsumerRegistry,
  pub store: Arc<Store>,
  pub epoch: Arc<EpochManager>,
  pub webhook: Arc<dyn WebhookSender>,
  pub finish_webhook: String,
  pub business_hours_timezone: chrono_tz::Tz,
}

/// What `process_delivery` did with a message, reported for logging/tests.
#[derive(Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
  SkippedStaleEpoch,
  NackedPaused,
  NackedOutsideHours,
  NackedDecodeError,
  NackedTransportError,
  AckedForwarded,
  Drained,
  QueueGone,
  ConsumerVanished,
}

/// Draws `floor(U * (max - min + 1)) + min`, the spec §4.E interval
/// formula. The `+1` makes the `max` endpoint reachable.
pub fn draw_interval_ms(min: u64, max: u64) -> u64 {
  if min == max {
    return min;
  }
  let span = max - min + 1;
  let draw = Uniform::from(0..span).sample(&mut rand::thread_rng());
  draw + min
}

/// Runs the full eleven-step pipeline in spec §4.E for one delivery.
///
/// `captured_epoch` is the epoch recorded when this consumer's `Subscribe`
/// call returned; every channel-facing step re-checks it against
/// `ctx.epoch.current()` and silently no-ops on mismatch (spec §4.C).
pub async fn process_delivery(
  ctx: &DeliveryContext,
  queue: &str,
  captured_epoch: u64,
  delivery: RawDelivery,
) -> PipelineOutcome {
  // Step 1: epoch gate (entry).
  if ctx.epoch.current() != captured_epoch {
    return PipelineOutcome::SkippedStaleEpoch;
  }

  // Step 2: delay. A consumer that vanished from the Registry between
  // Subscribe and here (e.g. raced by an explicit stop) has nothing left
  // to gate on; treat it as vanished rather than guessing an interval.
  let consumer = match ctx.registry.get(queue).await {
    Some(consumer) => consumer,
    None => return PipelineOutcome::ConsumerVanished,
  };
  let interval_ms = consumer
    .next_interval_ms
    .unwrap_or_else(|| draw_interval_ms(consumer.min_interval_ms, consumer.max_interval_ms));

  tokio::select! {
    _ = tokio::time::sleep(std::time::Duration::from_millis(interval_ms)) => {}
    _ = consumer.wake.notified() => {}
  }

  // Step 3: epoch gate (post-sleep).
  if ctx.epoch.current() != captured_epoch {
    return PipelineOutcome::SkippedStaleEpoch;
  }

  // Re-read the consumer: pause/hours may have changed during the sleep.
  let consumer = match ctx.registry.get(queue).await {
    Some(consumer) => consumer,
    None => return PipelineOutcome::ConsumerVanished,
  };

  // Step 4: pause gate.
  if consumer.paused {
    let _ = ctx.broker.nack_requeue(delivery.delivery_tag).await;
    return PipelineOutcome::NackedPaused;
  }

  // Step 5: hours gate.
  if !within_business_hours(
    consumer.business_hours_start,
    consumer.business_hours_end,
    ctx.business_hours_timezone,
  ) {
    let _ = ctx.broker.nack_requeue(delivery.delivery_tag).await;
    return PipelineOutcome::NackedOutsideHours;
  }

  // Step 6: decode.
  let payload: Value = match serde_json::from_slice(&delivery.body) {
    Ok(payload) => payload,
    Err(err) => {
      log::warn!("queue {queue}: payload decode failed, requeuing: {err}");
      let _ = ctx.broker.nack_requeue(delivery.delivery_tag).await;
      return PipelineOutcome::NackedDecodeError;
    }
  };

  // Step 7: forward.
  match ctx.webhook.post_json(&consumer.webhook, &payload).await {
    WebhookOutcome::TransportError(err) => {
      log::warn!("queue {queue}: webhook transport error, requeuing: {err}");
      let _ = ctx.broker.nack_requeue(delivery.delivery_tag).await;
      return PipelineOutcome::NackedTransportError;
    }
    WebhookOutcome::Delivered { status } => {
      if let Err(err) = ctx.broker.ack(delivery.delivery_tag).await {
        log::error!("queue {queue}: ack failed after webhook responded {status}: {err}");
      }
    }
  }

  // Step 8: record.
  ctx.registry.update_last(queue, payload.clone()).await;

  // Step 9: epoch gate (post-ack).
  if ctx.epoch.current() != captured_epoch {
    return PipelineOutcome::SkippedStaleEpoch;
  }

  // Step 10: drain check.
  match ctx.broker.check_queue(queue).await {
    Ok(QueueCheck::NotFound) => {
      teardown(ctx, queue, &consumer.broker_tag).await;
      PipelineOutcome::QueueGone
    }
    Ok(QueueCheck::Found(counts)) if counts.message_count == 0 => {
      teardown(ctx, queue, &consumer.broker_tag).await;
      PipelineOutcome::Drained
    }
    Ok(QueueCheck::Found(_)) => {
      // Step 11: schedule next.
      let next = draw_interval_ms(consumer.min_interval_ms, consumer.max_interval_ms);
      ctx.registry.set_next_interval(queue, Some(next)).await;
      PipelineOutcome::AckedForwarded
    }
    Err(err) => {
      log::error!("queue {queue}: drain check failed: {err}");
      PipelineOutcome::AckedForwarded
    }
  }
}

/// Shared teardown for drain and queue-vanished: cancel the broker
/// subscription, fire the finish notification, then remove from both
/// Registry and Store (spec §3 invariant 3, §4.E step 10). Both removals
/// happen even if `Cancel` errors — a consumer that is gone from the
/// broker's perspective has nothing left to cancel.
async fn teardown(ctx: &DeliveryContext, queue: &str, broker_tag: &str) {
  if let Err(err) = ctx.broker.cancel(broker_tag).await {
    log::warn!("queue {queue}: cancel failed during teardown: {err}");
  }

  let last_message = ctx.registry.get(queue).await.and_then(|c| c.last_message);
  webhook::notify_finish(
    ctx.webhook.as_ref(),
    &ctx.finish_webhook,
    queue,
    last_message.as_ref(),
  )
  .await;

  ctx.registry.remove(queue).await;
  if let Err(err) = ctx.store.delete(queue) {
    crate::error::fatal_exit(&format!("store delete for queue {queue}"), err);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::QueueCounts;
  use crate::error::ForwarderError;
  use crate::registry::RuntimeConsumer;
  use crate::store::ConsumerSpec;
  use async_trait::async_trait;
  use chrono::Utc;
  use std::sync::Mutex;

  #[derive(Default)]
  struct FakeBroker {
    acked: Mutex<Vec<u64>>,
    nacked: Mutex<Vec<u64>>,
    cancelled: Mutex<Vec<String>>,
    queue_check: Mutex<QueueCheck>,
  }

  impl FakeBroker {
    fn with_check(check: QueueCheck) -> Self {
      FakeBroker {
        queue_check: Mutex::new(check),
        ..Default::default()
      }
    }
  }

  impl Default for QueueCheck {
    fn default() -> Self {
      QueueCheck::Found(QueueCounts {
        message_count: 0,
        consumer_count: 1,
      })
    }
  }

  #[async_trait]
  impl Broker for FakeBroker {
    async fn check_queue(&self, _queue: &str) -> Result<QueueCheck, ForwarderError> {
      Ok(*self.queue_check.lock().unwrap())
    }
    async fn ack(&self, delivery_tag: u64) -> Result<(), ForwarderError> {
      self.acked.lock().unwrap().push(delivery_tag);
      Ok(())
    }
    async fn nack_requeue(&self, delivery_tag: u64) -> Result<(), ForwarderError> {
      self.nacked.lock().unwrap().push(delivery_tag);
      Ok(())
    }
    async fn cancel(&self, consumer_tag: &str) -> Result<(), ForwarderError> {
      self.cancelled.lock().unwrap().push(consumer_tag.to_string());
      Ok(())
    }
  }

  struct FakeWebhook {
    outcome: WebhookOutcome,
  }

  #[async_trait]
  impl WebhookSender for FakeWebhook {
    async fn post_json(&self, _url: &str, _body: &Value) -> WebhookOutcome {
      match &self.outcome {
        WebhookOutcome::Delivered { status } => WebhookOutcome::Delivered { status: *status },
        WebhookOutcome::TransportError(e) => WebhookOutcome::TransportError(e.clone()),
      }
    }
  }

  fn temp_store() -> (Arc<Store>, tempfile::TempPath) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.into_temp_path();
    let store = Arc::new(Store::open(path.to_str().unwrap()).unwrap());
    (store, path)
  }

  fn spec(queue: &str, min: u64, max: u64, hours_start: u8, hours_end: u8) -> ConsumerSpec {
    let now = Utc::now();
    ConsumerSpec {
      queue: queue.to_string(),
      webhook: "http://example.com/hook".to_string(),
      min_interval_ms: min,
      max_interval_ms: max,
      business_hours_start: hours_start,
      business_hours_end: hours_end,
      paused: false,
      created_at: now,
      updated_at: now,
    }
  }

  async fn make_ctx(
    broker: FakeBroker,
    webhook_outcome: WebhookOutcome,
  ) -> (DeliveryContext, ConsumerRegistry, Arc<Store>, tempfile::TempPath) {
    let (store, path) = temp_store();
    let registry = ConsumerRegistry::new();
    let ctx = DeliveryContext {
      broker: Arc::new(broker),
      registry: registry.clone(),
      store: store.clone(),
      epoch: Arc::new(EpochManager::new()),
      webhook: Arc::new(FakeWebhook { outcome: webhook_outcome }),
      finish_webhook: "http://example.com/finish".to_string(),
      business_hours_timezone: chrono_tz::UTC,
    };
    (ctx, registry, store, path)
  }

  #[tokio::test]
  async fn happy_path_acks_and_drains() {
    let (ctx, registry, store, _path) = make_ctx(
      FakeBroker::with_check(QueueCheck::Found(QueueCounts {
        message_count: 0,
        consumer_count: 0,
      })),
      WebhookOutcome::Delivered { status: 200 },
    )
    .await;

    let s = spec("q1", 1, 1, 0, 24);
    store.upsert(&s).unwrap();
    registry
      .insert(RuntimeConsumer::from_spec(&s, "tag-1".to_string(), 0))
      .await;

    let outcome = process_delivery(
      &ctx,
      "q1",
      0,
      RawDelivery {
        delivery_tag: 42,
        body: br#"{"x":1}"#.to_vec(),
      },
    )
    .await;

    assert_eq!(outcome, PipelineOutcome::Drained);
    assert!(registry.get("q1").await.is_none());
    assert!(store.get("q1").unwrap().is_none());
  }

  #[tokio::test]
  async fn paused_consumer_nacks_without_calling_webhook() {
    let (ctx, registry, store, _path) = make_ctx(
      FakeBroker::default(),
      WebhookOutcome::Delivered { status: 200 },
    )
    .await;

    let mut s = spec("q1", 1, 1, 0, 24);
    s.paused = true;
    store.upsert(&s).unwrap();
    let mut runtime = RuntimeConsumer::from_spec(&s, "tag-1".to_string(), 0);
    runtime.paused = true;
    registry.insert(runtime).await;

    let outcome = process_delivery(
      &ctx,
      "q1",
      0,
      RawDelivery {
        delivery_tag: 1,
        body: br#"{}"#.to_vec(),
      },
    )
    .await;

    assert_eq!(outcome, PipelineOutcome::NackedPaused);
  }

  #[tokio::test]
  async fn outside_hours_nacks_without_calling_webhook() {
    let (ctx, registry, store, _path) = make_ctx(
      FakeBroker::default(),
      WebhookOutcome::Delivered { status: 200 },
    )
    .await;

    // Window [5,5) is always empty regardless of wall time.
    let s = spec("q1", 1, 1, 5, 5);
    store.upsert(&s).unwrap();
    registry
      .insert(RuntimeConsumer::from_spec(&s, "tag-1".to_string(), 0))
      .await;

    let outcome = process_delivery(
      &ctx,
      "q1",
      0,
      RawDelivery {
        delivery_tag: 1,
        body: br#"{}"#.to_vec(),
      },
    )
    .await;

    assert_eq!(outcome, PipelineOutcome::NackedOutsideHours);
  }

  #[tokio::test]
  async fn decode_failure_nacks_requeue() {
    let (ctx, registry, store, _path) = make_ctx(
      FakeBroker::default(),
      WebhookOutcome::Delivered { status: 200 },
    )
    .await;

    let s = spec("q1", 1, 1, 0, 24);
    store.upsert(&s).unwrap();
    registry
      .insert(RuntimeConsumer::from_spec(&s, "tag-1".to_string(), 0))
      .await;

    let outcome = process_delivery(
      &ctx,
      "q1",
      0,
      RawDelivery {
        delivery_tag: 1,
        body: b"not json".to_vec(),
      },
    )
    .await;

    assert_eq!(outcome, PipelineOutcome::NackedDecodeError);
  }

  #[tokio::test]
  async fn webhook_5xx_is_treated_as_delivered() {
    let (ctx, registry, store, _path) = make_ctx(
      FakeBroker::with_check(QueueCheck::Found(QueueCounts {
        message_count: 3,
        consumer_count: 1,
      })),
      WebhookOutcome::Delivered { status: 500 },
    )
    .await;

    let s = spec("q1", 1, 1, 0, 24);
    store.upsert(&s).unwrap();
    registry
      .insert(RuntimeConsumer::from_spec(&s, "tag-1".to_string(), 0))
      .await;

    let outcome = process_delivery(
      &ctx,
      "q1",
      0,
      RawDelivery {
        delivery_tag: 7,
        body: br#"{"y":2}"#.to_vec(),
      },
    )
    .await;

    assert_eq!(outcome, PipelineOutcome::AckedForwarded);
    assert_eq!(
      registry.get("q1").await.unwrap().last_message,
      Some(serde_json::json!({"y": 2}))
    );
  }

  #[tokio::test]
  async fn transport_error_nacks_requeue() {
    let (ctx, registry, store, _path) = make_ctx(
      FakeBroker::default(),
      WebhookOutcome::TransportError("connection refused".to_string()),
    )
    .await;

    let s = spec("q1", 1, 1, 0, 24);
    store.upsert(&s).unwrap();
    registry
      .insert(RuntimeConsumer::from_spec(&s, "tag-1".to_string(), 0))
      .await;

    let outcome = process_delivery(
      &ctx,
      "q1",
      0,
      RawDelivery {
        delivery_tag: 1,
        body: br#"{}"#.to_vec(),
      },
    )
    .await;

    assert_eq!(outcome, PipelineOutcome::NackedTransportError);
  }

  #[tokio::test]
  async fn stale_epoch_is_skipped_before_touching_broker() {
    let (ctx, registry, store, _path) = make_ctx(
      FakeBroker::default(),
      WebhookOutcome::Delivered { status: 200 },
    )
    .await;

    let s = spec("q1", 1, 1, 0, 24);
    store.upsert(&s).unwrap();
    registry
      .insert(RuntimeConsumer::from_spec(&s, "tag-1".to_string(), 0))
      .await;

    ctx.epoch.bump(); // current epoch is now 1, captured epoch below is 0

    let outcome = process_delivery(
      &ctx,
      "q1",
      0,
      RawDelivery {
        delivery_tag: 1,
        body: br#"{}"#.to_vec(),
      },
    )
    .await;

    assert_eq!(outcome, PipelineOutcome::SkippedStaleEpoch);
  }

  #[test]
  fn interval_formula_respects_min_max_bounds() {
    for _ in 0..1000 {
      let draw = draw_interval_ms(100, 200);
      assert!((100..=200).contains(&draw));
    }
  }

  #[test]
  fn interval_formula_is_constant_when_min_equals_max() {
    assert_eq!(draw_interval_ms(500, 500), 500);
  }
}
