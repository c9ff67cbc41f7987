use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};

use crate::broker::{generate_consumer_tag, Broker, BrokerLink, LifecycleEvent, QueueCheck};
use crate::config::Config;
use crate::delivery::{process_delivery, DeliveryContext, PipelineOutcome, RawDelivery};
use crate::epoch::EpochManager;
use crate::error::{fatal_exit, ForwarderError};
use crate::registry::{ConsumerRegistry, RuntimeConsumer};
use crate::store::{ConsumerSpec, Store};
use crate::webhook::{self, WebhookSender};

/// State shared between the Supervisor's event loop, its spawned reconnect
/// tasks, and every handle given out to the Control API (spec §4.F, §4.G).
struct SupervisorInner {
  addr: String,
  events_tx: mpsc::UnboundedSender<LifecycleEvent>,
  broker: RwLock<Arc<BrokerLink>>,
  registry: ConsumerRegistry,
  store: Arc<Store>,
  epoch: Arc<EpochManager>,
  webhook: Arc<dyn WebhookSender>,
  finish_webhook: String,
  business_hours_timezone: chrono_tz::Tz,
  max_reconnect_attempts: u32,
  attempts: AtomicU32,
  reconnect_in_flight: AtomicBool,
}

/// Cheap, cloneable handle to the Supervisor's state, handed to the
/// Control API (spec §4.G) and used for every Registry/Store/Broker
/// operation a request triggers.
#[derive(Clone)]
pub struct SupervisorHandle {
  inner: Arc<SupervisorInner>,
}

/// Owns the lifecycle-event receiver; `run()` drains it until the process
/// exits. Only `bootstrap` produces one, and only `main` should call `run`.
pub struct Supervisor {
  inner: Arc<SupervisorInner>,
  events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl Supervisor {
  /// Connects, bumps the epoch for this first fresh channel, and restores
  /// every persisted spec from the Store before returning (spec §4.F steps
  /// 5-7, run once at startup instead of only after a reconnect trigger).
  pub async fn bootstrap(
    config: &Config,
    registry: ConsumerRegistry,
    store: Arc<Store>,
    epoch: Arc<EpochManager>,
    webhook: Arc<dyn WebhookSender>,
  ) -> Result<(SupervisorHandle, Supervisor), ForwarderError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let link = BrokerLink::connect(&config.rabbitmq_url, events_tx.clone()).await?;
    epoch.bump();

    let inner = Arc::new(SupervisorInner {
      addr: config.rabbitmq_url.clone(),
      events_tx,
      broker: RwLock::new(Arc::new(link)),
      registry,
      store,
      epoch,
      webhook,
      finish_webhook: config.finish_webhook.clone(),
      business_hours_timezone: config.business_hours_timezone,
      max_reconnect_attempts: config.max_reconnect_attempts,
      attempts: AtomicU32::new(0),
      reconnect_in_flight: AtomicBool::new(false),
    });

    restore(&inner).await;

    let handle = SupervisorHandle { inner: inner.clone() };
    Ok((handle, Supervisor { inner, events_rx }))
  }

  /// Drains lifecycle events forever. Runs as its own background task;
  /// never returns under normal operation (only by process exit via
  /// `fatal_exit` deep inside a reconnect attempt).
  pub async fn run(mut self) {
    while let Some(event) = self.events_rx.recv().await {
      match &event {
        LifecycleEvent::ConnectionError(err) => {
          log::warn!("connection error: {err}");
        }
        LifecycleEvent::ChannelError(err) => {
          log::warn!("channel error: {err}");
        }
        LifecycleEvent::ConnectionClosed => {
          log::warn!("connection closed, scheduling reconnect");
          if let Some((delay, full)) = decide_reconnect(&event, false) {
            spawn_reconnect(self.inner.clone(), delay, full);
          }
        }
        LifecycleEvent::ChannelClosed => {
          let connection_live = self.inner.broker.read().await.connection_is_live();
          log::warn!("channel closed (connection_live={connection_live}), scheduling reconnect");
          if let Some((delay, full)) = decide_reconnect(&event, connection_live) {
            spawn_reconnect(self.inner.clone(), delay, full);
          }
        }
        LifecycleEvent::ConsumerCancelled(tag) => {
          handle_consumer_cancelled(&self.inner, tag).await;
        }
      }
    }
    log::error!("lifecycle event channel closed unexpectedly, no sender remains");
  }
}

impl SupervisorHandle {
  pub async fn is_broker_live(&self) -> bool {
    self.inner.broker.read().await.is_live()
  }

  pub async fn check_queue(&self, queue: &str) -> Result<QueueCheck, ForwarderError> {
    let broker = self.inner.broker.read().await.clone();
    broker.check_queue(queue).await
  }

  pub async fn is_active(&self, queue: &str) -> bool {
    self.inner.registry.get(queue).await.is_some()
  }

  pub async fn snapshot(&self) -> Vec<RuntimeConsumer> {
    self.inner.registry.snapshot().await
  }

  /// `POST /consume` (spec §6): validates existence on the broker, persists
  /// the spec, subscribes, and spawns the per-queue delivery task.
  pub async fn start_consumer(&self, spec: ConsumerSpec) -> Result<(), ForwarderError> {
    if self.inner.registry.get(&spec.queue).await.is_some() {
      return Err(ForwarderError::AlreadyConsuming(spec.queue.clone()));
    }

    let broker = self.inner.broker.read().await.clone();
    match broker.check_queue(&spec.queue).await? {
      QueueCheck::NotFound => {
        return Err(ForwarderError::Validation(format!(
          "queue {} does not exist on the broker",
          spec.queue
        )))
      }
      QueueCheck::Found(_) => {}
    }

    self.inner.store.upsert(&spec)?;

    let consumer_tag = generate_consumer_tag(&spec.queue);
    let lapin_consumer = broker.subscribe(&spec.queue, &consumer_tag).await?;
    let epoch = self.inner.epoch.current();

    self
      .inner
      .registry
      .insert(RuntimeConsumer::from_spec(&spec, consumer_tag.clone(), epoch))
      .await;
    spawn_delivery_task(self.inner.clone(), spec.queue.clone(), epoch, consumer_tag, lapin_consumer);
    Ok(())
  }

  /// `POST /stop` (spec §6): cancel, notify finish, remove from both
  /// Registry and Store.
  pub async fn stop_consumer(&self, queue: &str) -> Result<(), ForwarderError> {
    let consumer = self
      .inner
      .registry
      .get(queue)
      .await
      .ok_or_else(|| ForwarderError::NotFound(queue.to_string()))?;

    let broker = self.inner.broker.read().await.clone();
    if let Err(err) = broker.cancel(&consumer.broker_tag).await {
      log::warn!("cancel failed during explicit stop for {queue}: {err}");
    }

    webhook::notify_finish(
      self.inner.webhook.as_ref(),
      &self.inner.finish_webhook,
      queue,
      consumer.last_message.as_ref(),
    )
    .await;

    self.inner.registry.remove(queue).await;
    self.inner.store.delete(queue)?;
    consumer.wake.notify_waiters();
    Ok(())
  }

  /// `POST /pause` and `POST /resume` (spec §6). Store is updated before
  /// the Registry (invariant 5): a crash between the two still leaves the
  /// persisted value as the one the caller was told succeeded.
  pub async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), ForwarderError> {
    let existing = self
      .inner
      .store
      .get(queue)?
      .ok_or_else(|| ForwarderError::NotFound(queue.to_string()))?;

    if existing.paused == paused {
      return Err(if paused {
        ForwarderError::AlreadyPaused(queue.to_string())
      } else {
        ForwarderError::NotPaused(queue.to_string())
      });
    }

    self.inner.store.set_paused(queue, paused)?;
    if !self.inner.registry.set_paused(queue, paused).await {
      return Err(ForwarderError::NotFound(queue.to_string()));
    }
    Ok(())
  }

  /// Closes the current channel and connection best-effort, for graceful
  /// shutdown (spec §5).
  pub async fn shutdown(&self) {
    let broker = self.inner.broker.read().await.clone();
    broker.close().await;
  }
}

/// Decides whether a lifecycle event should trigger a reconnect and, if so,
/// with what delay and full-vs-channel-only mode (spec §4.F trigger
/// table). Split out from `Supervisor::run` so the trigger table itself is
/// unit-testable without a live connection.
fn decide_reconnect(event: &LifecycleEvent, connection_live: bool) -> Option<(Duration, bool)> {
  match event {
    LifecycleEvent::ConnectionClosed => Some((Duration::from_secs(5), true)),
    LifecycleEvent::ChannelClosed if connection_live => Some((Duration::from_secs(2), false)),
    LifecycleEvent::ChannelClosed => Some((Duration::from_secs(5), true)),
    LifecycleEvent::ConsumerCancelled(_)
    | LifecycleEvent::ConnectionError(_)
    | LifecycleEvent::ChannelError(_) => None,
  }
}

fn spawn_reconnect(inner: Arc<SupervisorInner>, delay: Duration, full: bool) {
  tokio::spawn(async move {
    reconnect(inner, delay, full).await;
  });
}

/// Reconnect procedure (spec §4.F steps 1-8). Runs as its own task so the
/// Supervisor's event loop keeps draining `ConsumerCancelled` events while
/// a slow reconnect is in flight; `reconnect_in_flight` guards against two
/// reconnects racing on overlapping triggers.
async fn reconnect(inner: Arc<SupervisorInner>, mut delay: Duration, mut full: bool) {
  if inner.reconnect_in_flight.swap(true, Ordering::SeqCst) {
    return;
  }

  loop {
    let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt >= inner.max_reconnect_attempts {
      fatal_exit(
        "reconnect attempts exhausted",
        format!("giving up after {attempt} attempts (MAX_RECONNECT_ATTEMPTS={})", inner.max_reconnect_attempts),
      );
    }

    tokio::time::sleep(delay).await;

    let old_connection = inner.broker.read().await.connection_handle();
    let result = if full {
      inner.broker.read().await.close().await;
      BrokerLink::connect(&inner.addr, inner.events_tx.clone()).await
    } else {
      BrokerLink::recreate_channel(old_connection, inner.events_tx.clone()).await
    };

    match result {
      Ok(new_link) => {
        *inner.broker.write().await = Arc::new(new_link);
        inner.epoch.bump();
        wake_stale_consumers(&inner).await;
        restore(&inner).await;
        break;
      }
      Err(err) => {
        log::warn!("reconnect attempt {attempt} failed: {err}");
        // A failed channel-only recreation escalates to a full reconnect
        // on the next attempt (spec §4.F "Why this design").
        if !full {
          full = true;
          delay = Duration::from_secs(5);
        }
      }
    }
  }

  inner.attempts.store(0, Ordering::SeqCst);
  inner.reconnect_in_flight.store(false, Ordering::SeqCst);
}

/// `ConsumerCancelled` trigger (spec §4.F): a broker-initiated cancel is
/// not a reconnect condition, it is a teardown for that one queue.
async fn handle_consumer_cancelled(inner: &Arc<SupervisorInner>, tag: &str) {
  let consumer = inner.registry.snapshot().await.into_iter().find(|c| c.broker_tag == tag);
  let Some(consumer) = consumer else {
    log::warn!("consumer-cancelled event for unknown tag {tag}");
    return;
  };

  webhook::notify_finish(
    inner.webhook.as_ref(),
    &inner.finish_webhook,
    &consumer.queue,
    consumer.last_message.as_ref(),
  )
  .await;

  inner.registry.remove(&consumer.queue).await;
  if let Err(err) = inner.store.delete(&consumer.queue) {
    fatal_exit(&format!("store delete for cancelled queue {}", consumer.queue), err);
  }
}

/// Wakes every delivery task sleeping through its inter-message delay right
/// after an epoch bump, so a stale task re-checks the epoch gate promptly
/// instead of sleeping out a long interval first (spec §4.E, "interruptible
/// by epoch change at implementer's discretion"). Must run before
/// `restore`'s `registry.clear()`, which would otherwise drop these
/// `RuntimeConsumer`s (and their `wake` handles) before they are notified.
async fn wake_stale_consumers(inner: &Arc<SupervisorInner>) {
  for consumer in inner.registry.snapshot().await {
    consumer.wake.notify_waiters();
  }
}

/// Post-reconnect restoration (spec §4.F steps 6-7): clear the Registry,
/// replay the Store, and apply `paused` before any delivery can be
/// observed for queues still present on the broker.
async fn restore(inner: &Arc<SupervisorInner>) {
  inner.registry.clear().await;

  let specs = match inner.store.load_all() {
    Ok(specs) => specs,
    Err(err) => fatal_exit("store load_all during restoration", err),
  };

  let epoch = inner.epoch.current();
  let broker = inner.broker.read().await.clone();

  for spec in specs {
    match broker.check_queue(&spec.queue).await {
      Ok(QueueCheck::NotFound) => {
        log::info!("queue {} no longer exists on the broker, purging", spec.queue);
        if let Err(err) = inner.store.delete(&spec.queue) {
          fatal_exit(&format!("store delete for vanished queue {}", spec.queue), err);
        }
        continue;
      }
      Ok(QueueCheck::Found(_)) => {}
      Err(err) => {
        log::error!("check_queue failed for {} during restoration: {err}", spec.queue);
        continue;
      }
    }

    let consumer_tag = generate_consumer_tag(&spec.queue);
    let lapin_consumer = match broker.subscribe(&spec.queue, &consumer_tag).await {
      Ok(consumer) => consumer,
      Err(err) => {
        log::error!("subscribe failed for {} during restoration: {err}", spec.queue);
        continue;
      }
    };

    let runtime = RuntimeConsumer::from_spec(&spec, consumer_tag.clone(), epoch);
    inner.registry.insert(runtime).await;
    spawn_delivery_task(inner.clone(), spec.queue.clone(), epoch, consumer_tag, lapin_consumer);
  }
}

/// Drives one queue's `lapin::Consumer` stream, running every delivery
/// through the pipeline in `delivery.rs`. A terminal pipeline outcome
/// (drained, queue gone, consumer vanished, stale epoch) has already done
/// its own cleanup, so the task just returns. If the stream instead ends on
/// its own (`None`) or errors out, that is a broker-initiated cancel (spec
/// §4.B: "nil delivery indicates broker-initiated cancel") that nothing
/// upstream observed, so the task raises `ConsumerCancelled` itself to
/// drive the same finish-notify/Registry/Store teardown spec §4.F
/// specifies for that trigger — unless this task's epoch is already stale,
/// in which case `restore` has superseded it and there is nothing to tear
/// down here.
fn spawn_delivery_task(
  inner: Arc<SupervisorInner>,
  queue: String,
  captured_epoch: u64,
  broker_tag: String,
  mut consumer: lapin::Consumer,
) {
  tokio::spawn(async move {
    loop {
      let delivery_result = match consumer.next().await {
        Some(result) => result,
        None => break,
      };

      let delivery = match delivery_result {
        Ok(delivery) => delivery,
        Err(err) => {
          log::warn!("queue {queue}: consumer stream error: {err}");
          break;
        }
      };

      let ctx = delivery_context(&inner).await;
      let raw = RawDelivery {
        delivery_tag: delivery.delivery_tag,
        body: delivery.data.clone(),
      };
      let outcome = process_delivery(&ctx, &queue, captured_epoch, raw).await;
      match outcome {
        PipelineOutcome::Drained
        | PipelineOutcome::QueueGone
        | PipelineOutcome::ConsumerVanished
        | PipelineOutcome::SkippedStaleEpoch => return,
        _ => {}
      }
    }

    if inner.epoch.current() == captured_epoch {
      log::warn!("queue {queue}: consumer stream ended, treating as broker-initiated cancel");
      let _ = inner.events_tx.send(LifecycleEvent::ConsumerCancelled(broker_tag));
    }
  });
}

async fn delivery_context(inner: &Arc<SupervisorInner>) -> DeliveryContext {
  let broker: Arc<dyn Broker> = inner.broker.read().await.clone();
  DeliveryContext {
    broker,
    registry: inner.registry.clone(),
    store: inner.store.clone(),
    epoch: inner.epoch.clone(),
    webhook: inner.webhook.clone(),
    finish_webhook: inner.finish_webhook.clone(),
    business_hours_timezone: inner.business_hours_timezone,
  }
}
