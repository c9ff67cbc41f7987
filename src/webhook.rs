use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

/// Outcome of a webhook POST, per spec §4.E step 7: any HTTP response at
/// all (success or 4xx/5xx) counts as delivered — the webhook owns semantic
/// validation, the broker is not the retry vehicle for webhook errors.
/// Only the absence of a response (a transport failure) is transient.
pub enum WebhookOutcome {
  Delivered { status: u16 },
  TransportError(String),
}

/// Thin `reqwest::Client` wrapper shared by the Delivery Loop's per-message
/// forward and the finish notification, mirroring the teacher's
/// `OrdApiClient` (`Client::builder().timeout(..)` with a fixed timeout).
#[derive(Clone)]
pub struct WebhookClient {
  client: Client,
}

impl WebhookClient {
  pub fn new() -> Self {
    let client = Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .expect("reqwest client builder with only a timeout cannot fail");
    WebhookClient { client }
  }

  pub async fn post_json(&self, url: &str, body: &Value) -> WebhookOutcome {
    match self.client.post(url).json(body).send().await {
      Ok(response) => WebhookOutcome::Delivered {
        status: response.status().as_u16(),
      },
      Err(err) => WebhookOutcome::TransportError(err.to_string()),
    }
  }
}

impl Default for WebhookClient {
  fn default() -> Self {
    Self::new()
  }
}

/// The subset of `WebhookClient` the Delivery Loop depends on, extracted so
/// tests can inject a fake transport instead of making real HTTP calls.
#[async_trait::async_trait]
pub trait WebhookSender: Send + Sync {
  async fn post_json(&self, url: &str, body: &Value) -> WebhookOutcome;
}

#[async_trait::async_trait]
impl WebhookSender for WebhookClient {
  async fn post_json(&self, url: &str, body: &Value) -> WebhookOutcome {
    WebhookClient::post_json(self, url, body).await
  }
}

/// Fire-and-forget POST to `FINISH_WEBHOOK` on drain or explicit stop
/// (spec §6). Failure is logged but never blocks queue removal.
pub async fn notify_finish(
  sender: &dyn WebhookSender,
  finish_webhook: &str,
  queue: &str,
  last_message: Option<&Value>,
) {
  let body = serde_json::json!({
    "queue": queue,
    "lastMessage": last_message,
  });

  match sender.post_json(finish_webhook, &body).await {
    WebhookOutcome::Delivered { status } if (200..300).contains(&status) => {
      log::info!("finish notification delivered for queue {queue}");
    }
    WebhookOutcome::Delivered { status } => {
      log::warn!("finish notification for queue {queue} returned status {status}");
    }
    WebhookOutcome::TransportError(err) => {
      log::warn!("finish notification for queue {queue} failed: {err}");
    }
  }
}
