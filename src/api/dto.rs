use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ForwarderError;
use crate::store::ConsumerSpec;

fn default_min_interval() -> u64 {
  30_000
}

fn default_max_interval() -> u64 {
  110_000
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessHoursRequest {
  pub start: u8,
  pub end: u8,
}

impl Default for BusinessHoursRequest {
  fn default() -> Self {
    BusinessHoursRequest { start: 8, end: 21 }
  }
}

/// `POST /consume` body (spec §6). Defaults match the table exactly:
/// `minInterval=30000`, `maxInterval=110000`, `businessHours={start:8,end:21}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
  pub queue: String,
  pub webhook: String,
  #[serde(default = "default_min_interval")]
  pub min_interval: u64,
  #[serde(default = "default_max_interval")]
  pub max_interval: u64,
  #[serde(default)]
  pub business_hours: Option<BusinessHoursRequest>,
}

impl ConsumeRequest {
  /// Runs the validation rules from spec §6 ("reused everywhere") and
  /// produces a durable spec ready for `Store::upsert`.
  pub fn into_spec(self) -> Result<ConsumerSpec, ForwarderError> {
    let queue = validate_queue(&self.queue)?;
    validate_webhook(&self.webhook)?;
    validate_interval(self.min_interval, self.max_interval)?;
    let hours = self.business_hours.unwrap_or_default();
    validate_hours(hours.start, hours.end)?;

    let now = Utc::now();
    Ok(ConsumerSpec {
      queue,
      webhook: self.webhook,
      min_interval_ms: self.min_interval,
      max_interval_ms: self.max_interval,
      business_hours_start: hours.start,
      business_hours_end: hours.end,
      paused: false,
      created_at: now,
      updated_at: now,
    })
  }
}

/// `queue` must be a non-empty string once trimmed; returns the trimmed
/// value so callers don't persist leading/trailing whitespace.
pub fn validate_queue(queue: &str) -> Result<String, ForwarderError> {
  let trimmed = queue.trim();
  if trimmed.is_empty() {
    return Err(ForwarderError::Validation("queue must not be empty".to_string()));
  }
  Ok(trimmed.to_string())
}

pub fn validate_webhook(webhook: &str) -> Result<(), ForwarderError> {
  if !webhook.starts_with("http") {
    return Err(ForwarderError::Validation("webhook must start with http".to_string()));
  }
  Ok(())
}

pub fn validate_interval(min: u64, max: u64) -> Result<(), ForwarderError> {
  if min > max {
    return Err(ForwarderError::Validation(
      "minInterval must be less than or equal to maxInterval".to_string(),
    ));
  }
  Ok(())
}

pub fn validate_hours(start: u8, end: u8) -> Result<(), ForwarderError> {
  if start > 24 || end > 24 {
    return Err(ForwarderError::Validation(
      "businessHours.start and businessHours.end must be in [0,24]".to_string(),
    ));
  }
  if start > end {
    return Err(ForwarderError::Validation(
      "businessHours.start must be less than or equal to businessHours.end".to_string(),
    ));
  }
  Ok(())
}

#[derive(Debug, Deserialize)]
pub struct QueueRef {
  pub queue: String,
}

#[derive(Debug, Deserialize)]
pub struct QueuesInfoRequest {
  pub queues: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveQueueResponse {
  pub queue: String,
  pub message_count: u32,
  pub avg_interval_seconds: f64,
  pub estimated_completion: String,
  pub paused: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfoResponse {
  pub message_count: u32,
  pub consumer_count: u32,
  pub is_active: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuesInfoEntry {
  pub queue: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message_count: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub consumer_count: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_active: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub error: String,
}

/// Formats a count of seconds as `"Hh Mm Ss"`, the `/active-queues` estimate
/// format from spec §6.
pub fn format_duration_hms(total_seconds: f64) -> String {
  let total = total_seconds.max(0.0).round() as u64;
  let hours = total / 3600;
  let minutes = (total % 3600) / 60;
  let seconds = total % 60;
  format!("{hours}h {minutes}m {seconds}s")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn queue_must_be_non_empty_after_trim() {
    assert!(validate_queue("   ").is_err());
    assert_eq!(validate_queue("  q1  ").unwrap(), "q1");
  }

  #[test]
  fn webhook_must_start_with_http() {
    assert!(validate_webhook("ftp://example.com").is_err());
    assert!(validate_webhook("https://example.com").is_ok());
  }

  #[test]
  fn interval_min_must_not_exceed_max() {
    assert!(validate_interval(100, 50).is_err());
    assert!(validate_interval(50, 50).is_ok());
  }

  #[test]
  fn hours_must_be_in_range_and_ordered() {
    assert!(validate_hours(25, 26).is_err());
    assert!(validate_hours(10, 5).is_err());
    assert!(validate_hours(8, 8).is_ok());
    assert!(validate_hours(0, 24).is_ok());
  }

  #[test]
  fn duration_formats_as_hms() {
    assert_eq!(format_duration_hms(3661.0), "1h 1m 1s");
    assert_eq!(format_duration_hms(0.0), "0h 0m 0s");
  }
}
