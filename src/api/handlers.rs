use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::dto::{
  format_duration_hms, ActiveQueueResponse, ConsumeRequest, ErrorResponse, QueueInfoResponse,
  QueueRef, QueuesInfoEntry, QueuesInfoRequest,
};
use crate::broker::QueueCheck;
use crate::error::ForwarderError;
use crate::supervisor::SupervisorHandle;

fn error_response(err: ForwarderError) -> Response {
  let status = match &err {
    ForwarderError::Validation(_)
    | ForwarderError::AlreadyConsuming(_)
    | ForwarderError::AlreadyPaused(_)
    | ForwarderError::NotPaused(_) => StatusCode::BAD_REQUEST,
    ForwarderError::NotFound(_) => StatusCode::NOT_FOUND,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  };
  (status, Json(ErrorResponse { error: err.to_string() })).into_response()
}

/// `GET /health` (spec §6): 200 only if both the connection and the
/// channel are live.
pub async fn health(State(state): State<SupervisorHandle>) -> StatusCode {
  if state.is_broker_live().await {
    StatusCode::OK
  } else {
    StatusCode::SERVICE_UNAVAILABLE
  }
}

/// `POST /consume` (spec §6).
pub async fn consume(State(state): State<SupervisorHandle>, Json(req): Json<ConsumeRequest>) -> Response {
  let spec = match req.into_spec() {
    Ok(spec) => spec,
    Err(err) => return error_response(err),
  };
  match state.start_consumer(spec).await {
    Ok(()) => StatusCode::OK.into_response(),
    Err(err) => error_response(err),
  }
}

/// `GET /active-queues` (spec §6). `estimatedCompletion` ignores pause and
/// hours gates, as specified: it is a throughput estimate, not a forecast
/// of when gated messages will actually leave the broker.
pub async fn active_queues(State(state): State<SupervisorHandle>) -> Response {
  let snapshot = state.snapshot().await;
  let mut out = Vec::with_capacity(snapshot.len());

  for consumer in snapshot {
    match state.check_queue(&consumer.queue).await {
      Ok(QueueCheck::Found(counts)) => {
        let avg_interval_seconds =
          (consumer.min_interval_ms + consumer.max_interval_ms) as f64 / 2.0 / 1000.0;
        let estimated_seconds = counts.message_count as f64 * avg_interval_seconds;
        out.push(ActiveQueueResponse {
          queue: consumer.queue,
          message_count: counts.message_count,
          avg_interval_seconds,
          estimated_completion: format_duration_hms(estimated_seconds),
          paused: consumer.paused,
        });
      }
      Ok(QueueCheck::NotFound) => {
        log::warn!("active-queues: queue {} no longer exists on the broker", consumer.queue);
      }
      Err(err) => {
        log::warn!("active-queues: check_queue failed for {}: {err}", consumer.queue);
      }
    }
  }

  Json(out).into_response()
}

/// `GET /queue-info/:queue` (spec §6).
pub async fn queue_info(State(state): State<SupervisorHandle>, Path(queue): Path<String>) -> Response {
  match state.check_queue(&queue).await {
    Ok(QueueCheck::Found(counts)) => {
      let is_active = state.is_active(&queue).await;
      Json(QueueInfoResponse {
        message_count: counts.message_count,
        consumer_count: counts.consumer_count,
        is_active,
      })
      .into_response()
    }
    Ok(QueueCheck::NotFound) => (
      StatusCode::NOT_FOUND,
      Json(ErrorResponse {
        error: format!("queue {queue} not found"),
      }),
    )
      .into_response(),
    Err(err) => error_response(err),
  }
}

/// `POST /queues-info` (spec §6): a malformed (non-array `queues`) body is
/// rejected by axum's `Json` extractor before this handler runs, which is
/// where the 400 status for that case comes from.
pub async fn queues_info(
  State(state): State<SupervisorHandle>,
  Json(req): Json<QueuesInfoRequest>,
) -> Response {
  let mut out = Vec::with_capacity(req.queues.len());

  for queue in req.queues {
    match state.check_queue(&queue).await {
      Ok(QueueCheck::Found(counts)) => {
        let is_active = state.is_active(&queue).await;
        out.push(QueuesInfoEntry {
          queue,
          message_count: Some(counts.message_count),
          consumer_count: Some(counts.consumer_count),
          is_active: Some(is_active),
          error: None,
        });
      }
      Ok(QueueCheck::NotFound) => out.push(QueuesInfoEntry {
        queue: queue.clone(),
        message_count: None,
        consumer_count: None,
        is_active: None,
        error: Some(format!("queue {queue} not found")),
      }),
      Err(err) => out.push(QueuesInfoEntry {
        queue: queue.clone(),
        message_count: None,
        consumer_count: None,
        is_active: None,
        error: Some(err.to_string()),
      }),
    }
  }

  Json(out).into_response()
}

/// `POST /pause` (spec §6).
pub async fn pause(State(state): State<SupervisorHandle>, Json(req): Json<QueueRef>) -> Response {
  match state.set_paused(&req.queue, true).await {
    Ok(()) => StatusCode::OK.into_response(),
    Err(err) => error_response(err),
  }
}

/// `POST /resume` (spec §6).
pub async fn resume(State(state): State<SupervisorHandle>, Json(req): Json<QueueRef>) -> Response {
  match state.set_paused(&req.queue, false).await {
    Ok(()) => StatusCode::OK.into_response(),
    Err(err) => error_response(err),
  }
}

/// `POST /stop` (spec §6).
pub async fn stop(State(state): State<SupervisorHandle>, Json(req): Json<QueueRef>) -> Response {
  match state.stop_consumer(&req.queue).await {
    Ok(()) => StatusCode::OK.into_response(),
    Err(err) => error_response(err),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn validation_and_state_conflict_errors_map_to_400() {
    assert_eq!(
      error_response(ForwarderError::Validation("x".into())).status(),
      StatusCode::BAD_REQUEST
    );
    assert_eq!(
      error_response(ForwarderError::AlreadyConsuming("q".into())).status(),
      StatusCode::BAD_REQUEST
    );
    assert_eq!(
      error_response(ForwarderError::AlreadyPaused("q".into())).status(),
      StatusCode::BAD_REQUEST
    );
    assert_eq!(
      error_response(ForwarderError::NotPaused("q".into())).status(),
      StatusCode::BAD_REQUEST
    );
  }

  #[test]
  fn not_found_maps_to_404() {
    assert_eq!(
      error_response(ForwarderError::NotFound("q".into())).status(),
      StatusCode::NOT_FOUND
    );
  }
}
