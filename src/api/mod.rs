pub mod dto;
mod handlers;

use axum::routing::{get, post};
use axum::Router;

use crate::supervisor::SupervisorHandle;

/// Builds the control-plane router (spec §4.G, §6). Handlers are a thin
/// translation layer over `SupervisorHandle`; no auth/compression/CORS
/// layering is added — this is an internal control plane, not a public
/// surface.
pub fn router(state: SupervisorHandle) -> Router {
  Router::new()
    .route("/health", get(handlers::health))
    .route("/consume", post(handlers::consume))
    .route("/active-queues", get(handlers::active_queues))
    .route("/queue-info/:queue", get(handlers::queue_info))
    .route("/queues-info", post(handlers::queues_info))
    .route("/pause", post(handlers::pause))
    .route("/resume", post(handlers::resume))
    .route("/stop", post(handlers::stop))
    .with_state(state)
}
