//! Global liveness report.

use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::registry::StatusReport;

/// `GET /status`: per-server liveness and the process uptime.
pub(crate) async fn handle_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.registry.status())
}
