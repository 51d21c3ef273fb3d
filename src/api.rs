//! ==============================================================================
//! api.rs - JSON status and override endpoints
//! ==============================================================================
//!
//! routes:
//!     GET  /health                         liveness
//!     GET  /api/status                     latest reading, baseline, decisions
//!     POST /api/override?action=stop|resume|on|clear
//!
//! the polling loop writes the status snapshot; handlers only read it, except
//! for the override endpoint which flips the shared override latches.
//!
//! ==============================================================================

use crate::clock::Clock;
use crate::domain::StatusSnapshot;
use crate::monitor::SharedStatus;
use crate::overrides::OverrideState;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct ApiState {
    pub status: SharedStatus,
    pub overrides: OverrideState,
    pub clock: Arc<dyn Clock>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/override", post(override_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(bind: &str, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("[API] listening on http://{}", bind);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// latest cycle results; the override field reflects the live latches
async fn status_handler(State(state): State<ApiState>) -> Json<StatusSnapshot> {
    let mut snapshot = match state.status.read() {
        Ok(s) => s.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    snapshot.active_override = state.overrides.active(state.clock.now());
    Json(snapshot)
}

#[derive(Deserialize)]
struct OverrideParams {
    action: String,
}

/// POST /api/override?action=stop|resume|on|clear
async fn override_handler(
    State(state): State<ApiState>,
    Query(params): Query<OverrideParams>,
) -> (StatusCode, Json<serde_json::Value>) {
    let now = state.clock.now();
    match params.action.as_str() {
        "stop" => state.overrides.emergency_stop(),
        "resume" => state.overrides.resume(),
        "on" => state.overrides.manual_on(now),
        "clear" => state.overrides.clear_manual(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"status": "error", "message": "unknown action"})),
            )
        }
    }
    let active = state.overrides.active(now).map(|o| o.as_str());
    (
        StatusCode::OK,
        Json(serde_json::json!({"status": "ok", "action": params.action, "active_override": active})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::ControlOverride;

    fn state() -> ApiState {
        ApiState {
            status: SharedStatus::default(),
            overrides: OverrideState::new(600),
            clock: Arc::new(ManualClock::new(1_000)),
        }
    }

    fn action(a: &str) -> Query<OverrideParams> {
        Query(OverrideParams { action: a.to_string() })
    }

    #[tokio::test]
    async fn stop_then_resume() {
        let s = state();
        let (code, Json(body)) = override_handler(State(s.clone()), action("stop")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["active_override"], "emergency_stop");

        let Json(snapshot) = status_handler(State(s.clone())).await;
        assert_eq!(snapshot.active_override, Some(ControlOverride::EmergencyStop));

        let (_, Json(body)) = override_handler(State(s.clone()), action("resume")).await;
        assert!(body["active_override"].is_null());
    }

    #[tokio::test]
    async fn manual_on_is_reported() {
        let s = state();
        override_handler(State(s.clone()), action("on")).await;
        assert_eq!(s.overrides.active(1_599), Some(ControlOverride::ManualOn));
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let (code, Json(body)) = override_handler(State(state()), action("explode")).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn health_is_ok() {
        let Json(body) = health_handler().await;
        assert_eq!(body["status"], "ok");
    }
}
