//! `/reset`: operator-driven reset of one item or an inclusive id range.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use spindle_core::ResetTarget;

use super::{header_or, ApiState};

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub text: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reset: Vec<u64>,
}

/// Header `index` is `N` or `start:end`. Bad targets answer 200 with
/// `Invalid ID` and change nothing.
pub async fn handle_reset(State(state): State<ApiState>, headers: HeaderMap) -> Json<ResetResponse> {
    let raw = header_or(&headers, "index", "");
    let outcome = raw
        .parse::<ResetTarget>()
        .map_err(|e| e.to_string())
        .and_then(|target| state.queue.force_reset(target).map_err(|e| e.to_string()));

    match outcome {
        Ok(reset) => {
            tracing::info!(target = raw, reset = ?reset, "reset from http");
            Json(ResetResponse {
                text: "Reset Success",
                reset,
            })
        }
        Err(error) => {
            tracing::warn!(target = raw, %error, "reset rejected");
            Json(ResetResponse {
                text: "Invalid ID",
                reset: Vec::new(),
            })
        }
    }
}
