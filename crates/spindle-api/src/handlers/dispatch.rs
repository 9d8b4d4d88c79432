//! `/` handlers: fetch-next (GET) and report-result (POST).

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};

use spindle_core::work::{parse_prior_id, END_OF_WORK_MESSAGE};
use spindle_services::{Completion, Dispatch, DispatchError};

use super::{header_or, ApiState};

// ── / (GET) ───────────────────────────────────────────────────────────────────

/// Hand out the next item. `ID` names the caller's previous item; a valid
/// one that is still assigned goes back on the reissue stack first.
pub async fn handle_fetch_next(State(state): State<ApiState>, headers: HeaderMap) -> Json<Value> {
    let worker = header_or(&headers, "computername", "Admin");
    let prior = parse_prior_id(header_or(&headers, "id", "-1"));

    match state.queue.request_item(prior, worker) {
        Dispatch::Item(item) => {
            let mut body = item.parameters;
            body.insert("id".into(), json!(item.id));
            Json(Value::Object(body))
        }
        Dispatch::EndOfWork => Json(json!({ "message": END_OF_WORK_MESSAGE })),
    }
}

// ── / (POST) ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ReportResponse {
    pub id: Option<u64>,
    pub already_completed: bool,
    pub received_bytes: usize,
}

/// Record a finished item, then accept the uploaded result. The completion
/// is recorded even when the body turns out to be empty.
pub async fn handle_report_result(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReportResponse>, (StatusCode, String)> {
    let worker = header_or(&headers, "computername", "Null");
    let raw_id = header_or(&headers, "id", "-1");

    let mut id = None;
    let mut already_completed = false;
    if raw_id != "-1" {
        let parsed = raw_id
            .parse::<u64>()
            .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid ID {raw_id}")))?;
        match state.queue.report_complete(parsed, worker) {
            Ok(Completion::Recorded) => {}
            Ok(Completion::AlreadyCompleted) => already_completed = true,
            Err(e @ DispatchError::UnknownItem(_)) => {
                return Err((StatusCode::NOT_FOUND, e.to_string()))
            }
            Err(e) => return Err((StatusCode::BAD_REQUEST, e.to_string())),
        }
        id = Some(parsed);
    }

    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No content received.".to_string()));
    }

    tracing::info!(id = ?id, worker, bytes = body.len(), "result received");
    Ok(Json(ReportResponse {
        id,
        already_completed,
        received_bytes: body.len(),
    }))
}
