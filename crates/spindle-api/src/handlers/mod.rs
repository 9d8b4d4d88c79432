//! HTTP dispatch handlers. Thin wrappers over the dispatch queue, keyed by
//! request headers the way existing HTTP workers already talk.

pub mod admin;
pub mod dispatch;

use std::sync::Arc;

use axum::http::HeaderMap;

use spindle_services::DispatchQueue;

#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<DispatchQueue>,
}

impl ApiState {
    pub fn new(queue: Arc<DispatchQueue>) -> Self {
        Self { queue }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Header value as text, or `default` when absent or not valid UTF-8.
fn header_or<'a>(headers: &'a HeaderMap, name: &str, default: &'a str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or(default)
}

pub use admin::handle_reset;
pub use dispatch::{handle_fetch_next, handle_report_result};
