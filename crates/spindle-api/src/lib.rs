pub mod handlers;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Fetch-next and report-result on `/`, operator reset on `/reset`.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/",
            get(handlers::handle_fetch_next).post(handlers::handle_report_result),
        )
        .route("/reset", get(handlers::handle_reset))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(state: ApiState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "http dispatch listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
