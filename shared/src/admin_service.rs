use axum::Router;
use axum::routing::get;
use http::StatusCode;
use std::sync::Arc;

/// Liveness and readiness endpoints served on the admin listener.
///
/// `/health` always answers `ok`; `/ready` answers `ok` once `is_ready` returns true
/// and 503 before that.
pub fn admin_router<F>(is_ready: F) -> Router
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let is_ready = Arc::new(is_ready);

    Router::new()
        .route("/health", get(|| async { (StatusCode::OK, "ok\n") }))
        .route(
            "/ready",
            get(move || {
                let is_ready = is_ready.clone();
                async move {
                    if is_ready() {
                        (StatusCode::OK, "ok\n")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
                    }
                }
            }),
        )
}
