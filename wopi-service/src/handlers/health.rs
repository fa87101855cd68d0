use crate::services::metrics::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "wopi-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready once the token store answers and the storage root is usable.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let token_store = state.kv.health_check().await;
    let storage = state.storage.health_check().await;

    if let Err(e) = &token_store {
        tracing::warn!(error = %e, "Readiness check: token store unavailable");
    }
    if let Err(e) = &storage {
        tracing::warn!(error = %e, "Readiness check: storage unavailable");
    }

    let status_of = |ok: bool| if ok { "ok" } else { "unavailable" };
    let ready = token_store.is_ok() && storage.is_ok();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": {
                "token_store": status_of(token_store.is_ok()),
                "storage": status_of(storage.is_ok()),
            }
        })),
    )
}

pub async fn metrics() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        get_metrics(),
    )
}
