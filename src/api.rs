//! Notification gateway.
//!
//! Thin axum shim over the notify handler plus a health probe. All
//! validation and persistence lives in `notify`; the router only decodes
//! JSON and reports store liveness.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::notify::{NotifyHandler, TransactionNotifyRequest, TransactionNotifyResponse};
use crate::shutdown::Shutdown;
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub notify: Arc<NotifyHandler>,
    pub store: Arc<Store>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/notify", post(transaction_notify))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until the shutdown broadcast fires.
pub async fn serve(state: AppState, port: u16, mut shutdown: Shutdown) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "notification gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
}

async fn transaction_notify(
    State(state): State<AppState>,
    Json(request): Json<TransactionNotifyRequest>,
) -> Json<TransactionNotifyResponse> {
    Json(state.notify.handle(&request))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.ping() {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable", "error": e.to_string()})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_builds() {
        let store = Arc::new(Store::in_memory().unwrap());
        let state = AppState {
            notify: Arc::new(NotifyHandler::new(store.clone(), "bc1qlisten".to_string())),
            store,
        };
        let _router = router(state);
    }
}
