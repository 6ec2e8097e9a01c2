// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP server for the control plane API.
//!
//! `/health`, `/machines/{id}/health` and `/version` are public. Every other
//! route requires an API key when keys are configured.

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{ApiKeys, require_api_key};
use crate::handlers::{self, SharedState};

/// Build the API router.
pub fn router(state: SharedState, api_keys: ApiKeys) -> Router {
    let public = Router::new()
        .route("/health", get(handlers::handle_all_health))
        .route("/machines/{id}/health", get(handlers::handle_machine_health))
        .route("/version", get(handlers::handle_version));

    let protected = Router::new()
        .route(
            "/machines",
            get(handlers::handle_list_machines).post(handlers::handle_create_machine),
        )
        .route(
            "/machines/{id}",
            get(handlers::handle_get_machine).delete(handlers::handle_delete_machine),
        )
        .route("/machines/{id}/connect", get(handlers::handle_connect))
        .route("/machines/{id}/exec", post(handlers::handle_exec))
        .route("/machines/{id}/logs", get(handlers::handle_logs))
        .route(
            "/machines/{id}/snapshots",
            get(handlers::handle_list_snapshots).post(handlers::handle_create_snapshot),
        )
        .route(
            "/machines/{id}/snapshots/{snapshot_id}",
            axum::routing::delete(handlers::handle_delete_snapshot),
        )
        .route(
            "/machines/{id}/snapshots/{snapshot_id}/restore",
            post(handlers::handle_restore_snapshot),
        )
        .route(
            "/quotas",
            get(handlers::handle_list_quotas).post(handlers::handle_create_quota),
        )
        .route(
            "/quotas/{user_id}",
            get(handlers::handle_get_quota)
                .put(handlers::handle_set_quota)
                .post(handlers::handle_set_quota)
                .delete(handlers::handle_delete_quota),
        )
        .route("/templates", get(handlers::handle_list_templates))
        .route(
            "/templates/{name}",
            get(handlers::handle_get_template)
                .put(handlers::handle_set_template)
                .delete(handlers::handle_delete_template),
        )
        .route_layer(middleware::from_fn_with_state(api_keys, require_api_key));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown_rx` turns true.
///
/// In-flight requests finish before this returns. Tunnels already handed
/// off to background tasks are not waited for.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
            info!("HTTP server received shutdown signal");
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
