// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Control - Machine Control Plane Server
//!
//! An HTTP server responsible for:
//! - Machine lifecycle (create, list, get, delete) from templates
//! - Health supervision with bounded automatic recovery
//! - Protocol tunnels (VNC, RTMP, CDP) into machines
//! - Data volume snapshots and restores
//! - Per-principal quotas

use std::sync::Arc;
use tracing::{info, warn};

use hangar_control::config::Config;
use hangar_control::gateway::{ClusterGateway, KubeGateway, KubeGatewayConfig};
use hangar_control::runtime::ControlPlaneRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hangar_control=info,tower_http=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        namespace = %config.namespace,
        auth_enabled = !config.api_keys.is_empty(),
        "Starting Hangar Control"
    );

    let gateway = KubeGateway::try_default(KubeGatewayConfig {
        namespace: config.namespace.clone(),
        service_domain: config.service_domain.clone(),
        storage_class: config.storage_class.clone(),
        snapshot_class: config.snapshot_class.clone(),
    })
    .await?;
    info!(gateway = gateway.gateway_type(), "Cluster gateway initialized");

    // Start the runtime
    let runtime = ControlPlaneRuntime::builder()
        .gateway(Arc::new(gateway))
        .bind_addr(config.http_addr)
        .api_keys(config.api_keys)
        .health_interval(config.health_interval)
        .tunnel_connect_timeout(config.tunnel_connect_timeout)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Hangar Control ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Hangar Control shut down");

    Ok(())
}
