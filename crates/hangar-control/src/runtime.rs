// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hangar-control.
//!
//! [`ControlPlaneRuntime`] wires the gateway, the health supervisor and the
//! HTTP server together and owns their tasks.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hangar_control::gateway::{KubeGateway, KubeGatewayConfig};
//! use hangar_control::runtime::ControlPlaneRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let gateway = KubeGateway::try_default(KubeGatewayConfig {
//!         namespace: "hangar".to_string(),
//!         service_domain: "hangar-machines".to_string(),
//!         storage_class: None,
//!         snapshot_class: None,
//!     })
//!     .await?;
//!
//!     let runtime = ControlPlaneRuntime::builder()
//!         .gateway(Arc::new(gateway))
//!         .bind_addr("0.0.0.0:8080".parse()?)
//!         .api_keys(vec!["secret:alice".to_string()])
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auth::ApiKeys;
use crate::gateway::ClusterGateway;
use crate::handlers::{ControlPlaneState, SharedState};
use crate::health_monitor::{HealthMonitor, HealthMonitorConfig, HealthStore};
use crate::quota::{QuotaEnforcer, QuotaStore, default_quotas};
use crate::recovery::PollBudget;
use crate::server;
use crate::snapshot_manager::SnapshotManager;
use crate::templates::{TemplateCatalog, TemplateStore, default_templates};
use crate::tunnel::{Protocol, Tunnel, TunnelConfig};

/// Builder for creating a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeBuilder {
    gateway: Option<Arc<dyn ClusterGateway>>,
    bind_addr: SocketAddr,
    api_keys: Vec<String>,
    health_interval: Duration,
    recovery_budget: PollBudget,
    tunnel_config: TunnelConfig,
    quotas: Option<QuotaStore>,
    templates: Option<TemplateStore>,
}

impl Default for ControlPlaneRuntimeBuilder {
    fn default() -> Self {
        Self {
            gateway: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_keys: Vec::new(),
            health_interval: Duration::from_secs(30),
            recovery_budget: PollBudget::default(),
            tunnel_config: TunnelConfig::default(),
            quotas: None,
            templates: None,
        }
    }
}

impl ControlPlaneRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cluster gateway (required).
    pub fn gateway(mut self, gateway: Arc<dyn ClusterGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the bind address for the HTTP server. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the `key[:principal]` API key entries. Empty disables
    /// authentication.
    pub fn api_keys(mut self, entries: Vec<String>) -> Self {
        self.api_keys = entries;
        self
    }

    /// Set the health supervisor tick interval.
    ///
    /// Default: 30 seconds
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Set the polling budget for waiting on deletions during recovery and
    /// restore.
    ///
    /// Default: 10 checks, 1 second apart
    pub fn recovery_budget(mut self, budget: PollBudget) -> Self {
        self.recovery_budget = budget;
        self
    }

    /// Set the tunnel upstream connect timeout.
    ///
    /// Default: 60 seconds
    pub fn tunnel_connect_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_config.connect_timeout = timeout;
        self
    }

    /// Use `port` instead of the well-known port for `protocol`.
    pub fn tunnel_port(mut self, protocol: Protocol, port: u16) -> Self {
        self.tunnel_config.port_overrides.insert(protocol, port);
        self
    }

    /// Start with these quotas instead of the built-in default.
    pub fn quotas(mut self, quotas: QuotaStore) -> Self {
        self.quotas = Some(quotas);
        self
    }

    /// Start with these templates instead of the built-in set.
    pub fn templates(mut self, templates: TemplateStore) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlaneRuntimeConfig> {
        let gateway = self
            .gateway
            .ok_or_else(|| anyhow::anyhow!("gateway is required"))?;
        if self.health_interval.is_zero() {
            anyhow::bail!("health_interval must be greater than zero");
        }

        Ok(ControlPlaneRuntimeConfig {
            gateway,
            bind_addr: self.bind_addr,
            api_keys: ApiKeys::from_entries(&self.api_keys),
            health_interval: self.health_interval,
            recovery_budget: self.recovery_budget,
            tunnel_config: self.tunnel_config,
            quotas: self.quotas.unwrap_or_else(default_quotas),
            templates: self.templates.unwrap_or_else(default_templates),
        })
    }
}

/// Configuration for a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeConfig {
    gateway: Arc<dyn ClusterGateway>,
    bind_addr: SocketAddr,
    api_keys: ApiKeys,
    health_interval: Duration,
    recovery_budget: PollBudget,
    tunnel_config: TunnelConfig,
    quotas: QuotaStore,
    templates: TemplateStore,
}

impl ControlPlaneRuntimeConfig {
    /// Assemble the handler state without starting any task.
    pub fn state(&self) -> (SharedState, HealthMonitor) {
        let health = HealthMonitor::new(
            self.gateway.clone(),
            HealthStore::new(),
            HealthMonitorConfig {
                poll_interval: self.health_interval,
                recovery_budget: self.recovery_budget,
            },
        );
        let state = Arc::new(ControlPlaneState::new(
            self.gateway.clone(),
            health.clone(),
            Tunnel::new(self.gateway.clone(), self.tunnel_config.clone()),
            SnapshotManager::new(self.gateway.clone(), health.clone(), self.recovery_budget),
            QuotaEnforcer::new(self.quotas.clone(), self.gateway.clone()),
            TemplateCatalog::new(self.templates.clone()),
        ));
        (state, health)
    }

    /// Configured API keys.
    pub fn api_keys(&self) -> ApiKeys {
        self.api_keys.clone()
    }

    /// Start the runtime, spawning the HTTP server and health monitor tasks.
    pub async fn start(self) -> Result<ControlPlaneRuntime> {
        let (state, health) = self.state();

        // Machines from a previous run are supervised from the first tick
        match self.gateway.list_all().await {
            Ok(workloads) => {
                for workload in &workloads {
                    health.track(&workload.machine_id).await;
                }
                info!(machines = workloads.len(), "Existing machines registered");
            }
            Err(e) => warn!(error = %e, "Failed to list existing machines"),
        }

        let monitor_shutdown = health.shutdown_handle();
        let monitor = health.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor.run().await;
        });

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        if !self.api_keys.is_enabled() {
            warn!("No API keys configured, authentication disabled");
        }
        let router = server::router(state.clone(), self.api_keys);

        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(async move {
            server::serve(listener, router, server_shutdown_rx)
                .await
                .map_err(anyhow::Error::from)
        });

        info!(
            local_addr = %local_addr,
            gateway = state.gateway.gateway_type(),
            namespace = state.gateway.namespace(),
            "ControlPlaneRuntime started"
        );

        Ok(ControlPlaneRuntime {
            server_handle,
            monitor_handle,
            server_shutdown_tx,
            monitor_shutdown,
            state,
            local_addr,
        })
    }
}

/// A running control plane.
///
/// The runtime manages:
/// - the HTTP server for the machine API
/// - the health monitor that supervises and recovers machines
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlaneRuntime {
    server_handle: JoinHandle<Result<()>>,
    monitor_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    monitor_shutdown: Arc<Notify>,
    state: SharedState,
    local_addr: SocketAddr,
}

impl ControlPlaneRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneRuntimeBuilder {
        ControlPlaneRuntimeBuilder::new()
    }

    /// Address the HTTP server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the health monitor, then lets in-flight requests finish before
    /// the server stops.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlPlaneRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.monitor_shutdown.notify_one();

        if let Err(e) = self.monitor_handle.await {
            error!("Health monitor task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("ControlPlaneRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("ControlPlaneRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("ControlPlaneRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.monitor_handle.is_finished()
    }
}
