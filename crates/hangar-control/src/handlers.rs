// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers for the control plane API.
//!
//! Handlers are thin: they extract, delegate to the owning component and
//! shape the response. Errors render through [`Error`]'s `IntoResponse`.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Extension, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{StreamExt, TryStreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::gateway::{
    ClusterGateway, ExecOutput, GatewayError, LogOptions, SnapshotRecord, VolumeClaimSpec,
    WorkloadSpec,
};
use crate::health_monitor::{HealthMonitor, HealthRecord};
use crate::machine::{MachineRequest, MachineView, data_claim_name, owner_label, validate_machine_id};
use crate::quota::{Quota, QuotaEnforcer};
use crate::snapshot_manager::SnapshotManager;
use crate::templates::{Template, TemplateCatalog};
use crate::tunnel::{Protocol, Tunnel, bridge};

/// Shared state for control plane handlers.
pub struct ControlPlaneState {
    /// Cluster access.
    pub gateway: Arc<dyn ClusterGateway>,
    /// Health supervisor.
    pub health: HealthMonitor,
    /// Tunnel connector.
    pub tunnel: Tunnel,
    /// Snapshot operations.
    pub snapshots: SnapshotManager,
    /// Quota lookup and admission.
    pub quotas: QuotaEnforcer,
    /// Template catalog.
    pub templates: TemplateCatalog,
    /// When the server started (for uptime calculation).
    pub start_time: Instant,
    /// Server version string.
    pub version: String,
}

impl ControlPlaneState {
    /// Assemble handler state from its components.
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        health: HealthMonitor,
        tunnel: Tunnel,
        snapshots: SnapshotManager,
        quotas: QuotaEnforcer,
        templates: TemplateCatalog,
    ) -> Self {
        Self {
            gateway,
            health,
            tunnel,
            snapshots,
            quotas,
            templates,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Handler state as shared by the router.
pub type SharedState = Arc<ControlPlaneState>;

/// Response for delete operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedResponse {
    /// Identifier of the removed resource.
    pub deleted: String,
}

impl DeletedResponse {
    fn of(id: impl Into<String>) -> Json<Self> {
        Json(Self { deleted: id.into() })
    }
}

// ============================================================================
// Machines
// ============================================================================

/// Handle machine creation.
///
/// Order matters: template merge, conflict check, quota admission, quota
/// defaults, data claim, workload.
pub async fn handle_create_machine(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<MachineRequest>,
) -> Result<(StatusCode, Json<MachineView>)> {
    validate_machine_id(&request.id)?;
    let blueprint = state.templates.resolve(&request).await?;

    if state.gateway.find(&request.id).await?.is_some() {
        return Err(Error::MachineExists(request.id));
    }

    state.quotas.admit(principal.as_str()).await?;
    let mut resources = blueprint.resources;
    state.quotas.apply(principal.as_str(), &mut resources).await;

    let volume_claim = match resources.disk.as_deref() {
        Some(size) => {
            let name = data_claim_name(&request.id);
            if state.gateway.find_volume_claim(&name).await?.is_none() {
                state
                    .gateway
                    .create_volume_claim(&VolumeClaimSpec {
                        name: name.clone(),
                        machine_id: request.id.clone(),
                        size: size.to_string(),
                        source_snapshot: None,
                    })
                    .await?;
                debug!(machine_id = %request.id, claim = %name, size = %size, "Data claim created");
            }
            Some(name)
        }
        None => None,
    };

    let spec = WorkloadSpec {
        machine_id: request.id.clone(),
        owner: owner_label(principal.as_str()),
        image: blueprint.image,
        env: blueprint.env,
        tools: blueprint.tools,
        resources,
        volume_claim,
    };

    let workload = match state.gateway.create(&spec).await {
        Ok(workload) => workload,
        Err(GatewayError::AlreadyExists(_)) => return Err(Error::MachineExists(request.id)),
        Err(e) => return Err(e.into()),
    };
    state.health.track(&request.id).await;

    info!(
        machine_id = %request.id,
        owner = %spec.owner,
        image = %spec.image,
        "Machine created"
    );
    Ok((StatusCode::CREATED, Json(MachineView::from(workload))))
}

/// Handle machine listing.
pub async fn handle_list_machines(
    State(state): State<SharedState>,
) -> Result<Json<Vec<MachineView>>> {
    let mut machines: Vec<MachineView> = state
        .gateway
        .list_all()
        .await?
        .into_iter()
        .map(MachineView::from)
        .collect();
    machines.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(machines))
}

/// Handle fetching one machine.
pub async fn handle_get_machine(
    State(state): State<SharedState>,
    Path(machine_id): Path<String>,
) -> Result<Json<MachineView>> {
    let workload = state
        .gateway
        .find(&machine_id)
        .await?
        .ok_or_else(|| Error::MachineNotFound(machine_id.clone()))?;
    Ok(Json(MachineView::from(workload)))
}

/// Handle machine deletion.
///
/// The data claim is removed best-effort; a failure there is logged and
/// does not fail the request.
pub async fn handle_delete_machine(
    State(state): State<SharedState>,
    Path(machine_id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    let guard = state.health.lock_machine(&machine_id).await;

    if !state.gateway.delete(&machine_id).await? {
        return Err(Error::MachineNotFound(machine_id));
    }

    let claim = data_claim_name(&machine_id);
    match state.gateway.delete_volume_claim(&claim).await {
        Ok(true) => debug!(machine_id = %machine_id, claim = %claim, "Data claim deleted"),
        Ok(false) => {}
        Err(e) => warn!(machine_id = %machine_id, claim = %claim, error = %e, "Failed to delete data claim"),
    }

    state.health.forget(&machine_id).await;
    drop(guard);

    info!(machine_id = %machine_id, "Machine deleted");
    Ok(DeletedResponse::of(machine_id))
}

// ============================================================================
// Tunnel
// ============================================================================

/// Query parameters for tunnel connections.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// One of `vnc`, `rtmp`, `cdp`.
    pub protocol: Option<String>,
}

/// Handle a tunnel connection.
///
/// The protocol is validated before any upstream connection is attempted.
/// Once the upstream is open the client transport is taken over with a
/// `101 Switching Protocols` response and bridged in a background task.
pub async fn handle_connect(
    State(state): State<SharedState>,
    Path(machine_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    mut request: Request,
) -> Result<Response> {
    let protocol: Protocol = query
        .protocol
        .as_deref()
        .ok_or_else(|| Error::InvalidRequest("protocol is required".to_string()))?
        .parse()?;

    let upstream = state.tunnel.connect(&machine_id, protocol).await?;

    let Some(on_upgrade) = request.extensions_mut().remove::<OnUpgrade>() else {
        return Err(Error::Hijack(
            "client connection cannot be taken over".to_string(),
        ));
    };

    info!(machine_id = %machine_id, protocol = %protocol, "Tunnel opened");
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let summary = bridge(TokioIo::new(upgraded), upstream).await;
                debug!(
                    machine_id = %machine_id,
                    protocol = %protocol,
                    closed_by = ?summary.closed_by,
                    "Tunnel finished"
                );
            }
            Err(e) => {
                warn!(machine_id = %machine_id, protocol = %protocol, error = %e, "Client upgrade failed");
            }
        }
    });

    Ok(protocol.switching_response())
}

// ============================================================================
// Exec and logs
// ============================================================================

/// Body of an exec request.
#[derive(Debug, Default, Deserialize)]
pub struct ExecRequest {
    /// Command and arguments.
    #[serde(default)]
    pub command: Vec<String>,
}

/// Handle a command execution inside a machine.
///
/// Failures of the command itself are reported in the `error` field of a
/// 200 response.
pub async fn handle_exec(
    State(state): State<SharedState>,
    Path(machine_id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecOutput>> {
    if request.command.is_empty() {
        return Err(Error::InvalidRequest("command is required".to_string()));
    }
    if state.gateway.find(&machine_id).await?.is_none() {
        return Err(Error::MachineNotFound(machine_id));
    }

    debug!(machine_id = %machine_id, command = ?request.command, "Executing command");
    let output = match state.gateway.exec(&machine_id, &request.command).await {
        Ok(output) => output,
        Err(e) => {
            warn!(machine_id = %machine_id, error = %e, "Command execution failed");
            ExecOutput {
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };
    Ok(Json(output))
}

/// Query parameters for log retrieval.
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// Container to read; the machine container when unset.
    pub container: Option<String>,
    /// Number of trailing lines.
    pub tail: Option<i64>,
    /// Stream new lines as server-sent events.
    #[serde(default)]
    pub follow: bool,
}

/// Handle log retrieval.
///
/// Without `follow` the lines are returned as plain text. With `follow`
/// every line is a server-sent event until the machine's log ends.
pub async fn handle_logs(
    State(state): State<SharedState>,
    Path(machine_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Response> {
    if state.gateway.find(&machine_id).await?.is_none() {
        return Err(Error::MachineNotFound(machine_id));
    }

    let options = LogOptions {
        container: query.container,
        tail: query.tail,
        follow: query.follow,
    };
    let lines = state.gateway.logs(&machine_id, &options).await?;

    if options.follow {
        let events = lines.map(|line| line.map(|line| Event::default().data(line)));
        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let lines: Vec<String> = lines.try_collect().await?;
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

// ============================================================================
// Health
// ============================================================================

/// Handle the health record of one machine.
pub async fn handle_machine_health(
    State(state): State<SharedState>,
    Path(machine_id): Path<String>,
) -> Result<Json<HealthRecord>> {
    Ok(Json(state.health.status(&machine_id).await?))
}

/// Handle the health records of every tracked machine.
pub async fn handle_all_health(State(state): State<SharedState>) -> Json<Vec<HealthRecord>> {
    Json(state.health.all().await)
}

// ============================================================================
// Snapshots
// ============================================================================

/// Body of a snapshot creation request.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// Response of a restore.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    /// Snapshot the volume was restored from.
    pub snapshot_id: String,
    /// The recreated machine.
    pub machine: MachineView,
}

/// Handle snapshot creation.
pub async fn handle_create_snapshot(
    State(state): State<SharedState>,
    Path(machine_id): Path<String>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Result<(StatusCode, Json<SnapshotRecord>)> {
    let snapshot = state
        .snapshots
        .create(&machine_id, &request.description)
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// Handle snapshot listing for a machine.
pub async fn handle_list_snapshots(
    State(state): State<SharedState>,
    Path(machine_id): Path<String>,
) -> Result<Json<Vec<SnapshotRecord>>> {
    Ok(Json(state.snapshots.list(&machine_id).await?))
}

/// Handle a restore from snapshot.
pub async fn handle_restore_snapshot(
    State(state): State<SharedState>,
    Path((machine_id, snapshot_id)): Path<(String, String)>,
) -> Result<Json<RestoreResponse>> {
    let workload = state.snapshots.restore(&machine_id, &snapshot_id).await?;
    Ok(Json(RestoreResponse {
        snapshot_id,
        machine: MachineView::from(workload),
    }))
}

/// Handle snapshot deletion.
pub async fn handle_delete_snapshot(
    State(state): State<SharedState>,
    Path((machine_id, snapshot_id)): Path<(String, String)>,
) -> Result<Json<DeletedResponse>> {
    state.snapshots.delete(&machine_id, &snapshot_id).await?;
    Ok(DeletedResponse::of(snapshot_id))
}

// ============================================================================
// Quotas
// ============================================================================

/// Handle quota listing.
pub async fn handle_list_quotas(State(state): State<SharedState>) -> Json<Vec<Quota>> {
    Json(state.quotas.list().await)
}

/// Handle fetching the quota in effect for a principal.
///
/// Principals without their own quota get the `default` quota.
pub async fn handle_get_quota(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Json<Quota> {
    Json(state.quotas.quota_for(&user_id).await)
}

/// Handle quota creation from a body carrying `userId`.
pub async fn handle_create_quota(
    State(state): State<SharedState>,
    Json(quota): Json<Quota>,
) -> Result<(StatusCode, Json<Quota>)> {
    let quota = state.quotas.set(quota).await?;
    Ok((StatusCode::CREATED, Json(quota)))
}

/// Handle setting the quota of the principal named in the path.
pub async fn handle_set_quota(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Json(mut quota): Json<Quota>,
) -> Result<Json<Quota>> {
    quota.user_id = user_id;
    Ok(Json(state.quotas.set(quota).await?))
}

/// Handle quota deletion.
pub async fn handle_delete_quota(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    if !state.quotas.delete(&user_id).await? {
        return Err(Error::NotFound(format!("quota for '{}'", user_id)));
    }
    Ok(DeletedResponse::of(user_id))
}

// ============================================================================
// Templates
// ============================================================================

fn template_lookup(err: Error) -> Error {
    match err {
        Error::TemplateNotFound(name) => Error::NotFound(format!("template '{}'", name)),
        other => other,
    }
}

/// Handle template listing.
pub async fn handle_list_templates(State(state): State<SharedState>) -> Json<Vec<Template>> {
    Json(state.templates.list().await)
}

/// Handle fetching one template.
pub async fn handle_get_template(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<Template>> {
    let template = state.templates.get(&name).await.map_err(template_lookup)?;
    Ok(Json(template))
}

/// Handle creating or replacing a template.
pub async fn handle_set_template(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(mut template): Json<Template>,
) -> Result<Json<Template>> {
    template.name = name;
    Ok(Json(state.templates.set(template).await?))
}

/// Handle template deletion.
pub async fn handle_delete_template(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<DeletedResponse>> {
    state
        .templates
        .delete(&name)
        .await
        .map_err(template_lookup)?;
    Ok(DeletedResponse::of(name))
}

// ============================================================================
// Version
// ============================================================================

/// Response for version queries.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    /// Server version.
    pub version: String,
    /// Gateway implementation in use.
    pub gateway: String,
    /// Milliseconds since start.
    pub uptime_ms: u64,
}

/// Handle version queries.
pub async fn handle_version(State(state): State<SharedState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: state.version.clone(),
        gateway: state.gateway.gateway_type().to_string(),
        uptime_ms: u64::try_from(state.start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}
