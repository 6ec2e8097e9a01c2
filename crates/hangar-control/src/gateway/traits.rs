// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster Gateway trait definitions.
//!
//! Defines the abstract interface to the cluster orchestrator. The control
//! plane never caches what the gateway returns beyond a single request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::machine::Resources;

/// Errors from gateway operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The referenced object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An object with the same name already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The orchestrator API rejected or failed the request.
    #[error("Orchestrator API error: {0}")]
    Api(String),

    /// The orchestrator did not answer in time.
    #[error("Orchestrator request timed out")]
    Timeout,

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Lifecycle phase of a backing workload as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    /// Accepted but not all containers are running yet.
    Pending,
    /// Bound to a node with at least one container running.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// All containers terminated, at least one in failure.
    Failed,
    /// State could not be obtained.
    Unknown,
}

impl WorkloadPhase {
    /// Parse the orchestrator's phase string. Anything unrecognised is `Unknown`.
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => WorkloadPhase::Pending,
            Some("Running") => WorkloadPhase::Running,
            Some("Succeeded") => WorkloadPhase::Succeeded,
            Some("Failed") => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }

    /// The orchestrator's spelling of this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadPhase::Pending => "Pending",
            WorkloadPhase::Running => "Running",
            WorkloadPhase::Succeeded => "Succeeded",
            WorkloadPhase::Failed => "Failed",
            WorkloadPhase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness of one container inside a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReadiness {
    /// Container name.
    pub name: String,
    /// Whether the container passes its readiness checks.
    pub ready: bool,
    /// Waiting/terminated reason, if the orchestrator gave one.
    pub reason: Option<String>,
}

/// The backing workload currently realizing a machine.
#[derive(Debug, Clone)]
pub struct Workload {
    /// Orchestrator object name (derived from the machine id).
    pub name: String,
    /// Machine id this workload realizes.
    pub machine_id: String,
    /// Principal that created the machine.
    pub owner: String,
    /// Container image.
    pub image: String,
    /// Environment variables of the main container.
    pub env: BTreeMap<String, String>,
    /// Auxiliary capabilities, in request order.
    pub tools: Vec<String>,
    /// Resource ceilings.
    pub resources: Resources,
    /// Name of the attached persistent volume claim, if any.
    pub volume_claim: Option<String>,
    /// Current phase.
    pub phase: WorkloadPhase,
    /// Orchestrator-reported reason for the current phase.
    pub reason: Option<String>,
    /// Orchestrator-reported human readable message.
    pub message: Option<String>,
    /// Per-container readiness.
    pub containers: Vec<ContainerReadiness>,
    /// When the orchestrator created the object.
    pub created_at: Option<DateTime<Utc>>,
    /// Cluster-internal IP, once assigned.
    pub pod_ip: Option<String>,
    /// Deletion was requested and the orchestrator is tearing it down.
    pub terminating: bool,
}

impl Workload {
    /// True when at least one container exists and every container is ready.
    pub fn all_containers_ready(&self) -> bool {
        !self.containers.is_empty() && self.containers.iter().all(|c| c.ready)
    }

    /// Names of containers that are not ready.
    pub fn unready_containers(&self) -> Vec<&str> {
        self.containers
            .iter()
            .filter(|c| !c.ready)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Re-derive the creation spec this workload was built from.
    pub fn to_spec(&self) -> WorkloadSpec {
        WorkloadSpec {
            machine_id: self.machine_id.clone(),
            owner: self.owner.clone(),
            image: self.image.clone(),
            env: self.env.clone(),
            tools: self.tools.clone(),
            resources: self.resources.clone(),
            volume_claim: self.volume_claim.clone(),
        }
    }
}

/// Everything needed to create a backing workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// Machine id.
    pub machine_id: String,
    /// Principal that owns the machine.
    pub owner: String,
    /// Container image.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Auxiliary capabilities.
    pub tools: Vec<String>,
    /// Resource ceilings.
    pub resources: Resources,
    /// Persistent volume claim to mount, if any.
    pub volume_claim: Option<String>,
}

/// A persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaim {
    /// Claim name.
    pub name: String,
    /// Owning machine id label.
    pub machine_id: Option<String>,
    /// Requested storage size.
    pub size: Option<String>,
    /// Snapshot the claim was populated from.
    pub source_snapshot: Option<String>,
}

/// Request to create a persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaimSpec {
    /// Claim name.
    pub name: String,
    /// Owning machine id.
    pub machine_id: String,
    /// Storage size (e.g. `10Gi`).
    pub size: String,
    /// Populate the claim from this snapshot.
    pub source_snapshot: Option<String>,
}

/// A point-in-time capture of a machine's data volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Snapshot id (`<machineId>-snap-<unixSeconds>`).
    pub id: String,
    /// Owning machine id label. Snapshots without the label belong to nobody.
    pub machine_id: Option<String>,
    /// Free-form description.
    pub description: String,
    /// Creation time recorded on the snapshot.
    pub created_at: Option<DateTime<Utc>>,
    /// Claim the snapshot was taken from.
    pub source_claim: Option<String>,
    /// Whether the orchestrator reports the snapshot usable.
    pub ready: bool,
    /// Size needed to restore the snapshot, if reported.
    pub restore_size: Option<String>,
}

/// Request to capture a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Snapshot id.
    pub id: String,
    /// Owning machine id.
    pub machine_id: String,
    /// Claim to capture.
    pub claim_name: String,
    /// Free-form description.
    pub description: String,
    /// Creation time annotation.
    pub created_at: DateTime<Utc>,
}

/// Output of a command executed inside a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code, when the orchestrator reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Failure description when the command did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Options for reading a machine's logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Container to read; the main container when unset.
    pub container: Option<String>,
    /// Only the last N lines.
    pub tail: Option<i64>,
    /// Keep the stream open for new lines.
    pub follow: bool,
}

/// Stream of log lines.
pub type LogStream = BoxStream<'static, Result<String>>;

/// Trait for cluster orchestrator access.
///
/// Every call may fail or time out; callers translate failures rather than
/// assuming success. Implementations own the `machine id -> workload`
/// mapping and must never report two live workloads for one machine id.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Gateway type identifier (e.g. "kube", "mock").
    fn gateway_type(&self) -> &'static str;

    /// Namespace holding the machines.
    fn namespace(&self) -> &str;

    /// Find the backing workload for a machine.
    async fn find(&self, machine_id: &str) -> Result<Option<Workload>>;

    /// Create a backing workload.
    async fn create(&self, spec: &WorkloadSpec) -> Result<Workload>;

    /// Delete a machine's backing workload. Returns false if it did not exist.
    async fn delete(&self, machine_id: &str) -> Result<bool>;

    /// List every workload labeled as a machine.
    async fn list_all(&self) -> Result<Vec<Workload>>;

    /// Host name under which the workload is reachable inside the cluster.
    fn service_host(&self, workload: &Workload) -> String {
        format!("{}.{}.svc.cluster.local", workload.name, self.namespace())
    }

    /// Execute a command in the machine's main container.
    async fn exec(&self, machine_id: &str, command: &[String]) -> Result<ExecOutput>;

    /// Read the machine's logs as a stream of lines.
    async fn logs(&self, machine_id: &str, options: &LogOptions) -> Result<LogStream>;

    /// Look up a persistent volume claim.
    async fn find_volume_claim(&self, name: &str) -> Result<Option<VolumeClaim>>;

    /// Create a persistent volume claim.
    async fn create_volume_claim(&self, spec: &VolumeClaimSpec) -> Result<VolumeClaim>;

    /// Delete a persistent volume claim. Returns false if it did not exist.
    async fn delete_volume_claim(&self, name: &str) -> Result<bool>;

    /// Capture a claim into a new snapshot.
    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<SnapshotRecord>;

    /// Look up a snapshot by id.
    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>>;

    /// List snapshots labeled for a machine.
    async fn list_snapshots(&self, machine_id: &str) -> Result<Vec<SnapshotRecord>>;

    /// Delete a snapshot. Returns false if it did not exist.
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool>;
}
