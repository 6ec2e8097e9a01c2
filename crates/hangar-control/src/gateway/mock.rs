// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock gateway for testing.
//!
//! An in-memory cluster: workloads, claims and snapshots live in maps, and
//! any operation can be made to fail on demand.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::traits::*;
use crate::machine::{workload_name, Resources};

/// Gateway operations, used for failure injection and call recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// `find`
    Find,
    /// `create`
    Create,
    /// `delete`
    Delete,
    /// `list_all`
    ListAll,
    /// `exec`
    Exec,
    /// `logs`
    Logs,
    /// `find_volume_claim`
    FindClaim,
    /// `create_volume_claim`
    CreateClaim,
    /// `delete_volume_claim`
    DeleteClaim,
    /// `create_snapshot`
    CreateSnapshot,
    /// `get_snapshot`
    GetSnapshot,
    /// `list_snapshots`
    ListSnapshots,
    /// `delete_snapshot`
    DeleteSnapshot,
}

impl MockOperation {
    /// Whether the operation changes cluster state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            MockOperation::Create
                | MockOperation::Delete
                | MockOperation::CreateClaim
                | MockOperation::DeleteClaim
                | MockOperation::CreateSnapshot
                | MockOperation::DeleteSnapshot
        )
    }
}

#[derive(Debug, Clone)]
struct CreateState {
    phase: WorkloadPhase,
    ready: bool,
    reason: Option<String>,
}

#[derive(Default)]
struct MockCluster {
    workloads: HashMap<String, Workload>,
    /// Deleted workloads still visible to `find` for the given number of calls.
    terminating: HashMap<String, (Workload, u32)>,
    claims: HashMap<String, VolumeClaim>,
    snapshots: HashMap<String, SnapshotRecord>,
    failures: HashSet<MockOperation>,
    calls: Vec<MockOperation>,
    created: Vec<WorkloadSpec>,
    log_lines: Vec<String>,
    exec_output: Option<ExecOutput>,
}

/// Mock gateway for testing.
#[derive(Clone)]
pub struct MockGateway {
    cluster: Arc<Mutex<MockCluster>>,
    create_state: Arc<Mutex<CreateState>>,
    delete_lag: Arc<Mutex<u32>>,
    namespace: String,
    host: String,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    /// Create a mock whose new workloads come up running and ready.
    pub fn new() -> Self {
        Self {
            cluster: Arc::new(Mutex::new(MockCluster::default())),
            create_state: Arc::new(Mutex::new(CreateState {
                phase: WorkloadPhase::Running,
                ready: true,
                reason: None,
            })),
            delete_lag: Arc::new(Mutex::new(0)),
            namespace: "hangar-test".to_string(),
            host: "127.0.0.1".to_string(),
        }
    }

    /// Set the state newly created workloads start in.
    pub async fn set_create_state(&self, phase: WorkloadPhase, ready: bool, reason: Option<&str>) {
        *self.create_state.lock().await = CreateState {
            phase,
            ready,
            reason: reason.map(str::to_string),
        };
    }

    /// Change the state of an existing workload.
    pub async fn set_state(
        &self,
        machine_id: &str,
        phase: WorkloadPhase,
        ready: bool,
        reason: Option<&str>,
    ) {
        let mut cluster = self.cluster.lock().await;
        if let Some(workload) = cluster.workloads.get_mut(machine_id) {
            apply_state(
                workload,
                &CreateState {
                    phase,
                    ready,
                    reason: reason.map(str::to_string),
                },
            );
        }
    }

    /// Number of `find` calls a deleted workload stays visible for, marked
    /// as terminating.
    pub async fn set_delete_lag(&self, calls: u32) {
        *self.delete_lag.lock().await = calls;
    }

    /// Make every call of `op` fail until [`clear_failure`](Self::clear_failure).
    pub async fn fail(&self, op: MockOperation) {
        self.cluster.lock().await.failures.insert(op);
    }

    /// Stop failing `op`.
    pub async fn clear_failure(&self, op: MockOperation) {
        self.cluster.lock().await.failures.remove(&op);
    }

    /// Every operation called so far, in order.
    pub async fn calls(&self) -> Vec<MockOperation> {
        self.cluster.lock().await.calls.clone()
    }

    /// Number of state-changing operations called so far.
    pub async fn mutation_count(&self) -> usize {
        self.cluster
            .lock()
            .await
            .calls
            .iter()
            .filter(|op| op.is_mutation())
            .count()
    }

    /// Every spec passed to a successful `create`.
    pub async fn created_specs(&self) -> Vec<WorkloadSpec> {
        self.cluster.lock().await.created.clone()
    }

    /// Current workload for a machine, bypassing call recording.
    pub async fn workload(&self, machine_id: &str) -> Option<Workload> {
        self.cluster.lock().await.workloads.get(machine_id).cloned()
    }

    /// Current claim, bypassing call recording.
    pub async fn claim(&self, name: &str) -> Option<VolumeClaim> {
        self.cluster.lock().await.claims.get(name).cloned()
    }

    /// Put a snapshot in place directly.
    pub async fn insert_snapshot(&self, snapshot: SnapshotRecord) {
        self.cluster
            .lock()
            .await
            .snapshots
            .insert(snapshot.id.clone(), snapshot);
    }

    /// Lines returned by `logs`.
    pub async fn set_log_lines(&self, lines: Vec<String>) {
        self.cluster.lock().await.log_lines = lines;
    }

    /// Output returned by `exec` instead of echoing the command.
    pub async fn set_exec_output(&self, output: ExecOutput) {
        self.cluster.lock().await.exec_output = Some(output);
    }

    async fn record(&self, op: MockOperation) -> Result<tokio::sync::MutexGuard<'_, MockCluster>> {
        let mut cluster = self.cluster.lock().await;
        cluster.calls.push(op);
        if cluster.failures.contains(&op) {
            return Err(GatewayError::Api(format!("mock failure: {:?}", op)));
        }
        Ok(cluster)
    }
}

fn apply_state(workload: &mut Workload, state: &CreateState) {
    workload.phase = state.phase;
    workload.reason = state.reason.clone();
    for container in &mut workload.containers {
        container.ready = state.ready;
        container.reason = state.reason.clone();
    }
}

#[async_trait]
impl ClusterGateway for MockGateway {
    fn gateway_type(&self) -> &'static str {
        "mock"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn find(&self, machine_id: &str) -> Result<Option<Workload>> {
        let mut cluster = self.record(MockOperation::Find).await?;
        if let Some(workload) = cluster.workloads.get(machine_id) {
            return Ok(Some(workload.clone()));
        }
        let mut gone = false;
        let found = match cluster.terminating.get_mut(machine_id) {
            Some((workload, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(workload.clone())
            }
            Some(_) => {
                gone = true;
                None
            }
            None => None,
        };
        if gone {
            cluster.terminating.remove(machine_id);
        }
        Ok(found)
    }

    async fn create(&self, spec: &WorkloadSpec) -> Result<Workload> {
        let state = self.create_state.lock().await.clone();
        let mut cluster = self.record(MockOperation::Create).await?;
        if cluster.workloads.contains_key(&spec.machine_id)
            || cluster.terminating.contains_key(&spec.machine_id)
        {
            return Err(GatewayError::AlreadyExists(workload_name(&spec.machine_id)));
        }

        let mut workload = Workload {
            name: workload_name(&spec.machine_id),
            machine_id: spec.machine_id.clone(),
            owner: spec.owner.clone(),
            image: spec.image.clone(),
            env: spec.env.clone(),
            tools: spec.tools.clone(),
            resources: spec.resources.clone(),
            volume_claim: spec.volume_claim.clone(),
            phase: WorkloadPhase::Pending,
            reason: None,
            message: None,
            containers: vec![ContainerReadiness {
                name: "machine".to_string(),
                ready: false,
                reason: None,
            }],
            created_at: Some(Utc::now()),
            pod_ip: Some(self.host.clone()),
            terminating: false,
        };
        apply_state(&mut workload, &state);

        cluster.created.push(spec.clone());
        cluster
            .workloads
            .insert(spec.machine_id.clone(), workload.clone());
        Ok(workload)
    }

    async fn delete(&self, machine_id: &str) -> Result<bool> {
        let lag = *self.delete_lag.lock().await;
        let mut cluster = self.record(MockOperation::Delete).await?;
        match cluster.workloads.remove(machine_id) {
            Some(mut workload) => {
                workload.terminating = true;
                if lag > 0 {
                    cluster
                        .terminating
                        .insert(machine_id.to_string(), (workload, lag));
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_all(&self) -> Result<Vec<Workload>> {
        let cluster = self.record(MockOperation::ListAll).await?;
        let mut workloads: Vec<Workload> = cluster.workloads.values().cloned().collect();
        workloads.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        Ok(workloads)
    }

    fn service_host(&self, _workload: &Workload) -> String {
        self.host.clone()
    }

    async fn exec(&self, machine_id: &str, command: &[String]) -> Result<ExecOutput> {
        let cluster = self.record(MockOperation::Exec).await?;
        if !cluster.workloads.contains_key(machine_id) {
            return Err(GatewayError::NotFound(workload_name(machine_id)));
        }
        Ok(cluster.exec_output.clone().unwrap_or_else(|| ExecOutput {
            stdout: format!("{}\n", command.join(" ")),
            stderr: String::new(),
            exit_code: Some(0),
            error: None,
        }))
    }

    async fn logs(&self, machine_id: &str, options: &LogOptions) -> Result<LogStream> {
        let cluster = self.record(MockOperation::Logs).await?;
        if !cluster.workloads.contains_key(machine_id) {
            return Err(GatewayError::NotFound(workload_name(machine_id)));
        }
        let mut lines = cluster.log_lines.clone();
        if let Some(tail) = options.tail {
            let keep = usize::try_from(tail.max(0)).unwrap_or(0);
            let skip = lines.len().saturating_sub(keep);
            lines.drain(..skip);
        }
        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn find_volume_claim(&self, name: &str) -> Result<Option<VolumeClaim>> {
        let cluster = self.record(MockOperation::FindClaim).await?;
        Ok(cluster.claims.get(name).cloned())
    }

    async fn create_volume_claim(&self, spec: &VolumeClaimSpec) -> Result<VolumeClaim> {
        let mut cluster = self.record(MockOperation::CreateClaim).await?;
        if cluster.claims.contains_key(&spec.name) {
            return Err(GatewayError::AlreadyExists(spec.name.clone()));
        }
        if let Some(snapshot) = &spec.source_snapshot
            && !cluster.snapshots.contains_key(snapshot)
        {
            return Err(GatewayError::NotFound(snapshot.clone()));
        }
        let claim = VolumeClaim {
            name: spec.name.clone(),
            machine_id: Some(spec.machine_id.clone()),
            size: Some(spec.size.clone()),
            source_snapshot: spec.source_snapshot.clone(),
        };
        cluster.claims.insert(spec.name.clone(), claim.clone());
        Ok(claim)
    }

    async fn delete_volume_claim(&self, name: &str) -> Result<bool> {
        let mut cluster = self.record(MockOperation::DeleteClaim).await?;
        Ok(cluster.claims.remove(name).is_some())
    }

    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<SnapshotRecord> {
        let mut cluster = self.record(MockOperation::CreateSnapshot).await?;
        if cluster.snapshots.contains_key(&request.id) {
            return Err(GatewayError::AlreadyExists(request.id.clone()));
        }
        let restore_size = cluster
            .claims
            .get(&request.claim_name)
            .and_then(|c| c.size.clone());
        let snapshot = SnapshotRecord {
            id: request.id.clone(),
            machine_id: Some(request.machine_id.clone()),
            description: request.description.clone(),
            created_at: Some(request.created_at),
            source_claim: Some(request.claim_name.clone()),
            ready: true,
            restore_size,
        };
        cluster
            .snapshots
            .insert(request.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
        let cluster = self.record(MockOperation::GetSnapshot).await?;
        Ok(cluster.snapshots.get(snapshot_id).cloned())
    }

    async fn list_snapshots(&self, machine_id: &str) -> Result<Vec<SnapshotRecord>> {
        let cluster = self.record(MockOperation::ListSnapshots).await?;
        let mut snapshots: Vec<SnapshotRecord> = cluster
            .snapshots
            .values()
            .filter(|s| s.machine_id.as_deref() == Some(machine_id))
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool> {
        let mut cluster = self.record(MockOperation::DeleteSnapshot).await?;
        Ok(cluster.snapshots.remove(snapshot_id).is_some())
    }
}

/// Spec with just an id and image, for tests.
pub fn simple_spec(machine_id: &str, image: &str) -> WorkloadSpec {
    WorkloadSpec {
        machine_id: machine_id.to_string(),
        owner: "default".to_string(),
        image: image.to_string(),
        env: Default::default(),
        tools: Vec::new(),
        resources: Resources::default(),
        volume_claim: None,
    }
}
