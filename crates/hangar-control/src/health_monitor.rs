// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background supervisor that assesses machine health and triggers recovery.
//!
//! On every tick the supervisor lists all machine workloads and spawns one
//! assessment task per machine. An assessment reads the workload's phase and
//! container readiness, updates the machine's [`HealthRecord`] and, when the
//! machine is unhealthy, decides whether to run [`Recovery`].
//!
//! Work for one machine is serialized through a per-machine async mutex. A
//! triggered recovery keeps holding that machine's lock, so the next
//! assessment of the same machine waits until the recovery has finished.
//! Machines never wait on each other.
//!
//! Recovery is bounded: each unhealthy assessment spends one attempt, at
//! most [`MAX_RECOVERY_ATTEMPTS`] in a row. A healthy assessment resets the
//! counter.
//!
//! A machine deleted through the API is remembered until its workload stops
//! being listed. Neither it nor any workload the orchestrator reports as
//! terminating is assessed or recovered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::gateway::{ClusterGateway, Workload, WorkloadPhase};
use crate::recovery::{PollBudget, Recovery, RecoveryOutcome};
use crate::store::Store;

/// Recovery attempts allowed before a machine is left unhealthy.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Supervisory status of a machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Running with every container ready.
    Healthy,
    /// Failing and not being repaired.
    Unhealthy,
    /// A recovery attempt has been started.
    Recovering,
    /// Not assessed yet.
    #[default]
    Unknown,
}

/// Health of one machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Machine id.
    pub id: String,
    /// Current status.
    pub status: HealthStatus,
    /// Time of the last assessment.
    pub last_checked: Option<DateTime<Utc>>,
    /// Consecutive recovery attempts since the machine was last healthy.
    pub recovery_attempts: u32,
    /// Diagnostic text.
    pub message: String,
}

impl HealthRecord {
    /// A record for a machine that has not been assessed yet.
    pub fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: HealthStatus::Unknown,
            last_checked: None,
            recovery_attempts: 0,
            message: "awaiting first health check".to_string(),
        }
    }
}

/// Health records keyed by machine id.
pub type HealthStore = Store<String, HealthRecord>;

/// Derive status and message from a workload's observed state.
///
/// Only `Running` with every container ready is healthy. A workload that
/// reports no containers is not ready.
pub fn assess(workload: &Workload) -> (HealthStatus, String) {
    let reason = workload
        .reason
        .as_deref()
        .or(workload.message.as_deref())
        .unwrap_or("no reason reported");
    match workload.phase {
        WorkloadPhase::Running if workload.all_containers_ready() => (
            HealthStatus::Healthy,
            "running, all containers ready".to_string(),
        ),
        WorkloadPhase::Running => {
            let unready = workload.unready_containers();
            let message = if unready.is_empty() {
                "running but no containers reported".to_string()
            } else {
                format!("running but containers not ready: {}", unready.join(", "))
            };
            (HealthStatus::Unhealthy, message)
        }
        WorkloadPhase::Pending => (HealthStatus::Unhealthy, format!("pending: {}", reason)),
        phase => (
            HealthStatus::Unhealthy,
            format!("phase {}: {}", phase, reason),
        ),
    }
}

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often to assess every machine.
    pub poll_interval: Duration,
    /// Deletion wait used by recovery.
    pub recovery_budget: PollBudget,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            recovery_budget: PollBudget::default(),
        }
    }
}

/// Health supervisor. Cheap to clone; clones share records and locks.
#[derive(Clone)]
pub struct HealthMonitor {
    gateway: Arc<dyn ClusterGateway>,
    records: HealthStore,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    deleted: Arc<DashSet<String>>,
    recovery: Recovery,
    config: HealthMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    /// Create a new health monitor writing into `records`.
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        records: HealthStore,
        config: HealthMonitorConfig,
    ) -> Self {
        let recovery = Recovery::new(gateway.clone(), config.recovery_budget);
        Self {
            gateway,
            records,
            locks: Arc::new(DashMap::new()),
            deleted: Arc::new(DashSet::new()),
            recovery,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// The record store this monitor writes.
    pub fn records(&self) -> &HealthStore {
        &self.records
    }

    /// Run the supervision loop until shutdown is signalled.
    ///
    /// In-flight assessments and recoveries are left to finish on their own.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_recovery_attempts = MAX_RECOVERY_ATTEMPTS,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Failed to list machines, skipping tick");
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }

    /// Run one tick: spawn an assessment for every listed machine.
    ///
    /// Returns the assessment task handles. The loop drops them; tests join
    /// them to observe a complete tick.
    pub async fn reconcile(&self) -> Result<Vec<JoinHandle<()>>> {
        let workloads = self.gateway.list_all().await?;
        debug!(machines = workloads.len(), "Assessing machines");

        self.deleted
            .retain(|id| workloads.iter().any(|w| &w.machine_id == id));

        let handles = workloads
            .into_iter()
            .filter(|workload| {
                !workload.terminating && !self.deleted.contains(&workload.machine_id)
            })
            .map(|workload| {
                let monitor = self.clone();
                tokio::spawn(async move {
                    let machine_id = workload.machine_id;
                    if let Err(e) = monitor.assess_machine(&machine_id).await {
                        error!(machine_id = %machine_id, error = %e, "Health assessment failed");
                    }
                })
            })
            .collect();
        Ok(handles)
    }

    /// Assess one machine now.
    ///
    /// Waits for any assessment or recovery already running for the same
    /// machine. A recovery triggered here runs in the background.
    pub async fn assess_machine(&self, machine_id: &str) -> Result<HealthRecord> {
        let guard = self.lock_machine(machine_id).await;
        let result = self.assess_locked(machine_id, guard).await;
        if matches!(result, Err(Error::MachineNotFound(_))) {
            self.prune_lock(machine_id);
        }
        result
    }

    /// Current record for a machine, assessing it first if it has never been
    /// checked.
    pub async fn status(&self, machine_id: &str) -> Result<HealthRecord> {
        match self.records.get(&machine_id.to_string()).await {
            Some(record) if record.status != HealthStatus::Unknown => Ok(record),
            _ => self.assess_machine(machine_id).await,
        }
    }

    /// Every record, sorted by machine id.
    pub async fn all(&self) -> Vec<HealthRecord> {
        let mut records = self.records.list().await;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Register a machine that has not been checked yet.
    pub async fn track(&self, machine_id: &str) {
        self.deleted.remove(machine_id);
        self.records
            .set(machine_id.to_string(), HealthRecord::pending(machine_id))
            .await;
    }

    /// Mark a machine unhealthy without assessing it.
    pub async fn mark_unhealthy(&self, machine_id: &str, message: impl Into<String>) {
        let message = message.into();
        self.records
            .update(machine_id.to_string(), |record| {
                record.id = machine_id.to_string();
                record.status = HealthStatus::Unhealthy;
                record.last_checked = Some(Utc::now());
                record.message = message;
            })
            .await;
    }

    /// Drop all state kept for a machine deleted by a client.
    ///
    /// Until the machine is tracked again no assessment or recovery acts on
    /// it, even while its workload is still visible.
    pub async fn forget(&self, machine_id: &str) {
        self.deleted.insert(machine_id.to_string());
        self.records.delete(&machine_id.to_string()).await;
        self.locks.remove(machine_id);
    }

    /// Whether the machine was deleted by a client and not created again.
    pub fn is_deleted(&self, machine_id: &str) -> bool {
        self.deleted.contains(machine_id)
    }

    /// Number of machines with a lock entry.
    pub fn lock_entries(&self) -> usize {
        self.locks.len()
    }

    /// Hold the machine's lock so no assessment or recovery runs for it
    /// until the guard is dropped.
    pub async fn lock_machine(&self, machine_id: &str) -> OwnedMutexGuard<()> {
        self.machine_lock(machine_id).lock_owned().await
    }

    fn machine_lock(&self, machine_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(machine_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Remove the lock entry of a machine that does not exist, unless a
    /// waiter or holder still shares it.
    fn prune_lock(&self, machine_id: &str) {
        self.locks
            .remove_if(machine_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn assess_locked(
        &self,
        machine_id: &str,
        guard: OwnedMutexGuard<()>,
    ) -> Result<HealthRecord> {
        if self.is_deleted(machine_id) {
            return Err(Error::MachineNotFound(machine_id.to_string()));
        }
        let workload = match self.gateway.find(machine_id).await? {
            Some(workload) if !workload.terminating => workload,
            Some(_) => {
                debug!(machine_id = %machine_id, "Workload terminating, skipping assessment");
                return Err(Error::MachineNotFound(machine_id.to_string()));
            }
            None => return Err(Error::MachineNotFound(machine_id.to_string())),
        };

        let (status, message) = assess(&workload);
        let now = Utc::now();

        let record = self
            .records
            .update(machine_id.to_string(), |record| {
                record.id = machine_id.to_string();
                record.last_checked = Some(now);
                if status == HealthStatus::Healthy {
                    record.status = HealthStatus::Healthy;
                    record.recovery_attempts = 0;
                    record.message = message;
                } else if record.recovery_attempts < MAX_RECOVERY_ATTEMPTS {
                    record.recovery_attempts += 1;
                    record.status = HealthStatus::Recovering;
                    record.message = format!(
                        "{}; recovery attempt {}/{}",
                        message, record.recovery_attempts, MAX_RECOVERY_ATTEMPTS
                    );
                } else {
                    record.status = HealthStatus::Unhealthy;
                    record.message = format!(
                        "{}; max recovery attempts reached ({}/{})",
                        message, MAX_RECOVERY_ATTEMPTS, MAX_RECOVERY_ATTEMPTS
                    );
                }
            })
            .await;

        match record.status {
            HealthStatus::Healthy => {
                debug!(machine_id = %machine_id, "Machine healthy");
            }
            HealthStatus::Recovering => {
                warn!(
                    machine_id = %machine_id,
                    attempt = record.recovery_attempts,
                    message = %record.message,
                    "Machine unhealthy, starting recovery"
                );
                self.spawn_recovery(machine_id.to_string(), record.recovery_attempts, guard);
            }
            _ => {
                warn!(
                    machine_id = %machine_id,
                    message = %record.message,
                    "Machine unhealthy, recovery attempts exhausted"
                );
            }
        }

        Ok(record)
    }

    fn spawn_recovery(&self, machine_id: String, attempt: u32, guard: OwnedMutexGuard<()>) {
        let recovery = self.recovery.clone();
        let records = self.records.clone();
        let deleted = self.deleted.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if deleted.contains(&machine_id) {
                debug!(machine_id = %machine_id, "Machine deleted, recovery skipped");
                return;
            }
            let outcome = recovery.run(&machine_id).await;
            let (status, message) = match outcome {
                Ok(RecoveryOutcome::Recreated(_)) => (
                    HealthStatus::Recovering,
                    format!(
                        "recovery attempt {}/{} recreated the workload",
                        attempt, MAX_RECOVERY_ATTEMPTS
                    ),
                ),
                Ok(RecoveryOutcome::Missing) => (
                    HealthStatus::Unhealthy,
                    "recovery aborted: no backing workload".to_string(),
                ),
                Err(e) => {
                    error!(machine_id = %machine_id, error = %e, "Recovery failed");
                    (
                        HealthStatus::Unhealthy,
                        format!(
                            "recovery attempt {}/{} failed: {}",
                            attempt, MAX_RECOVERY_ATTEMPTS, e
                        ),
                    )
                }
            };
            records
                .modify(&machine_id, |record| {
                    record.status = status;
                    record.message = message;
                })
                .await;
        });
    }
}
