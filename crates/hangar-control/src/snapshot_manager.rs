// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot creation, listing, restore and deletion.
//!
//! A snapshot captures a machine's data volume claim and is labeled with the
//! owning machine id. Restore and delete only act on snapshots labeled for
//! the machine named in the request.
//!
//! Restore is a strictly ordered sequence:
//!
//! 1. validate the snapshot's owner
//! 2. find the machine's claim through its current workload
//! 3. delete the workload and wait for it to go
//! 4. delete the claim and wait for it to go
//! 5. create a claim of the same name populated from the snapshot
//! 6. recreate the workload from its previous spec
//!
//! A failing step stops the sequence and nothing is rolled back. If step 6
//! fails the machine is left with a restored volume and no workload; its
//! health record is marked unhealthy with that message.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::gateway::{
    ClusterGateway, GatewayError, SnapshotRecord, SnapshotRequest, VolumeClaimSpec, Workload,
};
use crate::health_monitor::HealthMonitor;
use crate::recovery::{PollBudget, wait_for_workload_gone};

/// Claim size used when a snapshot does not report its restore size.
pub const FALLBACK_RESTORE_SIZE: &str = "10Gi";

/// Snapshot id for `machine_id` captured at `at`.
pub fn snapshot_id(machine_id: &str, at: DateTime<Utc>) -> String {
    format!("{}-snap-{}", machine_id, at.timestamp())
}

/// Snapshot operations for machines.
#[derive(Clone)]
pub struct SnapshotManager {
    gateway: Arc<dyn ClusterGateway>,
    health: HealthMonitor,
    budget: PollBudget,
}

impl SnapshotManager {
    /// Create a snapshot manager.
    pub fn new(gateway: Arc<dyn ClusterGateway>, health: HealthMonitor, budget: PollBudget) -> Self {
        Self {
            gateway,
            health,
            budget,
        }
    }

    /// Snapshot a machine's data volume now.
    pub async fn create(&self, machine_id: &str, description: &str) -> Result<SnapshotRecord> {
        self.create_at(machine_id, description, Utc::now()).await
    }

    /// Snapshot a machine's data volume with an explicit creation time.
    pub async fn create_at(
        &self,
        machine_id: &str,
        description: &str,
        at: DateTime<Utc>,
    ) -> Result<SnapshotRecord> {
        let workload = self.workload(machine_id).await?;
        let claim_name = workload
            .volume_claim
            .ok_or_else(|| Error::NoDataVolume(machine_id.to_string()))?;

        let request = SnapshotRequest {
            id: snapshot_id(machine_id, at),
            machine_id: machine_id.to_string(),
            claim_name,
            description: description.to_string(),
            created_at: at,
        };

        let snapshot = match self.gateway.create_snapshot(&request).await {
            Ok(snapshot) => snapshot,
            Err(GatewayError::AlreadyExists(_)) => return Err(Error::SnapshotExists(request.id)),
            Err(e) => return Err(e.into()),
        };
        info!(
            machine_id = %machine_id,
            snapshot_id = %snapshot.id,
            claim = %request.claim_name,
            "Snapshot created"
        );
        Ok(snapshot)
    }

    /// Snapshots labeled for `machine_id`, oldest first.
    pub async fn list(&self, machine_id: &str) -> Result<Vec<SnapshotRecord>> {
        let mut snapshots: Vec<SnapshotRecord> = self
            .gateway
            .list_snapshots(machine_id)
            .await?
            .into_iter()
            .filter(|s| s.machine_id.as_deref() == Some(machine_id))
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    /// Restore a machine's data volume from one of its snapshots.
    ///
    /// Returns the recreated workload.
    pub async fn restore(&self, machine_id: &str, snapshot_id: &str) -> Result<Workload> {
        let _guard = self.health.lock_machine(machine_id).await;

        let snapshot = self.owned_snapshot(machine_id, snapshot_id).await?;

        let workload = self.workload(machine_id).await?;
        let claim_name = workload
            .volume_claim
            .clone()
            .ok_or_else(|| Error::NoDataVolume(machine_id.to_string()))?;
        let spec = workload.to_spec();

        info!(machine_id = %machine_id, snapshot_id = %snapshot_id, claim = %claim_name, "Restore started");

        self.gateway.delete(machine_id).await?;
        wait_for_workload_gone(self.gateway.as_ref(), machine_id, &self.budget).await;

        self.gateway.delete_volume_claim(&claim_name).await?;
        self.wait_for_claim_gone(&claim_name).await;

        let size = snapshot
            .restore_size
            .clone()
            .unwrap_or_else(|| FALLBACK_RESTORE_SIZE.to_string());
        self.gateway
            .create_volume_claim(&VolumeClaimSpec {
                name: claim_name.clone(),
                machine_id: machine_id.to_string(),
                size,
                source_snapshot: Some(snapshot.id.clone()),
            })
            .await?;

        match self.gateway.create(&spec).await {
            Ok(recreated) => {
                info!(machine_id = %machine_id, snapshot_id = %snapshot_id, "Restore completed");
                Ok(recreated)
            }
            Err(e) => {
                let err = Error::RestoreIncomplete {
                    machine_id: machine_id.to_string(),
                    snapshot_id: snapshot_id.to_string(),
                    reason: e.to_string(),
                };
                error!(machine_id = %machine_id, error = %err, "Restore left machine without a workload");
                self.health.mark_unhealthy(machine_id, err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Delete one of a machine's snapshots.
    pub async fn delete(&self, machine_id: &str, snapshot_id: &str) -> Result<()> {
        self.owned_snapshot(machine_id, snapshot_id).await?;
        if !self.gateway.delete_snapshot(snapshot_id).await? {
            return Err(Error::SnapshotNotFound(snapshot_id.to_string()));
        }
        info!(machine_id = %machine_id, snapshot_id = %snapshot_id, "Snapshot deleted");
        Ok(())
    }

    async fn workload(&self, machine_id: &str) -> Result<Workload> {
        self.gateway
            .find(machine_id)
            .await?
            .ok_or_else(|| Error::MachineNotFound(machine_id.to_string()))
    }

    async fn owned_snapshot(&self, machine_id: &str, snapshot_id: &str) -> Result<SnapshotRecord> {
        let snapshot = self
            .gateway
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| Error::SnapshotNotFound(snapshot_id.to_string()))?;
        if snapshot.machine_id.as_deref() != Some(machine_id) {
            warn!(
                machine_id = %machine_id,
                snapshot_id = %snapshot_id,
                owner = ?snapshot.machine_id,
                "Snapshot belongs to another machine"
            );
            return Err(Error::SnapshotOwnership {
                snapshot_id: snapshot_id.to_string(),
                machine_id: machine_id.to_string(),
            });
        }
        Ok(snapshot)
    }

    async fn wait_for_claim_gone(&self, claim_name: &str) -> bool {
        let gateway = self.gateway.as_ref();
        let gone = self
            .budget
            .poll_until(move || async move {
                matches!(gateway.find_volume_claim(claim_name).await, Ok(None))
            })
            .await;
        if !gone {
            warn!(claim = %claim_name, "Claim still present after poll budget, proceeding");
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_id_format() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(snapshot_id("m1", at), "m1-snap-1700000000");
    }

    #[test]
    fn test_snapshot_ids_differ_by_second() {
        let first = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let second = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
        assert_ne!(snapshot_id("m1", first), snapshot_id("m1", second));
    }
}
