// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Machine recovery.
//!
//! Recovery replaces a machine's backing workload: the current workload is
//! deleted, the orchestrator is polled until it is gone, and a fresh workload
//! is created from the deleted one's spec under the same machine id.
//!
//! Waiting for deletion is best-effort. When the poll budget runs out the
//! procedure proceeds anyway and the create call may fail with a conflict,
//! which surfaces as a failed attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::gateway::{ClusterGateway, Workload};

/// Fixed retry budget for "wait until it's gone" polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    /// Sleep between checks.
    pub interval: Duration,
    /// Maximum number of checks.
    pub attempts: u32,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            attempts: 10,
        }
    }
}

impl PollBudget {
    /// Run `check` until it returns true or the budget is spent.
    ///
    /// Returns whether the condition was observed.
    pub async fn poll_until<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for attempt in 1..=self.attempts {
            if check().await {
                return true;
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        false
    }
}

/// Wait for a machine's backing workload to disappear.
pub async fn wait_for_workload_gone(
    gateway: &dyn ClusterGateway,
    machine_id: &str,
    budget: &PollBudget,
) -> bool {
    let gone = budget
        .poll_until(move || async move {
            match gateway.find(machine_id).await {
                Ok(found) => found.is_none(),
                Err(e) => {
                    debug!(machine_id = %machine_id, error = %e, "Lookup failed while waiting for deletion");
                    false
                }
            }
        })
        .await;
    if !gone {
        warn!(
            machine_id = %machine_id,
            attempts = budget.attempts,
            "Workload still present after poll budget, proceeding"
        );
    }
    gone
}

/// Result of a recovery run that did not hit a gateway error.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// A fresh workload was created.
    Recreated(Workload),
    /// There was no workload to recover.
    Missing,
}

/// Delete-and-recreate repair for one machine.
#[derive(Clone)]
pub struct Recovery {
    gateway: Arc<dyn ClusterGateway>,
    budget: PollBudget,
}

impl Recovery {
    /// Create a recovery procedure.
    pub fn new(gateway: Arc<dyn ClusterGateway>, budget: PollBudget) -> Self {
        Self { gateway, budget }
    }

    /// Recover `machine_id`.
    ///
    /// A machine without a backing workload is not recovered; that is
    /// reported as [`RecoveryOutcome::Missing`] rather than an error.
    pub async fn run(&self, machine_id: &str) -> crate::error::Result<RecoveryOutcome> {
        let Some(workload) = self.gateway.find(machine_id).await? else {
            warn!(machine_id = %machine_id, "No backing workload to recover, aborting");
            return Ok(RecoveryOutcome::Missing);
        };
        if workload.terminating {
            warn!(machine_id = %machine_id, "Workload already terminating, not recreating");
            return Ok(RecoveryOutcome::Missing);
        }

        let spec = workload.to_spec();
        info!(machine_id = %machine_id, image = %spec.image, "Recovery started");

        self.gateway.delete(machine_id).await?;
        wait_for_workload_gone(self.gateway.as_ref(), machine_id, &self.budget).await;

        let recreated = self.gateway.create(&spec).await?;
        info!(machine_id = %machine_id, "Recovery completed, workload recreated");
        Ok(RecoveryOutcome::Recreated(recreated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockGateway, MockOperation, WorkloadPhase};
    use crate::gateway::mock::simple_spec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_budget() -> PollBudget {
        PollBudget {
            interval: Duration::from_millis(10),
            attempts: 10,
        }
    }

    #[test]
    fn test_budget_default() {
        let budget = PollBudget::default();
        assert_eq!(budget.interval, Duration::from_secs(1));
        assert_eq!(budget.attempts, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_gives_up() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let seen = fast_budget()
            .poll_until(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
            .await;
        assert!(!seen);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreates_with_same_spec() {
        let gateway = MockGateway::new();
        let mut spec = simple_spec("m1", "demo:latest");
        spec.env.insert("DISPLAY".to_string(), ":1".to_string());
        gateway.create(&spec).await.unwrap();
        gateway
            .set_state("m1", WorkloadPhase::Failed, false, Some("Error"))
            .await;
        gateway.set_delete_lag(3).await;

        let recovery = Recovery::new(Arc::new(gateway.clone()), fast_budget());
        let outcome = recovery.run("m1").await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Recreated(_)));

        let specs = gateway.created_specs().await;
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1], spec);
        assert_eq!(
            gateway.workload("m1").await.unwrap().phase,
            WorkloadPhase::Running
        );
    }

    #[tokio::test]
    async fn test_missing_workload_aborts() {
        let gateway = MockGateway::new();
        let recovery = Recovery::new(Arc::new(gateway.clone()), fast_budget());
        let outcome = recovery.run("ghost").await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Missing));
        assert_eq!(gateway.mutation_count().await, 0);
    }

    #[tokio::test]
    async fn test_terminating_workload_is_not_recreated() {
        let gateway = MockGateway::new();
        gateway.create(&simple_spec("m1", "demo")).await.unwrap();
        gateway.set_delete_lag(2).await;
        gateway.delete("m1").await.unwrap();
        let mutations = gateway.mutation_count().await;

        let recovery = Recovery::new(Arc::new(gateway.clone()), fast_budget());
        let outcome = recovery.run("m1").await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Missing));
        assert_eq!(gateway.mutation_count().await, mutations);
        assert_eq!(gateway.created_specs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_reported() {
        let gateway = MockGateway::new();
        gateway.create(&simple_spec("m1", "demo")).await.unwrap();
        gateway.fail(MockOperation::Create).await;

        let recovery = Recovery::new(Arc::new(gateway.clone()), fast_budget());
        assert!(recovery.run("m1").await.is_err());
        assert!(gateway.workload("m1").await.is_none());
    }
}
