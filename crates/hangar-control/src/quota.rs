// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-principal quotas.
//!
//! A quota carries a machine-count ceiling and resource defaults. At machine
//! creation the enforcer first admits the request against the ceiling, then
//! fills unset resource fields from the principal's quota. Explicitly
//! requested values are never changed, even when they exceed the defaults.
//!
//! The `default` quota always exists and applies to principals without their
//! own quota.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::machine::{Resources, owner_label};
use crate::store::Store;

/// Principal used when a request carries no identity.
pub const DEFAULT_PRINCIPAL: &str = "default";

/// Resource ceiling and defaults for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    /// Principal this quota applies to.
    #[serde(default)]
    pub user_id: String,
    /// Maximum machines the principal may own. `0` means unlimited.
    #[serde(default)]
    pub max_machines: u32,
    /// Defaults for unset resource fields.
    #[serde(default)]
    pub resources: Resources,
}

impl Quota {
    /// The built-in `default` quota.
    pub fn builtin_default() -> Self {
        Self {
            user_id: DEFAULT_PRINCIPAL.to_string(),
            max_machines: 10,
            resources: Resources {
                cpu: Some("1".to_string()),
                memory: Some("2Gi".to_string()),
                disk: Some("10Gi".to_string()),
            },
        }
    }
}

/// Quotas keyed by principal.
pub type QuotaStore = Store<String, Quota>;

/// A quota store holding only the built-in `default` quota.
pub fn default_quotas() -> QuotaStore {
    let quota = Quota::builtin_default();
    Store::with_entries([(quota.user_id.clone(), quota)])
}

/// Admission control and resource defaulting at machine creation.
#[derive(Clone)]
pub struct QuotaEnforcer {
    quotas: QuotaStore,
    gateway: Arc<dyn ClusterGateway>,
}

impl QuotaEnforcer {
    /// Create an enforcer over `quotas`.
    pub fn new(quotas: QuotaStore, gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { quotas, gateway }
    }

    /// Quota in effect for `principal`.
    pub async fn quota_for(&self, principal: &str) -> Quota {
        if let Some(quota) = self.quotas.get(&principal.to_string()).await {
            return quota;
        }
        self.quotas
            .get(&DEFAULT_PRINCIPAL.to_string())
            .await
            .unwrap_or_else(Quota::builtin_default)
    }

    /// Fill unset resource fields from the principal's quota.
    pub async fn apply(&self, principal: &str, resources: &mut Resources) {
        let quota = self.quota_for(principal).await;
        resources.fill_unset(&quota.resources);
        debug!(
            principal = %principal,
            quota = %quota.user_id,
            cpu = ?resources.cpu,
            memory = ?resources.memory,
            disk = ?resources.disk,
            "Applied quota defaults"
        );
    }

    /// Reject creation when the principal already owns `maxMachines`
    /// machines.
    pub async fn admit(&self, principal: &str) -> Result<()> {
        let quota = self.quota_for(principal).await;
        if quota.max_machines == 0 {
            return Ok(());
        }
        let owner = owner_label(principal);
        let current = self
            .gateway
            .list_all()
            .await?
            .iter()
            .filter(|w| w.owner == owner)
            .count();
        if current >= quota.max_machines as usize {
            return Err(Error::QuotaExceeded {
                user_id: principal.to_string(),
                current,
                max: quota.max_machines,
            });
        }
        Ok(())
    }

    /// Every quota, sorted by principal.
    pub async fn list(&self) -> Vec<Quota> {
        let mut quotas = self.quotas.list().await;
        quotas.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        quotas
    }

    /// Quota assigned to `user_id`, without the default fallback.
    pub async fn get(&self, user_id: &str) -> Option<Quota> {
        self.quotas.get(&user_id.to_string()).await
    }

    /// Create or replace a quota.
    pub async fn set(&self, quota: Quota) -> Result<Quota> {
        if quota.user_id.trim().is_empty() {
            return Err(Error::InvalidRequest("userId is required".to_string()));
        }
        info!(user_id = %quota.user_id, max_machines = quota.max_machines, "Quota set");
        self.quotas.set(quota.user_id.clone(), quota.clone()).await;
        Ok(quota)
    }

    /// Remove a quota. The `default` quota cannot be removed.
    pub async fn delete(&self, user_id: &str) -> Result<bool> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidRequest("userId is required".to_string()));
        }
        if user_id == DEFAULT_PRINCIPAL {
            return Err(Error::InvalidRequest(
                "the default quota cannot be deleted".to_string(),
            ));
        }
        let removed = self.quotas.delete(&user_id.to_string()).await.is_some();
        if removed {
            info!(user_id = %user_id, "Quota deleted");
        }
        Ok(removed)
    }
}
