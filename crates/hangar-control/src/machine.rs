// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Machine identity, naming and request/response shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::gateway::{Workload, WorkloadPhase};

/// Maximum length of a machine id. Leaves room for the `machine-` prefix and
/// `-data` / `-snap-<ts>` suffixes inside the orchestrator's 63 char limit.
pub const MAX_MACHINE_ID_LEN: usize = 40;

/// Orchestrator object name for a machine's backing workload.
pub fn workload_name(machine_id: &str) -> String {
    format!("machine-{}", machine_id)
}

/// Name of a machine's persistent data volume claim.
pub fn data_claim_name(machine_id: &str) -> String {
    format!("machine-{}-data", machine_id)
}

/// Principal name as stored in the owner label.
///
/// Label values allow `[A-Za-z0-9_.-]` and at most 63 characters; anything
/// else becomes `-`.
pub fn owner_label(principal: &str) -> String {
    principal
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect()
}

/// Validate a caller-supplied machine id.
///
/// Ids must be lowercase DNS labels: `[a-z0-9]([-a-z0-9]*[a-z0-9])?`.
pub fn validate_machine_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidRequest("id is required".to_string()));
    }
    if id.len() > MAX_MACHINE_ID_LEN {
        return Err(Error::InvalidRequest(format!(
            "id must be at most {} characters",
            MAX_MACHINE_ID_LEN
        )));
    }
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || id.starts_with('-') || id.ends_with('-') {
        return Err(Error::InvalidRequest(format!(
            "invalid id '{}': use lowercase letters, digits and '-'",
            id
        )));
    }
    Ok(())
}

/// CPU / memory / disk ceilings. Unset fields are filled by templates and quotas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU limit, e.g. `500m` or `2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory limit, e.g. `2Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Data volume size, e.g. `10Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
}

fn is_unset(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

impl Resources {
    /// Fill every unset field from `defaults`. Set fields are never touched.
    pub fn fill_unset(&mut self, defaults: &Resources) {
        if is_unset(&self.cpu) {
            self.cpu = defaults.cpu.clone();
        }
        if is_unset(&self.memory) {
            self.memory = defaults.memory.clone();
        }
        if is_unset(&self.disk) {
            self.disk = defaults.disk.clone();
        }
    }

    /// Fields set in `self` win over `base`.
    pub fn over(&self, base: &Resources) -> Resources {
        let mut merged = self.clone();
        merged.fill_unset(base);
        merged
    }
}

/// Body of a machine creation request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRequest {
    /// Caller-supplied machine id.
    #[serde(default)]
    pub id: String,
    /// Container image. Required unless `template` is given.
    #[serde(default)]
    pub image: Option<String>,
    /// Template to start from.
    #[serde(default)]
    pub template: Option<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Auxiliary capabilities.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Resource ceilings.
    #[serde(default)]
    pub resources: Resources,
}

/// Machine as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineView {
    /// Machine id.
    pub id: String,
    /// Backing workload name.
    pub name: String,
    /// Owning principal.
    pub owner: String,
    /// Container image.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Auxiliary capabilities.
    pub tools: Vec<String>,
    /// Resource ceilings.
    pub resources: Resources,
    /// Workload phase.
    pub phase: WorkloadPhase,
    /// Attached data volume claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_claim: Option<String>,
    /// Creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Workload> for MachineView {
    fn from(workload: Workload) -> Self {
        Self {
            id: workload.machine_id,
            name: workload.name,
            owner: workload.owner,
            image: workload.image,
            env: workload.env,
            tools: workload.tools,
            resources: workload.resources,
            phase: workload.phase,
            volume_claim: workload.volume_claim,
            created_at: workload.created_at,
        }
    }
}
