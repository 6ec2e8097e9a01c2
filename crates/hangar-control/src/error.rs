// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hangar-control.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Cluster gateway operation failed.
    #[error("Cluster error: {0}")]
    Gateway(#[from] crate::gateway::GatewayError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Machine was not found.
    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    /// Machine id already has a backing workload.
    #[error("Machine already exists: {0}")]
    MachineExists(String),

    /// Administrative record was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Template was not found.
    #[error("Unknown template: {0}")]
    TemplateNotFound(String),

    /// Snapshot was not found.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A snapshot with the same id already exists.
    #[error("Snapshot already exists: {0}")]
    SnapshotExists(String),

    /// Snapshot is labeled for a different machine.
    #[error("Snapshot {snapshot_id} does not belong to machine {machine_id}")]
    SnapshotOwnership {
        /// Requested snapshot.
        snapshot_id: String,
        /// Machine the request named.
        machine_id: String,
    },

    /// Machine has no persistent data volume to capture or restore.
    #[error("Machine {0} has no data volume")]
    NoDataVolume(String),

    /// Restore replaced the data volume but could not recreate the workload.
    #[error(
        "Volume of machine {machine_id} restored from {snapshot_id} but the machine has no backing workload: {reason}"
    )]
    RestoreIncomplete {
        /// Machine being restored.
        machine_id: String,
        /// Snapshot the volume was restored from.
        snapshot_id: String,
        /// Why the workload could not be recreated.
        reason: String,
    },

    /// Principal has reached its machine ceiling.
    #[error("Quota exceeded for {user_id}: {current}/{max} machines")]
    QuotaExceeded {
        /// Principal.
        user_id: String,
        /// Machines currently owned.
        current: usize,
        /// Ceiling.
        max: u32,
    },

    /// Missing or invalid API key.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Machine address could not be resolved.
    #[error("Failed to resolve machine address: {0}")]
    Resolution(String),

    /// Upstream connection could not be established.
    #[error("Failed to connect to machine: {0}")]
    Connect(String),

    /// Client connection could not be taken over.
    #[error("Failed to hijack connection: {0}")]
    Hijack(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the control plane Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_) | Error::TemplateNotFound(_) | Error::NoDataVolume(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            Error::NotFound(_)
            | Error::MachineNotFound(_)
            | Error::SnapshotNotFound(_)
            | Error::SnapshotOwnership { .. } => StatusCode::NOT_FOUND,
            Error::MachineExists(_) | Error::SnapshotExists(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;

    #[test]
    fn test_client_errors_map_to_4xx() {
        assert_eq!(
            Error::InvalidRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::TemplateNotFound("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::MachineNotFound("m1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::SnapshotOwnership {
                snapshot_id: "m1-snap-1".into(),
                machine_id: "m2".into(),
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::MachineExists("m1".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_upstream_errors_map_to_500() {
        let err: Error = GatewayError::Api("boom".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("boom"));
        assert_eq!(
            Error::Connect("refused".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
