// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Control - Machine Control Plane
//!
//! This crate manages long-lived "machines": single-container pods with an
//! optional data volume, created from templates and owned by API key
//! principals. It supervises their health, tunnels raw protocol traffic
//! into them, and snapshots and restores their data volumes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         HTTP Clients                                     │
//! │              (VNC viewers, RTMP encoders, CDP clients)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    hangar-control (This Crate)                           │
//! │                         Port 8080                                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Health    │  │  Protocol   │  │  Snapshot   │  │    Quota    │     │
//! │  │  Monitor    │  │   Tunnel    │  │  Manager    │  │  Enforcer   │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼ ClusterGateway
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                         Kubernetes API                                 │
//! │            (Pods, PersistentVolumeClaims, VolumeSnapshots)             │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # HTTP API
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /machines` | Create a machine |
//! | `GET /machines` | List machines |
//! | `GET, DELETE /machines/{id}` | Get or delete a machine |
//! | `GET /machines/{id}/connect?protocol=` | Tunnel `vnc`, `rtmp` or `cdp` |
//! | `POST /machines/{id}/exec` | Run a command |
//! | `GET /machines/{id}/logs` | Read or follow logs |
//! | `GET /machines/{id}/health` | Health of one machine (public) |
//! | `GET /health` | Health of every machine (public) |
//! | `GET, POST /machines/{id}/snapshots` | List or create snapshots |
//! | `DELETE /machines/{id}/snapshots/{sid}` | Delete a snapshot |
//! | `POST /machines/{id}/snapshots/{sid}/restore` | Restore a snapshot |
//! | `/quotas`, `/quotas/{userId}` | Quota administration |
//! | `/templates`, `/templates/{name}` | Template administration |
//! | `GET /version` | Version and uptime (public) |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HANGAR_PORT` | No | `8080` | HTTP server port |
//! | `HANGAR_NAMESPACE` | No | `hangar` | Namespace holding machines |
//! | `HANGAR_SERVICE_DOMAIN` | No | `hangar-machines` | Headless service for pod DNS |
//! | `HANGAR_STORAGE_CLASS` | No | cluster default | Storage class for data claims |
//! | `HANGAR_SNAPSHOT_CLASS` | No | cluster default | Volume snapshot class |
//! | `HANGAR_API_KEYS` | No | - | Comma separated `key[:principal]` entries |
//! | `HANGAR_HEALTH_INTERVAL_SECS` | No | `30` | Health supervisor tick |
//! | `HANGAR_TUNNEL_CONNECT_TIMEOUT_SECS` | No | `60` | Tunnel connect timeout |

#![deny(missing_docs)]

/// API key authentication.
pub mod auth;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types for control plane operations.
pub mod error;

/// Cluster access: Kubernetes and in-memory implementations.
pub mod gateway;

/// HTTP request handlers.
pub mod handlers;

/// Health supervision and bounded recovery.
pub mod health_monitor;

/// Machine identifiers, resources and views.
pub mod machine;

/// Per-principal quotas.
pub mod quota;

/// Delete-and-recreate recovery of a machine's workload.
pub mod recovery;

/// Embeddable runtime for hangar-control.
pub mod runtime;

/// HTTP server and router.
pub mod server;

/// Data volume snapshots.
pub mod snapshot_manager;

/// In-memory keyed stores.
pub mod store;

/// Machine templates.
pub mod templates;

/// Raw protocol tunnels into machines.
pub mod tunnel;

pub use config::Config;
pub use error::Error;
