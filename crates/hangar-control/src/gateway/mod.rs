// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster gateway abstraction.
//!
//! The control plane reaches the cluster only through [`ClusterGateway`].
//! Two implementations are provided:
//!
//! - [`KubeGateway`] - pods, claims and volume snapshots through the
//!   Kubernetes API
//! - [`MockGateway`] - in-memory state with scripted phases and failures

pub mod kube;
pub mod mock;
mod traits;

pub use kube::{KubeGateway, KubeGatewayConfig};
pub use mock::{MockGateway, MockOperation};
pub use traits::*;
