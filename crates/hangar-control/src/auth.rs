// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API key authentication.
//!
//! Keys are configured as `key[:principal]` entries and kept only as SHA-256
//! digests. A request presents its key in the `X-API-Key` header or the
//! `api_key` query parameter; the matching principal is attached to the
//! request as a [`Principal`] extension.
//!
//! With no keys configured authentication is off and every request acts as
//! the `default` principal.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Error;
use crate::quota::DEFAULT_PRINCIPAL;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameter carrying the API key.
pub const API_KEY_QUERY: &str = "api_key";

/// Identity a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

impl Principal {
    /// Principal name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Principal {
    fn default() -> Self {
        Principal(DEFAULT_PRINCIPAL.to_string())
    }
}

/// Hex SHA-256 digest of an API key.
pub fn digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Configured API keys.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    principals: Arc<HashMap<String, String>>,
}

impl ApiKeys {
    /// Build from `key[:principal]` entries. Entries without a principal
    /// map to `default`.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        let principals = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                let (key, principal) = match entry.split_once(':') {
                    Some((key, principal)) if !principal.trim().is_empty() => {
                        (key.trim(), principal.trim())
                    }
                    Some((key, _)) => (key.trim(), DEFAULT_PRINCIPAL),
                    None => (entry, DEFAULT_PRINCIPAL),
                };
                (!key.is_empty()).then(|| (digest(key), principal.to_string()))
            })
            .collect();
        Self {
            principals: Arc::new(principals),
        }
    }

    /// Whether any key is configured.
    pub fn is_enabled(&self) -> bool {
        !self.principals.is_empty()
    }

    /// Principal for a presented key.
    pub fn principal_for(&self, key: &str) -> Option<Principal> {
        self.principals
            .get(&digest(key))
            .map(|principal| Principal(principal.clone()))
    }
}

fn presented_key(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(API_KEY_HEADER) {
        return value.to_str().ok().map(str::to_string);
    }
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(request.uri()).ok()?;
    params.remove(API_KEY_QUERY).filter(|key| !key.is_empty())
}

/// Middleware that resolves the request's principal or rejects it with 401.
pub async fn require_api_key(
    State(keys): State<ApiKeys>,
    mut request: Request,
    next: Next,
) -> Response {
    let principal = if keys.is_enabled() {
        let Some(key) = presented_key(&request) else {
            return Error::Unauthorized("missing API key".to_string()).into_response();
        };
        match keys.principal_for(&key) {
            Some(principal) => principal,
            None => {
                debug!(path = %request.uri().path(), "Rejected invalid API key");
                return Error::Unauthorized("invalid API key".to_string()).into_response();
            }
        }
    } else {
        Principal::default()
    };

    request.extensions_mut().insert(principal);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_map_to_principals() {
        let keys = ApiKeys::from_entries(&["k1:alice", "k2", " k3 : bob ", "k4:", ""]);
        assert!(keys.is_enabled());
        assert_eq!(keys.principal_for("k1"), Some(Principal("alice".to_string())));
        assert_eq!(keys.principal_for("k2"), Some(Principal::default()));
        assert_eq!(keys.principal_for("k3"), Some(Principal("bob".to_string())));
        assert_eq!(keys.principal_for("k4"), Some(Principal::default()));
        assert_eq!(keys.principal_for("nope"), None);
    }

    #[test]
    fn test_no_entries_disables_auth() {
        let keys = ApiKeys::from_entries::<&str>(&[]);
        assert!(!keys.is_enabled());
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        assert_eq!(
            digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_presented_key_sources() {
        let request = Request::builder()
            .uri("/machines?api_key=q1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request).as_deref(), Some("q1"));

        let request = Request::builder()
            .uri("/machines?api_key=q1")
            .header(API_KEY_HEADER, "h1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request).as_deref(), Some("h1"));
    }

    #[test]
    fn test_query_key_is_percent_decoded() {
        let request = Request::builder()
            .uri("/machines?follow=true&api_key=s3cr3t%2Fkey%2B1%3Aa")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request).as_deref(), Some("s3cr3t/key+1:a"));

        let request = Request::builder()
            .uri("/machines?api_key=")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request), None);
    }
}
