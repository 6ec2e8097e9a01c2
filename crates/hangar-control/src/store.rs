// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory keyed store.
//!
//! Health records, quotas and templates are read far more often than they are
//! written, so they live behind a readers-writer lock. Stores are owned values
//! handed to the components that need them; nothing here is global.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cloneable handle to a shared map.
#[derive(Debug)]
pub struct Store<K, V> {
    inner: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for Store<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entries.into_iter().collect())),
        }
    }

    /// Get a copy of the value for `key`.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.read().await.get(key).cloned()
    }

    /// Insert or replace the value for `key`.
    pub async fn set(&self, key: K, value: V) {
        self.inner.write().await.insert(key, value);
    }

    /// Remove `key`, returning the old value.
    pub async fn delete(&self, key: &K) -> Option<V> {
        self.inner.write().await.remove(key)
    }

    /// Copies of every value.
    pub async fn list(&self) -> Vec<V> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Apply `f` to the entry for `key` under the write lock, inserting
    /// `V::default()` first when absent. Returns the updated value.
    pub async fn update<F>(&self, key: K, f: F) -> V
    where
        V: Default,
        F: FnOnce(&mut V),
    {
        let mut guard = self.inner.write().await;
        let entry = guard.entry(key).or_default();
        f(entry);
        entry.clone()
    }

    /// Apply `f` to the entry for `key` only if it exists.
    pub async fn modify<F>(&self, key: &K, f: F) -> Option<V>
    where
        F: FnOnce(&mut V),
    {
        let mut guard = self.inner.write().await;
        let entry = guard.get_mut(key)?;
        f(entry);
        Some(entry.clone())
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
