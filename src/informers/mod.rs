// Copyright 2024 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Read-only informer caches consumed by admission plugins.
//!
//! The caches are filled and kept up to date by watch loops owned by the host
//! process. Plugins only ever read committed snapshots through the lister
//! traits below, and wait on [`SyncState`] for the initial list to complete.

use crate::api::core::{object_key, Object, Secret};
use crate::api::garden::{Quota, SecretBinding, Shoot};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

/// SyncState reports whether an informer completed its initial sync.
#[derive(Debug, Clone)]
pub struct SyncState {
    synced: watch::Receiver<bool>,
}

impl SyncState {
    /// Returns true once the initial sync completed.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits until the informer has synced. Returns false if the informer was
    /// dropped before it ever synced.
    pub async fn wait_synced(&self) -> bool {
        let mut synced = self.synced.clone();
        let synced_ok = synced.wait_for(|synced| *synced).await.is_ok();
        synced_ok
    }
}

/// Informer is an in-memory, eventually consistent cache of objects keyed by
/// `namespace/name`.
#[derive(Debug)]
pub struct Informer<T> {
    items: RwLock<BTreeMap<String, T>>,
    synced: watch::Sender<bool>,
}

impl<T: Object + Clone> Informer<T> {
    /// Create an empty informer that has not synced yet.
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            items: RwLock::new(BTreeMap::new()),
            synced,
        }
    }

    /// Create an informer holding `items` that has already synced.
    pub fn synced_with(items: Vec<T>) -> Self {
        let informer = Self::new();
        informer.replace(items);
        informer
    }

    /// Replace the whole cache content and mark the informer as synced, the
    /// way an initial list does.
    pub fn replace(&self, items: Vec<T>) {
        let items = items.into_iter().map(|item| (item.key(), item)).collect();
        *self.items.write().unwrap_or_else(PoisonError::into_inner) = items;
        self.mark_synced();
    }

    /// Add or update a single object.
    pub fn add(&self, item: T) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.key(), item);
    }

    /// Remove a single object.
    pub fn delete(&self, namespace: &str, name: &str) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&object_key(namespace, name));
    }

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState {
            synced: self.synced.subscribe(),
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<T> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&object_key(namespace, name))
            .cloned()
    }

    /// Snapshot of every object for which `predicate` holds, in key order.
    pub fn list_matching(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }
}

impl<T: Object + Clone> Default for Informer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lister over secrets.
pub trait SecretLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Secret>;

    /// Secrets carrying the label `key=value`, in namespace/name order.
    fn list_by_label(&self, key: &str, value: &str) -> Vec<Secret>;

    fn sync_state(&self) -> SyncState;
}

/// Lister over secret bindings.
pub trait SecretBindingLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<SecretBinding>;

    fn sync_state(&self) -> SyncState;
}

/// Lister over quotas.
pub trait QuotaLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Quota>;

    fn sync_state(&self) -> SyncState;
}

/// Lister over already admitted shoots.
pub trait ShootLister: Send + Sync {
    fn list(&self) -> Vec<Shoot>;

    fn sync_state(&self) -> SyncState;
}

impl SecretLister for Informer<Secret> {
    fn get(&self, namespace: &str, name: &str) -> Option<Secret> {
        Informer::get(self, namespace, name)
    }

    fn list_by_label(&self, key: &str, value: &str) -> Vec<Secret> {
        self.list_matching(|secret| {
            secret.metadata.labels.get(key).map(String::as_str) == Some(value)
        })
    }

    fn sync_state(&self) -> SyncState {
        Informer::sync_state(self)
    }
}

impl SecretBindingLister for Informer<SecretBinding> {
    fn get(&self, namespace: &str, name: &str) -> Option<SecretBinding> {
        Informer::get(self, namespace, name)
    }

    fn sync_state(&self) -> SyncState {
        Informer::sync_state(self)
    }
}

impl QuotaLister for Informer<Quota> {
    fn get(&self, namespace: &str, name: &str) -> Option<Quota> {
        Informer::get(self, namespace, name)
    }

    fn sync_state(&self) -> SyncState {
        Informer::sync_state(self)
    }
}

impl ShootLister for Informer<Shoot> {
    fn list(&self) -> Vec<Shoot> {
        self.list_matching(|_| true)
    }

    fn sync_state(&self) -> SyncState {
        Informer::sync_state(self)
    }
}

/// SharedInformers bundles the caches handed to plugin factories.
#[derive(Debug, Clone, Default)]
pub struct SharedInformers {
    pub secrets: Arc<Informer<Secret>>,
    pub secret_bindings: Arc<Informer<SecretBinding>>,
    pub quotas: Arc<Informer<Quota>>,
    pub shoots: Arc<Informer<Shoot>>,
}

impl SharedInformers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Informers that report synced with no content; handy for tests.
    pub fn synced() -> Self {
        let informers = Self::new();
        informers.secrets.mark_synced();
        informers.secret_bindings.mark_synced();
        informers.quotas.mark_synced();
        informers.shoots.mark_synced();
        informers
    }
}
