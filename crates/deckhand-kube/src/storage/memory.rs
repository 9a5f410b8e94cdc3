//! In-memory storage driver
//!
//! Keeps release records in process memory. Used by tests and by callers
//! that embed the engine without a persistent store.

use async_trait::async_trait;
use deckhand_core::Release;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::StorageDriver;
use crate::error::{KubeError, Result};

type Revisions = BTreeMap<u32, Release>;

/// In-memory storage driver
#[derive(Clone, Default)]
pub struct MemoryStorageDriver {
    /// (namespace, name) -> revision -> release
    store: Arc<RwLock<BTreeMap<(String, String), Revisions>>>,
    operations: Arc<RwLock<OperationCounts>>,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl MemoryStorageDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated releases
    pub fn with_releases(releases: Vec<Release>) -> Self {
        let driver = Self::new();
        if let Ok(mut store) = driver.store.write() {
            for release in releases {
                store
                    .entry((release.namespace.clone(), release.name.clone()))
                    .or_default()
                    .insert(release.revision, release);
            }
        }
        driver
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations
            .read()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    /// Count stored revisions across all releases
    pub fn release_count(&self) -> usize {
        self.store
            .read()
            .map(|store| store.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    fn count<F: FnOnce(&mut OperationCounts)>(&self, f: F) {
        if let Ok(mut ops) = self.operations.write() {
            f(&mut ops);
        }
    }

    fn poisoned<T>(e: std::sync::PoisonError<T>) -> KubeError {
        KubeError::Storage(format!("release store lock poisoned: {}", e))
    }

    fn not_found(namespace: &str, name: &str) -> KubeError {
        KubeError::ReleaseNotFound {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }
}

#[async_trait]
impl StorageDriver for MemoryStorageDriver {
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<Release> {
        self.count(|ops| ops.gets += 1);

        let store = self.store.read().map_err(Self::poisoned)?;
        store
            .get(&Self::key(namespace, name))
            .and_then(|revisions| revisions.get(&revision))
            .cloned()
            .ok_or_else(|| Self::not_found(namespace, name))
    }

    async fn get_latest(&self, namespace: &str, name: &str) -> Result<Release> {
        self.count(|ops| ops.gets += 1);

        let store = self.store.read().map_err(Self::poisoned)?;
        store
            .get(&Self::key(namespace, name))
            .and_then(|revisions| revisions.values().next_back())
            .cloned()
            .ok_or_else(|| Self::not_found(namespace, name))
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Release>> {
        self.count(|ops| ops.lists += 1);

        let store = self.store.read().map_err(Self::poisoned)?;
        Ok(store
            .get(&Self::key(namespace, name))
            .map(|revisions| revisions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, release: &Release) -> Result<()> {
        self.count(|ops| ops.creates += 1);

        let mut store = self.store.write().map_err(Self::poisoned)?;
        let revisions = store
            .entry(Self::key(&release.namespace, &release.name))
            .or_default();

        if revisions.contains_key(&release.revision) {
            return Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                revision: release.revision,
            });
        }

        revisions.insert(release.revision, release.clone());
        Ok(())
    }

    async fn update(&self, release: &Release) -> Result<()> {
        self.count(|ops| ops.updates += 1);

        let mut store = self.store.write().map_err(Self::poisoned)?;
        let revision = store
            .get_mut(&Self::key(&release.namespace, &release.name))
            .and_then(|revisions| revisions.get_mut(&release.revision))
            .ok_or_else(|| Self::not_found(&release.namespace, &release.name))?;

        *revision = release.clone();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<Release> {
        self.count(|ops| ops.deletes += 1);

        let mut store = self.store.write().map_err(Self::poisoned)?;
        store
            .get_mut(&Self::key(namespace, name))
            .and_then(|revisions| revisions.remove(&revision))
            .ok_or_else(|| Self::not_found(namespace, name))
    }
}
