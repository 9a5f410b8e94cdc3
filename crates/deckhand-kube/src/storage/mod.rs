//! Storage drivers for persisting release records
//!
//! The deploy engine only needs to read a release's history and to write
//! the record of the revision being deployed. How records are encoded and
//! where they live is up to the driver.

mod memory;

pub use memory::{MemoryStorageDriver, OperationCounts};

use async_trait::async_trait;
use deckhand_core::Release;

use crate::error::{KubeError, Result};

/// Storage driver trait for release persistence
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Get a specific revision of a release
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<Release>;

    /// Get the latest revision of a release
    async fn get_latest(&self, namespace: &str, name: &str) -> Result<Release>;

    /// All revisions of a release, oldest first
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Release>>;

    /// Store a new revision
    async fn create(&self, release: &Release) -> Result<()>;

    /// Overwrite an existing revision
    async fn update(&self, release: &Release) -> Result<()>;

    /// Delete a specific revision
    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<Release>;

    /// Check if a release exists
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.get_latest(namespace, name).await {
            Ok(_) => Ok(true),
            Err(KubeError::ReleaseNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
