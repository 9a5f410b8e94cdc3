//! Loaded release history

use deckhand_core::{Release, ReleaseStatus};

use crate::error::Result;
use crate::storage::StorageDriver;

/// All stored revisions of one release, oldest first
#[derive(Debug, Clone, Default)]
pub struct ReleaseHistory {
    name: String,
    namespace: String,
    releases: Vec<Release>,
}

impl ReleaseHistory {
    /// Load the history of a release; an unknown release has an empty history
    pub async fn load(storage: &dyn StorageDriver, name: &str, namespace: &str) -> Result<Self> {
        let mut releases = storage.history(namespace, name).await?;
        releases.sort_by_key(|r| r.revision);

        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            releases,
        })
    }

    /// Build a history from already loaded releases
    pub fn from_releases(name: &str, namespace: &str, mut releases: Vec<Release>) -> Self {
        releases.sort_by_key(|r| r.revision);
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            releases,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    /// Most recent revision, whatever its status
    pub fn last_release(&self) -> Option<&Release> {
        self.releases.last()
    }

    /// Most recent successfully deployed revision
    pub fn last_deployed_release(&self) -> Option<&Release> {
        self.releases
            .iter()
            .rev()
            .find(|r| r.status == ReleaseStatus::Deployed)
    }

    /// Next revision to deploy
    pub fn next_release(&self) -> Release {
        Release::next_revision(self.last_release(), &self.name, &self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageDriver;

    fn release(revision: u32, status: ReleaseStatus) -> Release {
        let mut release = Release::new("web", "prod", revision);
        release.status = status;
        release
    }

    #[tokio::test]
    async fn test_empty_history() {
        let storage = MemoryStorageDriver::new();
        let history = ReleaseHistory::load(&storage, "web", "prod").await.unwrap();

        assert!(history.is_empty());
        assert!(history.last_release().is_none());
        assert!(history.last_deployed_release().is_none());
        assert_eq!(history.next_release().revision, 1);
    }

    #[tokio::test]
    async fn test_last_deployed_skips_failed() {
        let storage = MemoryStorageDriver::with_releases(vec![
            release(1, ReleaseStatus::Superseded),
            release(2, ReleaseStatus::Deployed),
            release(3, ReleaseStatus::Failed),
        ]);
        let history = ReleaseHistory::load(&storage, "web", "prod").await.unwrap();

        assert_eq!(history.last_release().unwrap().revision, 3);
        assert_eq!(history.last_deployed_release().unwrap().revision, 2);
        assert_eq!(history.next_release().revision, 4);
    }
}
