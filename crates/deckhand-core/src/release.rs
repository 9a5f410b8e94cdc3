//! Release records and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::resource::ResourceId;

/// A versioned set of resources deployed under one name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Release name
    pub name: String,

    /// Kubernetes namespace of the release
    pub namespace: String,

    /// Revision number (1-indexed, increments with each deploy)
    pub revision: u32,

    /// Current status
    pub status: ReleaseStatus,

    /// Resources belonging to this revision
    #[serde(default)]
    pub resources: Vec<ResourceId>,

    /// Notes rendered for this revision
    #[serde(default)]
    pub notes: Option<String>,

    /// Custom labels for filtering/querying
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Release {
    /// Create a new pending release
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, revision: u32) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            namespace: namespace.into(),
            revision,
            status: ReleaseStatus::Pending,
            resources: Vec::new(),
            notes: None,
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create the next revision after `previous`
    pub fn next_revision(previous: Option<&Release>, name: &str, namespace: &str) -> Self {
        let revision = previous.map(|r| r.revision + 1).unwrap_or(1);
        Self::new(name, namespace, revision)
    }

    /// Attach the resource list
    pub fn with_resources(mut self, resources: Vec<ResourceId>) -> Self {
        self.resources = resources;
        self
    }

    /// Attach release notes
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Human-readable identity, e.g. `web:3 (ns: prod)`
    pub fn human_id(&self) -> String {
        format!("{}:{} (ns: {})", self.name, self.revision, self.namespace)
    }

    /// Mark the release as deployed (pending -> deployed)
    pub fn mark_deployed(&mut self) -> Result<()> {
        self.transition(ReleaseStatus::Deployed)
    }

    /// Mark the release as failed (pending -> failed)
    pub fn mark_failed(&mut self) -> Result<()> {
        self.transition(ReleaseStatus::Failed)
    }

    /// Mark the release as superseded (deployed -> superseded)
    pub fn mark_superseded(&mut self) -> Result<()> {
        self.transition(ReleaseStatus::Superseded)
    }

    fn transition(&mut self, to: ReleaseStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                name: self.name.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Release status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    #[default]
    Pending,
    Deployed,
    Failed,
    Superseded,
}

impl ReleaseStatus {
    /// Allowed transitions: pending->deployed, pending->failed, deployed->superseded
    pub fn can_transition_to(self, to: ReleaseStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Deployed)
                | (Self::Pending, Self::Failed)
                | (Self::Deployed, Self::Superseded)
        )
    }

    /// Check if no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Superseded)
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
        };
        write!(f, "{}", s)
    }
}
