//! Plan operations and their lifecycle

use deckhand_core::{Release, ResourceId};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::stage::{MarkerPosition, Stage};
use crate::decision::TrackingParams;
use crate::error::{KubeError, Result};
use crate::resource::ResourceSpec;

/// Unique, deterministic id of an operation within a plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Broad class of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationCategory {
    /// Stage and group markers
    Meta,
    /// Cluster mutations
    Resource,
    /// Waiting and readiness tracking
    Track,
    /// Release record bookkeeping
    Release,
}

/// Lifecycle of an operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl OperationStatus {
    /// Pending -> Running -> {Completed, Failed, Canceled}; Pending -> Canceled
    pub fn can_transition_to(self, to: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// A write of one resource
#[derive(Debug, Clone)]
pub struct ResourceOp {
    pub resource: ResourceSpec,
    /// Namespace for manifests without one
    pub fallback_namespace: String,
    pub recreate_on_immutable: bool,
}

/// Deletion of one resource
#[derive(Debug, Clone)]
pub struct DeleteResourceOp {
    pub resource: ResourceId,
    pub fallback_namespace: String,
}

/// Wait for an out-of-release resource to exist
#[derive(Debug, Clone)]
pub struct WaitCreationOp {
    pub resource: ResourceId,
    /// Resource whose deploy is waiting
    pub dependent: ResourceId,
    pub fallback_namespace: String,
}

/// A resource tracked by a readiness operation
#[derive(Debug, Clone)]
pub struct TrackedResource {
    pub resource: ResourceId,
    pub params: TrackingParams,
}

/// Readiness tracking of a group of resources
#[derive(Debug, Clone)]
pub struct TrackReadinessOp {
    pub stage: Stage,
    pub weight: i64,
    /// Set when this op tracks a single resource outside the shared group op
    pub dedicated_to: Option<ResourceId>,
    pub resources: Vec<TrackedResource>,
    pub fallback_namespace: String,
}

/// Release record bookkeeping
#[derive(Debug, Clone)]
pub struct ReleaseOp {
    pub release: Release,
}

/// Boundary of a stage or weight group
#[derive(Debug, Clone, Copy)]
pub struct StageMarkerOp {
    pub stage: Stage,
    pub position: MarkerPosition,
}

/// A unit of work in a deploy plan
#[derive(Debug, Clone)]
pub enum Operation {
    CreateResource(ResourceOp),
    UpdateResource(ResourceOp),
    ApplyResource(ResourceOp),
    RecreateResource(ResourceOp),
    DeleteResource(DeleteResourceOp),
    WaitResourceCreation(WaitCreationOp),
    TrackResourcesReadiness(TrackReadinessOp),
    CreatePendingRelease(ReleaseOp),
    SucceedRelease(ReleaseOp),
    SupersedeRelease(ReleaseOp),
    FailRelease(ReleaseOp),
    StageMarker(StageMarkerOp),
}

impl Operation {
    pub fn marker(stage: Stage, position: MarkerPosition) -> Self {
        Self::StageMarker(StageMarkerOp { stage, position })
    }

    pub fn id(&self) -> OperationId {
        let id = match self {
            Self::CreateResource(op) => format!("create/{}", op.resource.id.key()),
            Self::UpdateResource(op) => format!("update/{}", op.resource.id.key()),
            Self::ApplyResource(op) => format!("apply/{}", op.resource.id.key()),
            Self::RecreateResource(op) => format!("recreate/{}", op.resource.id.key()),
            Self::DeleteResource(op) => format!("delete/{}", op.resource.key()),
            Self::WaitResourceCreation(op) => format!(
                "wait-creation/{}/for/{}",
                op.resource.key(),
                op.dependent.key()
            ),
            Self::TrackResourcesReadiness(op) => match &op.dedicated_to {
                Some(id) => format!("track-readiness/{}/{}/{}", op.stage, op.weight, id.key()),
                None => format!("track-readiness/{}/{}", op.stage, op.weight),
            },
            Self::CreatePendingRelease(op) => {
                format!("release/create-pending/{}:{}", op.release.name, op.release.revision)
            }
            Self::SucceedRelease(op) => {
                format!("release/succeed/{}:{}", op.release.name, op.release.revision)
            }
            Self::SupersedeRelease(op) => {
                format!("release/supersede/{}:{}", op.release.name, op.release.revision)
            }
            Self::FailRelease(op) => {
                format!("release/fail/{}:{}", op.release.name, op.release.revision)
            }
            Self::StageMarker(op) => format!("stage/{}/{}", op.stage, op.position),
        };
        OperationId(id)
    }

    pub fn category(&self) -> OperationCategory {
        match self {
            Self::CreateResource(_)
            | Self::UpdateResource(_)
            | Self::ApplyResource(_)
            | Self::RecreateResource(_)
            | Self::DeleteResource(_) => OperationCategory::Resource,
            Self::WaitResourceCreation(_) | Self::TrackResourcesReadiness(_) => {
                OperationCategory::Track
            }
            Self::CreatePendingRelease(_)
            | Self::SucceedRelease(_)
            | Self::SupersedeRelease(_)
            | Self::FailRelease(_) => OperationCategory::Release,
            Self::StageMarker(_) => OperationCategory::Meta,
        }
    }

    /// Human-readable description for logs and reports
    pub fn describe(&self) -> String {
        match self {
            Self::CreateResource(op) => format!("create {}", op.resource.id),
            Self::UpdateResource(op) => format!("update {}", op.resource.id),
            Self::ApplyResource(op) => format!("apply {}", op.resource.id),
            Self::RecreateResource(op) => format!("recreate {}", op.resource.id),
            Self::DeleteResource(op) => format!("delete {}", op.resource),
            Self::WaitResourceCreation(op) => {
                format!("wait for {} (needed by {})", op.resource, op.dependent.short())
            }
            Self::TrackResourcesReadiness(op) => {
                let names: Vec<String> = op.resources.iter().map(|r| r.resource.short()).collect();
                format!("track readiness of {}", names.join(", "))
            }
            Self::CreatePendingRelease(op) => format!("create pending release {}", op.release.human_id()),
            Self::SucceedRelease(op) => format!("succeed release {}", op.release.human_id()),
            Self::SupersedeRelease(op) => format!("supersede release {}", op.release.human_id()),
            Self::FailRelease(op) => format!("fail release {}", op.release.human_id()),
            Self::StageMarker(op) => format!("stage {} {}", op.stage, op.position),
        }
    }

    /// The resource this operation deploys, if it is a deploy operation
    pub fn deployed_resource(&self) -> Option<&ResourceSpec> {
        match self {
            Self::CreateResource(op)
            | Self::UpdateResource(op)
            | Self::ApplyResource(op)
            | Self::RecreateResource(op) => Some(&op.resource),
            _ => None,
        }
    }
}

/// An operation with its runtime state
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub operation: Operation,
    pub status: OperationStatus,
    /// Error message when Failed
    pub error: Option<String>,
}

impl PlanNode {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            status: OperationStatus::Pending,
            error: None,
        }
    }

    pub fn id(&self) -> OperationId {
        self.operation.id()
    }

    pub fn category(&self) -> OperationCategory {
        self.operation.category()
    }

    /// Move to a new status, rejecting illegal transitions
    pub fn transition(&mut self, to: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(KubeError::InvariantViolation(format!(
                "operation '{}' cannot move from {} to {}",
                self.id(),
                self.status,
                to
            )));
        }
        self.status = to;
        Ok(())
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.operation.id(), self.status)
    }
}
