//! Per-resource deployment decisions
//!
//! A `ResourceDecision` is what the deployability rules concluded about one
//! resource: which write to perform, whether to track readiness, whether
//! to clean it up afterwards, and what it depends on. The plan builder
//! consumes these without interpreting annotations itself.

use deckhand_core::ResourceId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resource::ResourceSpec;

/// The single write performed for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployAction {
    Create,
    Update,
    Apply,
    Recreate,
    /// Leave the resource alone (it may still be tracked or cleaned up)
    None,
}

/// When a hook runs relative to the main resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    Pre,
    Post,
}

/// What to do when a tracked resource exhausts its failure budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailMode {
    /// Fail the tracking operation and stop the deploy
    #[default]
    FailWholeDeployProcessImmediately,
    /// Drop the resource from tracking with a warning
    IgnoreAndContinueDeployProcess,
    /// Keep probing without holding up completion
    HopeUntilEndOfDeployProcess,
}

/// Whether a tracked resource holds its tracking operation open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationMode {
    #[default]
    WaitUntilResourceReady,
    NonBlocking,
}

/// Readiness tracking parameters for one resource
#[derive(Debug, Clone)]
pub struct TrackingParams {
    /// Failed probes tolerated before the fail mode applies
    pub failures_allowed: u32,
    pub fail_mode: FailMode,
    pub termination_mode: TerminationMode,
    /// Give up when the status message has not changed for this long
    pub no_activity_timeout: Option<Duration>,
    /// Only log status messages matching one of these
    pub log_include: Vec<Regex>,
    /// Never log status messages matching one of these
    pub log_exclude: Vec<Regex>,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            failures_allowed: 0,
            fail_mode: FailMode::default(),
            termination_mode: TerminationMode::default(),
            no_activity_timeout: None,
            log_include: Vec::new(),
            log_exclude: Vec::new(),
        }
    }
}

impl TrackingParams {
    pub fn with_failures_allowed(mut self, n: u32) -> Self {
        self.failures_allowed = n;
        self
    }

    pub fn with_fail_mode(mut self, mode: FailMode) -> Self {
        self.fail_mode = mode;
        self
    }

    pub fn with_termination_mode(mut self, mode: TerminationMode) -> Self {
        self.termination_mode = mode;
        self
    }

    pub fn with_no_activity_timeout(mut self, timeout: Duration) -> Self {
        self.no_activity_timeout = Some(timeout);
        self
    }

    /// Add include/exclude filters from regex sources
    pub fn with_log_filters(mut self, include: &[&str], exclude: &[&str]) -> crate::Result<Self> {
        for pattern in include {
            self.log_include.push(Regex::new(pattern)?);
        }
        for pattern in exclude {
            self.log_exclude.push(Regex::new(pattern)?);
        }
        Ok(self)
    }

    /// Check whether a status message passes the log filters
    pub fn should_log(&self, message: &str) -> bool {
        let included =
            self.log_include.is_empty() || self.log_include.iter().any(|r| r.is_match(message));
        included && !self.log_exclude.iter().any(|r| r.is_match(message))
    }
}

/// State a dependency must reach
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyState {
    /// Deployed
    #[default]
    Present,
    /// Deployed and tracked to readiness
    Ready,
}

/// Reference to another resource of the same release
///
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRef {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub state: DependencyState,
}

impl DependencyRef {
    /// Match a resource by kind and name
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn ready(mut self) -> Self {
        self.state = DependencyState::Ready;
        self
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn matches(&self, id: &ResourceId) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w == have)
        }

        self.name == id.name
            && field(&self.group, &id.group)
            && field(&self.version, &id.version)
            && field(&self.kind, &id.kind)
            && field(&self.namespace, id.namespace.as_deref().unwrap_or_default())
    }
}

/// A resource outside the release that must exist before deploying
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalDependency {
    pub resource: ResourceId,
}

impl ExternalDependency {
    pub fn new(resource: ResourceId) -> Self {
        Self { resource }
    }
}

/// Everything the planner needs to know about one resource
#[derive(Debug, Clone)]
pub struct ResourceDecision {
    pub resource: ResourceSpec,
    pub action: DeployAction,
    /// Delete the resource once the release is done with it
    pub cleanup: bool,
    pub track_readiness: bool,
    /// Ordering group within a stage, ascending
    pub weight: i64,
    /// `Some` for hooks
    pub hook: Option<HookPhase>,
    /// Dependencies inferred from the manifests
    pub auto_deps: Vec<DependencyRef>,
    /// Dependencies declared by the user
    pub manual_deps: Vec<DependencyRef>,
    pub external_deps: Vec<ExternalDependency>,
    pub tracking: TrackingParams,
    pub recreate_on_immutable: bool,
    /// UID of the live object, if it exists
    pub live_uid: Option<String>,
}

impl ResourceDecision {
    /// Decision with the given action and everything else off
    pub fn new(resource: ResourceSpec, action: DeployAction) -> Self {
        Self {
            resource,
            action,
            cleanup: false,
            track_readiness: false,
            weight: 0,
            hook: None,
            auto_deps: Vec::new(),
            manual_deps: Vec::new(),
            external_deps: Vec::new(),
            tracking: TrackingParams::default(),
            recreate_on_immutable: false,
            live_uid: None,
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.resource.id
    }

    pub fn is_hook(&self) -> bool {
        self.hook.is_some()
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_hook(mut self, phase: HookPhase) -> Self {
        self.hook = Some(phase);
        self
    }

    pub fn with_tracking(mut self, params: TrackingParams) -> Self {
        self.track_readiness = true;
        self.tracking = params;
        self
    }

    pub fn tracked(mut self) -> Self {
        self.track_readiness = true;
        self
    }

    pub fn with_cleanup(mut self) -> Self {
        self.cleanup = true;
        self
    }

    pub fn with_auto_dep(mut self, dep: DependencyRef) -> Self {
        self.auto_deps.push(dep);
        self
    }

    pub fn with_manual_dep(mut self, dep: DependencyRef) -> Self {
        self.manual_deps.push(dep);
        self
    }

    pub fn with_external_dep(mut self, resource: ResourceId) -> Self {
        self.external_deps.push(ExternalDependency::new(resource));
        self
    }

    pub fn with_recreate_on_immutable(mut self) -> Self {
        self.recreate_on_immutable = true;
        self
    }

    pub fn with_live_uid(mut self, uid: impl Into<String>) -> Self {
        self.live_uid = Some(uid.into());
        self
    }

    /// All internal dependencies, automatic first
    pub fn dependencies(&self) -> impl Iterator<Item = &DependencyRef> {
        self.auto_deps.iter().chain(self.manual_deps.iter())
    }
}
