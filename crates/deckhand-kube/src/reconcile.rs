//! Reconciliation client for individual resources
//!
//! `ReconcileClient` is the only component that writes to the cluster. It
//! resolves each resource's kind (resetting discovery once on a miss),
//! fills in the namespace, runs the mutator pipeline and then performs a
//! forced Server-Side Apply under the `deckhand` field manager.
//!
//! Key features:
//! - Smart apply: dry-run first, compare against the live object and only
//!   write when something actually differs
//! - Recreate on immutable-field rejections when the caller allows it
//! - Batch variants that collect per-resource results

use deckhand_core::ResourceId;
use kube::{Client, api::DynamicObject};
use serde_json::Value;
use similar::TextDiff;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackend, KubeBackend};
use crate::error::{KubeError, Result};
use crate::mapper::{DiscoveryMapper, GvrResolver, ResolvedKind};
use crate::mutator::{MutationKind, MutatorPipeline};
use crate::resource::{ResourceSpec, gvk_of, type_meta_of};

/// What a write did to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
    RecreatedImmutable,
    SkippedUnsupportedResource,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::RecreatedImmutable => "recreated (immutable field)",
            Self::SkippedUnsupportedResource => "skipped (unsupported kind)",
        };
        write!(f, "{}", s)
    }
}

/// Result of writing a single resource
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Resource id with the namespace resolved
    pub id: ResourceId,
    /// What happened
    pub outcome: ApplyOutcome,
    /// Object returned by the apiserver (the dry-run result for dry runs)
    pub object: Option<DynamicObject>,
}

/// Result of deleting a single resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    /// Resource id with the namespace resolved
    pub id: ResourceId,
    /// False if the resource was already gone
    pub deleted: bool,
}

/// Result of reading a single resource
#[derive(Debug, Clone)]
pub struct GetResult {
    pub id: ResourceId,
    pub object: Option<DynamicObject>,
}

/// Per-resource results of a batch call
#[derive(Debug)]
pub struct BatchResult<T> {
    /// Successfully processed resources
    pub succeeded: Vec<T>,
    /// Failed resources with their errors
    pub failed: Vec<(ResourceId, KubeError)>,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchResult<T> {
    /// Check if all operations succeeded
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Get total count
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Turn into a `Result`, surfacing the first failure
    pub fn into_result(mut self) -> Result<Vec<T>> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            let (_, err) = self.failed.remove(0);
            Err(err)
        }
    }
}

/// Options for reads
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Namespace used when the manifest has none
    pub fallback_namespace: Option<String>,
}

/// Options for creates
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub fallback_namespace: Option<String>,
    /// Delete any existing object first and wait for it to disappear
    pub force_replace: bool,
    pub deletion_timeout: Duration,
    /// Report unresolvable kinds as skipped instead of failing
    pub skip_unsupported: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            fallback_namespace: None,
            force_replace: false,
            deletion_timeout: Duration::from_secs(300),
            skip_unsupported: false,
        }
    }
}

impl CreateOptions {
    pub fn with_fallback_namespace(mut self, ns: impl Into<String>) -> Self {
        self.fallback_namespace = Some(ns.into());
        self
    }

    pub fn with_force_replace(mut self) -> Self {
        self.force_replace = true;
        self
    }

    pub fn with_deletion_timeout(mut self, timeout: Duration) -> Self {
        self.deletion_timeout = timeout;
        self
    }

    pub fn with_skip_unsupported(mut self, skip: bool) -> Self {
        self.skip_unsupported = skip;
        self
    }
}

/// Options for updates and smart applies
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub fallback_namespace: Option<String>,
    /// Compute the outcome without writing
    pub dry_run: bool,
    /// Delete and recreate when the apiserver rejects an immutable field change
    pub recreate_on_immutable: bool,
    pub deletion_timeout: Duration,
    pub skip_unsupported: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            fallback_namespace: None,
            dry_run: false,
            recreate_on_immutable: false,
            deletion_timeout: Duration::from_secs(300),
            skip_unsupported: false,
        }
    }
}

impl ApplyOptions {
    pub fn with_fallback_namespace(mut self, ns: impl Into<String>) -> Self {
        self.fallback_namespace = Some(ns.into());
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_recreate_on_immutable(mut self, recreate: bool) -> Self {
        self.recreate_on_immutable = recreate;
        self
    }

    pub fn with_deletion_timeout(mut self, timeout: Duration) -> Self {
        self.deletion_timeout = timeout;
        self
    }

    pub fn with_skip_unsupported(mut self, skip: bool) -> Self {
        self.skip_unsupported = skip;
        self
    }
}

/// Options for deletes
#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub fallback_namespace: Option<String>,
    /// Wait until the object is gone
    pub wait: bool,
    pub deletion_timeout: Duration,
    /// Keep going after a failed delete
    pub continue_on_error: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            fallback_namespace: None,
            wait: true,
            deletion_timeout: Duration::from_secs(300),
            continue_on_error: false,
        }
    }
}

impl DeleteOptions {
    pub fn with_fallback_namespace(mut self, ns: impl Into<String>) -> Self {
        self.fallback_namespace = Some(ns.into());
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_deletion_timeout(mut self, timeout: Duration) -> Self {
        self.deletion_timeout = timeout;
        self
    }

    pub fn with_continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

/// A resolved write target
struct Target {
    id: ResourceId,
    kind: ResolvedKind,
    namespace: Option<String>,
}

/// Diff-aware client for creating, updating, applying and deleting resources
#[derive(Clone)]
pub struct ReconcileClient {
    resolver: GvrResolver,
    backend: Arc<dyn ClusterBackend>,
    mutators: MutatorPipeline,
    default_namespace: String,
    poll_interval: Duration,
}

impl ReconcileClient {
    /// Create a client from its collaborators
    pub fn new(
        resolver: GvrResolver,
        backend: Arc<dyn ClusterBackend>,
        mutators: MutatorPipeline,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            backend,
            mutators,
            default_namespace: default_namespace.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Create a client against a live cluster
    pub async fn connect(client: Client, mutators: MutatorPipeline) -> Result<Self> {
        let default_namespace = client.default_namespace().to_string();
        let mapper = DiscoveryMapper::new(client.clone()).await?;

        Ok(Self::new(
            GvrResolver::new(Arc::new(mapper)),
            Arc::new(KubeBackend::new(client)),
            mutators,
            default_namespace,
        ))
    }

    /// Interval between polls while waiting for deletions
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Namespace used when neither the manifest nor the caller provides one
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    async fn target(&self, id: &ResourceId, fallback: Option<&str>) -> Result<Target> {
        let kind = self.resolver.resolve(&gvk_of(id)).await?;
        Ok(self.place(id, kind, fallback))
    }

    fn place(&self, id: &ResourceId, kind: ResolvedKind, fallback: Option<&str>) -> Target {
        let namespace = id.resolve_namespace(kind.namespaced, fallback, &self.default_namespace);

        let mut id = id.clone();
        id.namespace = namespace.clone();

        Target {
            id,
            kind,
            namespace,
        }
    }

    /// Desired object with identity fields filled and mutators applied
    fn prepare(
        &self,
        spec: &ResourceSpec,
        target: &Target,
        kind: MutationKind,
    ) -> Result<DynamicObject> {
        let mut object = spec.object.clone();
        object.types = Some(type_meta_of(&target.id));
        object.metadata.name = Some(target.id.name.clone());
        object.metadata.namespace = target.namespace.clone();

        self.mutators.run(&object, &target.id, kind)
    }

    fn skipped(spec: &ResourceSpec) -> ApplyResult {
        warn!(resource = %spec.id, "skipping resource of unsupported kind");
        ApplyResult {
            id: spec.id.clone(),
            outcome: ApplyOutcome::SkippedUnsupportedResource,
            object: None,
        }
    }

    /// Fetch a single resource, `None` if it or its kind does not exist
    pub async fn get_one(
        &self,
        id: &ResourceId,
        opts: &GetOptions,
    ) -> Result<Option<DynamicObject>> {
        let Some(kind) = self.resolver.resolve_for_read(&gvk_of(id)).await? else {
            return Ok(None);
        };
        let target = self.place(id, kind, opts.fallback_namespace.as_deref());

        self.backend
            .get(&target.kind, target.namespace.as_deref(), &target.id.name)
            .await
    }

    /// Create a single resource
    pub async fn create_one(
        &self,
        spec: &ResourceSpec,
        opts: &CreateOptions,
    ) -> Result<ApplyResult> {
        let target = match self
            .target(&spec.id, opts.fallback_namespace.as_deref())
            .await
        {
            Ok(target) => target,
            Err(KubeError::UnresolvedKind { .. }) if opts.skip_unsupported => {
                return Ok(Self::skipped(spec));
            }
            Err(e) => return Err(e),
        };

        if opts.force_replace {
            self.delete_and_wait(&target, opts.deletion_timeout).await?;
        }

        let object = self.prepare(spec, &target, MutationKind::Create)?;
        let applied = self
            .backend
            .apply(&target.kind, target.namespace.as_deref(), &object, false)
            .await?;

        info!(resource = %target.id, "created");
        Ok(ApplyResult {
            id: target.id,
            outcome: ApplyOutcome::Created,
            object: Some(applied),
        })
    }

    /// Update a single resource, recreating it on immutable-field errors if allowed
    pub async fn update_one(
        &self,
        spec: &ResourceSpec,
        opts: &ApplyOptions,
    ) -> Result<ApplyResult> {
        let target = match self
            .target(&spec.id, opts.fallback_namespace.as_deref())
            .await
        {
            Ok(target) => target,
            Err(KubeError::UnresolvedKind { .. }) if opts.skip_unsupported => {
                return Ok(Self::skipped(spec));
            }
            Err(e) => return Err(e),
        };

        let object = self.prepare(spec, &target, MutationKind::Update)?;
        let ns = target.namespace.as_deref();

        match self
            .backend
            .apply(&target.kind, ns, &object, opts.dry_run)
            .await
        {
            Ok(applied) => {
                info!(resource = %target.id, "updated");
                Ok(ApplyResult {
                    id: target.id,
                    outcome: ApplyOutcome::Updated,
                    object: Some(applied),
                })
            }
            Err(e) if e.is_immutable() && opts.recreate_on_immutable => {
                if opts.dry_run {
                    return Ok(ApplyResult {
                        id: target.id,
                        outcome: ApplyOutcome::RecreatedImmutable,
                        object: None,
                    });
                }
                let applied = self.recreate(&target, &object, opts.deletion_timeout).await?;
                Ok(ApplyResult {
                    id: target.id,
                    outcome: ApplyOutcome::RecreatedImmutable,
                    object: Some(applied),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a single resource, writing only when the live object differs
    pub async fn smart_apply_one(
        &self,
        spec: &ResourceSpec,
        opts: &ApplyOptions,
    ) -> Result<ApplyResult> {
        let target = match self
            .target(&spec.id, opts.fallback_namespace.as_deref())
            .await
        {
            Ok(target) => target,
            Err(KubeError::UnresolvedKind { .. }) if opts.skip_unsupported => {
                return Ok(Self::skipped(spec));
            }
            Err(e) => return Err(e),
        };

        let object = self.prepare(spec, &target, MutationKind::Apply)?;
        let ns = target.namespace.as_deref();

        let dry_run = match self.backend.apply(&target.kind, ns, &object, true).await {
            Ok(result) => Some(result),
            Err(e) if e.is_immutable() && opts.recreate_on_immutable => {
                debug!(resource = %target.id, "immutable field changed, will recreate");
                None
            }
            Err(e) => return Err(e),
        };

        let live = self.backend.get(&target.kind, ns, &target.id.name).await?;

        let outcome = match (&live, &dry_run) {
            (None, _) => ApplyOutcome::Created,
            (Some(_), None) => ApplyOutcome::RecreatedImmutable,
            (Some(live), Some(dry)) if differs(live, dry)? => {
                debug!(
                    resource = %target.id,
                    diff = %render_diff(live, dry)?,
                    "live object differs from desired"
                );
                ApplyOutcome::Updated
            }
            (Some(_), Some(_)) => ApplyOutcome::Unchanged,
        };

        if opts.dry_run {
            return Ok(ApplyResult {
                id: target.id,
                outcome,
                object: dry_run,
            });
        }

        let written = match outcome {
            ApplyOutcome::RecreatedImmutable => {
                Some(self.recreate(&target, &object, opts.deletion_timeout).await?)
            }
            ApplyOutcome::Created | ApplyOutcome::Updated => Some(
                self.backend
                    .apply(&target.kind, ns, &object, false)
                    .await?,
            ),
            _ => live,
        };

        info!(resource = %target.id, outcome = %outcome, "applied");
        Ok(ApplyResult {
            id: target.id,
            outcome,
            object: written,
        })
    }

    /// Delete a single resource; a missing resource or kind is not an error
    pub async fn delete_one(&self, id: &ResourceId, opts: &DeleteOptions) -> Result<DeleteResult> {
        let target = match self.target(id, opts.fallback_namespace.as_deref()).await {
            Ok(target) => target,
            Err(KubeError::UnresolvedKind { .. }) => {
                return Ok(DeleteResult {
                    id: id.clone(),
                    deleted: false,
                });
            }
            Err(e) => return Err(e),
        };

        let ns = target.namespace.as_deref();
        let deleted = self.backend.delete(&target.kind, ns, &target.id.name).await?;

        if deleted && opts.wait {
            self.wait_for_deletion(&target, opts.deletion_timeout).await?;
        }

        if deleted {
            info!(resource = %target.id, "deleted");
        } else {
            debug!(resource = %target.id, "already absent");
        }

        Ok(DeleteResult {
            id: target.id,
            deleted,
        })
    }

    /// Fetch several resources
    pub async fn get(&self, ids: &[ResourceId], opts: &GetOptions) -> BatchResult<GetResult> {
        let mut batch = BatchResult::default();
        for id in ids {
            match self.get_one(id, opts).await {
                Ok(object) => batch.succeeded.push(GetResult {
                    id: id.clone(),
                    object,
                }),
                Err(e) => {
                    batch.failed.push((id.clone(), e));
                    break;
                }
            }
        }
        batch
    }

    /// Create several resources, stopping at the first error
    pub async fn create(
        &self,
        specs: &[ResourceSpec],
        opts: &CreateOptions,
    ) -> BatchResult<ApplyResult> {
        let mut batch = BatchResult::default();
        for spec in specs {
            match self.create_one(spec, opts).await {
                Ok(result) => batch.succeeded.push(result),
                Err(e) => {
                    batch.failed.push((spec.id.clone(), e));
                    break;
                }
            }
        }
        batch
    }

    /// Update several resources, stopping at the first error
    pub async fn update(
        &self,
        specs: &[ResourceSpec],
        opts: &ApplyOptions,
    ) -> BatchResult<ApplyResult> {
        let mut batch = BatchResult::default();
        for spec in specs {
            match self.update_one(spec, opts).await {
                Ok(result) => batch.succeeded.push(result),
                Err(e) => {
                    batch.failed.push((spec.id.clone(), e));
                    break;
                }
            }
        }
        batch
    }

    /// Smart-apply several resources, stopping at the first error
    pub async fn smart_apply(
        &self,
        specs: &[ResourceSpec],
        opts: &ApplyOptions,
    ) -> BatchResult<ApplyResult> {
        let mut batch = BatchResult::default();
        for spec in specs {
            match self.smart_apply_one(spec, opts).await {
                Ok(result) => batch.succeeded.push(result),
                Err(e) => {
                    batch.failed.push((spec.id.clone(), e));
                    break;
                }
            }
        }
        batch
    }

    /// Delete several resources
    pub async fn delete(
        &self,
        ids: &[ResourceId],
        opts: &DeleteOptions,
    ) -> BatchResult<DeleteResult> {
        let mut batch = BatchResult::default();
        for id in ids {
            match self.delete_one(id, opts).await {
                Ok(result) => batch.succeeded.push(result),
                Err(e) => {
                    warn!(resource = %id, error = %e, "delete failed");
                    batch.failed.push((id.clone(), e));
                    if !opts.continue_on_error {
                        break;
                    }
                }
            }
        }
        batch
    }

    async fn recreate(
        &self,
        target: &Target,
        object: &DynamicObject,
        timeout: Duration,
    ) -> Result<DynamicObject> {
        info!(resource = %target.id, "recreating resource with changed immutable field");
        self.delete_and_wait(target, timeout).await?;
        self.backend
            .apply(&target.kind, target.namespace.as_deref(), object, false)
            .await
    }

    async fn delete_and_wait(&self, target: &Target, timeout: Duration) -> Result<()> {
        let deleted = self
            .backend
            .delete(&target.kind, target.namespace.as_deref(), &target.id.name)
            .await?;
        if deleted {
            self.wait_for_deletion(target, timeout).await?;
        }
        Ok(())
    }

    async fn wait_for_deletion(&self, target: &Target, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            let live = self
                .backend
                .get(&target.kind, target.namespace.as_deref(), &target.id.name)
                .await?;
            if live.is_none() {
                return Ok(());
            }

            if start.elapsed() >= timeout {
                return Err(KubeError::Timeout(format!(
                    "{:?} waiting for deletion of {}",
                    timeout, target.id
                )));
            }

            sleep(self.poll_interval).await;
        }
    }
}

/// Object as JSON with the most recent managed-fields timestamp removed
fn normalized(object: &DynamicObject) -> Result<Value> {
    let mut value = serde_json::to_value(object)?;

    if let Some(entries) = value
        .pointer_mut("/metadata/managedFields")
        .and_then(Value::as_array_mut)
    {
        let latest = entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.get("time").and_then(Value::as_str).map(|t| (i, t)))
            .max_by(|a, b| a.1.cmp(b.1))
            .map(|(i, _)| i);

        if let Some(entry) = latest.and_then(|i| entries.get_mut(i)) {
            if let Some(map) = entry.as_object_mut() {
                map.remove("time");
            }
        }
    }

    Ok(value)
}

/// Structural comparison ignoring only the latest managed-fields timestamp
pub fn differs(live: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    Ok(normalized(live)? != normalized(desired)?)
}

/// Unified YAML diff between a live object and its desired state
pub fn render_diff(live: &DynamicObject, desired: &DynamicObject) -> Result<String> {
    let old = serde_yaml::to_string(&normalized(live)?)?;
    let new = serde_yaml::to_string(&normalized(desired)?)?;

    Ok(TextDiff::from_lines(&old, &new)
        .unified_diff()
        .context_radius(3)
        .header("live", "desired")
        .to_string())
}
