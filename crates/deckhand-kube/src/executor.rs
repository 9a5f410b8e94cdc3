//! Concurrent execution of deploy plans
//!
//! The executor walks the plan graph: an operation becomes eligible once
//! every one of its dependencies has Completed. Eligible operations run on
//! tokio tasks. A shared semaphore bounds concurrent cluster I/O, both for
//! mutations and for readiness polling.
//!
//! When an operation fails, everything reachable from it is Canceled while
//! independent branches keep going. A deploy-wide deadline aborts whatever
//! is still running.

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::DeployConfig;
use crate::error::{KubeError, Result};
use crate::plan::{
    DeleteResourceOp, Operation, OperationId, OperationStatus, Plan, ReleaseOp, ResourceOp,
    WaitCreationOp,
};
use crate::readiness::ReadinessProbe;
use crate::reconcile::{ApplyOptions, CreateOptions, DeleteOptions, GetOptions, ReconcileClient};
use crate::storage::StorageDriver;
use crate::tracking;

/// Shared collaborators of every running operation
pub struct ExecutionContext {
    pub client: Arc<ReconcileClient>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub storage: Arc<dyn StorageDriver>,
    pub config: DeployConfig,
    slots: Semaphore,
}

impl ExecutionContext {
    pub fn new(
        client: ReconcileClient,
        probe: Arc<dyn ReadinessProbe>,
        storage: Arc<dyn StorageDriver>,
        config: DeployConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client: Arc::new(client.with_poll_interval(config.poll_interval)),
            probe,
            storage,
            slots: Semaphore::new(config.parallelism),
            config,
        })
    }

    /// Wait for a free worker slot; the slot is released on drop
    pub(crate) async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        self.slots
            .acquire()
            .await
            .map_err(|_| KubeError::InvariantViolation("worker pool is closed".to_string()))
    }

    /// Worker slots not currently held
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

type TaskOutcome = (OperationId, Result<()>);

/// Runs a plan to completion, failure or deadline
pub struct PlanExecutor {
    ctx: Arc<ExecutionContext>,
}

impl PlanExecutor {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Execute every operation of the plan
    ///
    /// Per-operation status is recorded on the plan. The returned error
    /// aggregates every failure, including a missed deadline.
    pub async fn execute(&self, plan: &mut Plan) -> Result<()> {
        let deadline = Instant::now() + self.ctx.config.deploy_timeout;
        let order = plan.topological_order()?;

        let mut waiting_on: HashMap<OperationId, usize> = HashMap::with_capacity(order.len());
        let mut ready = VecDeque::new();
        for id in &order {
            let count = plan.dependencies(id)?.len();
            if count == 0 {
                ready.push_back(id.clone());
            }
            waiting_on.insert(id.clone(), count);
        }

        info!(operations = plan.len(), parallelism = self.ctx.config.parallelism, "executing plan");

        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running: Vec<OperationId> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut halted = false;
        let mut timed_out = false;

        loop {
            if !halted {
                while let Some(id) = ready.pop_front() {
                    self.dispatch(plan, &id, &mut tasks)?;
                    running.push(id);
                }
            }

            if tasks.is_empty() {
                break;
            }

            let (id, outcome) = match timeout_at(deadline, tasks.join_next()).await {
                Err(_) => {
                    timed_out = true;
                    tasks.abort_all();
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok(done))) => done,
                Ok(Some(Err(e))) => {
                    tasks.abort_all();
                    return Err(KubeError::InvariantViolation(format!(
                        "operation task was lost: {}",
                        e
                    )));
                }
            };
            running.retain(|r| r != &id);

            match outcome {
                Ok(()) => {
                    plan.set_status(&id, OperationStatus::Completed)?;
                    debug!(operation = %id, "operation completed");

                    for dependent in plan.dependents(&id)? {
                        if let Some(count) = waiting_on.get_mut(&dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 && is_pending(plan, &dependent) {
                                ready.push_back(dependent);
                            }
                        }
                    }
                }
                Err(e) => {
                    let description = plan
                        .get(&id)
                        .map(|n| n.operation.describe())
                        .unwrap_or_else(|| id.to_string());
                    error!(operation = %id, error = %e, "operation failed");
                    failures.push(format!("{}: {}", description, e));

                    if matches!(e, KubeError::ReadinessFailed { .. }) && !halted {
                        warn!("readiness failure stops the deploy, no new operations will start");
                        halted = true;
                    }
                    plan.set_failed(&id, e.to_string())?;
                    self.cancel_descendants(plan, &id)?;
                }
            }
        }

        if timed_out {
            warn!(
                timeout = ?self.ctx.config.deploy_timeout,
                in_flight = running.len(),
                "deploy deadline reached, canceling remaining operations"
            );
            failures.push(format!(
                "deploy timed out after {:?}",
                self.ctx.config.deploy_timeout
            ));
            for id in running.drain(..) {
                plan.set_status(&id, OperationStatus::Canceled)?;
            }
        }

        let leftover: Vec<OperationId> = order
            .into_iter()
            .filter(|id| is_pending(plan, id))
            .collect();
        for id in &leftover {
            plan.set_status(id, OperationStatus::Canceled)?;
        }

        if failures.is_empty() {
            info!("plan executed successfully");
            Ok(())
        } else {
            Err(KubeError::Execution { failures })
        }
    }

    fn dispatch(
        &self,
        plan: &mut Plan,
        id: &OperationId,
        tasks: &mut JoinSet<TaskOutcome>,
    ) -> Result<()> {
        let operation = plan
            .get(id)
            .map(|n| n.operation.clone())
            .ok_or_else(|| KubeError::OperationNotFound(id.to_string()))?;
        plan.set_status(id, OperationStatus::Running)?;

        let ctx = Arc::clone(&self.ctx);
        let task_id = id.clone();
        let span = info_span!("operation", id = %id);

        tasks.spawn(
            async move {
                let result = AssertUnwindSafe(run(&operation, &ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(KubeError::InvariantViolation(format!(
                            "operation '{}' panicked",
                            task_id
                        )))
                    });
                (task_id, result)
            }
            .instrument(span),
        );
        Ok(())
    }

    fn cancel_descendants(&self, plan: &mut Plan, id: &OperationId) -> Result<()> {
        for descendant in plan.descendants(id)? {
            if is_pending(plan, &descendant) {
                plan.set_status(&descendant, OperationStatus::Canceled)?;
                debug!(operation = %descendant, cause = %id, "operation canceled");
            }
        }
        Ok(())
    }
}

fn is_pending(plan: &Plan, id: &OperationId) -> bool {
    plan.get(id)
        .is_some_and(|n| n.status == OperationStatus::Pending)
}

async fn run(operation: &Operation, ctx: &ExecutionContext) -> Result<()> {
    match operation {
        Operation::StageMarker(_) => Ok(()),
        Operation::CreateResource(op) => create(op, ctx, false).await,
        Operation::RecreateResource(op) => create(op, ctx, true).await,
        Operation::UpdateResource(op) => {
            let _slot = ctx.acquire_slot().await?;
            let result = ctx.client.update_one(&op.resource, &apply_options(op, ctx)).await?;
            info!(resource = %result.id, outcome = %result.outcome, "resource updated");
            Ok(())
        }
        Operation::ApplyResource(op) => {
            let _slot = ctx.acquire_slot().await?;
            let result = ctx
                .client
                .smart_apply_one(&op.resource, &apply_options(op, ctx))
                .await?;
            info!(resource = %result.id, outcome = %result.outcome, "resource applied");
            Ok(())
        }
        Operation::DeleteResource(op) => delete(op, ctx).await,
        Operation::WaitResourceCreation(op) => wait_for_creation(op, ctx).await,
        Operation::TrackResourcesReadiness(op) => tracking::track_readiness(op, ctx).await,
        Operation::CreatePendingRelease(op) => {
            ctx.storage.create(&op.release).await?;
            info!(release = %op.release.human_id(), "pending release recorded");
            Ok(())
        }
        Operation::SucceedRelease(op) => succeed_release(op, ctx).await,
        Operation::SupersedeRelease(op) => supersede_release(op, ctx).await,
        Operation::FailRelease(op) => fail_release(op, ctx).await,
    }
}

fn apply_options(op: &ResourceOp, ctx: &ExecutionContext) -> ApplyOptions {
    ApplyOptions::default()
        .with_fallback_namespace(op.fallback_namespace.as_str())
        .with_recreate_on_immutable(op.recreate_on_immutable)
        .with_deletion_timeout(ctx.config.deletion_timeout)
        .with_skip_unsupported(ctx.config.skip_unsupported)
}

async fn create(op: &ResourceOp, ctx: &ExecutionContext, force_replace: bool) -> Result<()> {
    let mut opts = CreateOptions::default()
        .with_fallback_namespace(op.fallback_namespace.as_str())
        .with_deletion_timeout(ctx.config.deletion_timeout)
        .with_skip_unsupported(ctx.config.skip_unsupported);
    if force_replace {
        opts = opts.with_force_replace();
    }

    let _slot = ctx.acquire_slot().await?;
    let result = ctx.client.create_one(&op.resource, &opts).await?;
    info!(resource = %result.id, outcome = %result.outcome, "resource created");
    Ok(())
}

async fn delete(op: &DeleteResourceOp, ctx: &ExecutionContext) -> Result<()> {
    let opts = DeleteOptions::default()
        .with_fallback_namespace(op.fallback_namespace.as_str())
        .with_deletion_timeout(ctx.config.deletion_timeout);

    let _slot = ctx.acquire_slot().await?;
    let result = ctx.client.delete_one(&op.resource, &opts).await?;
    if result.deleted {
        info!(resource = %result.id, "resource deleted");
    } else {
        debug!(resource = %result.id, "resource already absent");
    }
    Ok(())
}

async fn wait_for_creation(op: &WaitCreationOp, ctx: &ExecutionContext) -> Result<()> {
    let deadline = Instant::now() + ctx.config.creation_timeout;
    let opts = GetOptions {
        fallback_namespace: Some(op.fallback_namespace.clone()),
    };

    loop {
        let exists = {
            let _slot = ctx.acquire_slot().await?;
            ctx.client.get_one(&op.resource, &opts).await?.is_some()
        };
        if exists {
            debug!(resource = %op.resource, dependent = %op.dependent.short(), "dependency exists");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(KubeError::Timeout(format!(
                "{:?} waiting for {} to be created",
                ctx.config.creation_timeout, op.resource
            )));
        }
        sleep(ctx.config.poll_interval).await;
    }
}

async fn succeed_release(op: &ReleaseOp, ctx: &ExecutionContext) -> Result<()> {
    let mut release = stored(op, ctx).await?;
    release.mark_deployed()?;
    ctx.storage.update(&release).await?;
    info!(release = %release.human_id(), "release deployed");
    Ok(())
}

async fn supersede_release(op: &ReleaseOp, ctx: &ExecutionContext) -> Result<()> {
    let mut release = stored(op, ctx).await?;
    release.mark_superseded()?;
    ctx.storage.update(&release).await?;
    info!(release = %release.human_id(), "release superseded");
    Ok(())
}

async fn fail_release(op: &ReleaseOp, ctx: &ExecutionContext) -> Result<()> {
    match stored(op, ctx).await {
        Ok(mut release) => {
            release.mark_failed()?;
            ctx.storage.update(&release).await?;
        }
        // The deploy failed before its pending record was written
        Err(KubeError::ReleaseNotFound { .. }) => {
            let mut release = op.release.clone();
            release.mark_failed()?;
            ctx.storage.create(&release).await?;
        }
        Err(e) => return Err(e),
    }
    warn!(release = %op.release.human_id(), "release marked failed");
    Ok(())
}

async fn stored(op: &ReleaseOp, ctx: &ExecutionContext) -> Result<deckhand_core::Release> {
    ctx.storage
        .get(&op.release.namespace, &op.release.name, op.release.revision)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryCluster;
    use crate::mapper::{GvrResolver, StaticMapper};
    use crate::mutator::MutatorPipeline;
    use crate::plan::{MarkerPosition, Stage};
    use crate::readiness::StaticProbe;
    use crate::resource::ResourceSpec;
    use crate::storage::MemoryStorageDriver;
    use deckhand_core::{Release, ReleaseStatus};
    use std::time::Duration;

    fn context(cluster: &InMemoryCluster, storage: &MemoryStorageDriver) -> ExecutionContext {
        let client = ReconcileClient::new(
            GvrResolver::new(Arc::new(StaticMapper::with_builtin_kinds())),
            Arc::new(cluster.clone()),
            MutatorPipeline::new(),
            "default",
        );
        ExecutionContext::new(
            client,
            Arc::new(StaticProbe::new()),
            Arc::new(storage.clone()),
            DeployConfig::default().with_poll_interval(Duration::from_millis(100)),
        )
        .unwrap()
    }

    fn configmap_op(name: &str) -> Operation {
        let yaml = format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\n", name);
        Operation::ApplyResource(ResourceOp {
            resource: ResourceSpec::from_yaml(&yaml).unwrap(),
            fallback_namespace: "prod".to_string(),
            recreate_on_immutable: false,
        })
    }

    fn status(plan: &Plan, id: &OperationId) -> OperationStatus {
        plan.get(id).unwrap().status
    }

    #[tokio::test]
    async fn test_executes_chain_in_order() {
        let cluster = InMemoryCluster::new();
        let storage = MemoryStorageDriver::new();
        let mut plan = Plan::new();

        let start = plan
            .add_operation(Operation::marker(Stage::Install, MarkerPosition::StageStart))
            .unwrap();
        let apply = plan.add_operation(configmap_op("settings")).unwrap();
        plan.add_dependency(&start, &apply).unwrap();

        PlanExecutor::new(context(&cluster, &storage))
            .execute(&mut plan)
            .await
            .unwrap();

        assert_eq!(status(&plan, &start), OperationStatus::Completed);
        assert_eq!(status(&plan, &apply), OperationStatus::Completed);
        assert_eq!(cluster.len(), 1);
    }

    #[test]
    fn test_client_polls_at_configured_interval() {
        let ctx = context(&InMemoryCluster::new(), &MemoryStorageDriver::new());
        assert_eq!(ctx.client.poll_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_failure_cancels_descendants_only() {
        let cluster = InMemoryCluster::new();
        cluster.fail_writes_for("broken", "apiserver unavailable");
        let storage = MemoryStorageDriver::new();
        let mut plan = Plan::new();

        let broken = plan.add_operation(configmap_op("broken")).unwrap();
        let after = plan.add_operation(configmap_op("after")).unwrap();
        let independent = plan.add_operation(configmap_op("independent")).unwrap();
        plan.add_dependency(&broken, &after).unwrap();

        let err = PlanExecutor::new(context(&cluster, &storage))
            .execute(&mut plan)
            .await
            .unwrap_err();

        assert!(matches!(err, KubeError::Execution { ref failures } if failures.len() == 1));
        assert_eq!(status(&plan, &broken), OperationStatus::Failed);
        assert_eq!(status(&plan, &after), OperationStatus::Canceled);
        assert_eq!(status(&plan, &independent), OperationStatus::Completed);
        assert!(plan.get(&broken).unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_release_lifecycle_through_storage() {
        let cluster = InMemoryCluster::new();
        let mut previous = Release::new("web", "prod", 1);
        previous.mark_deployed().unwrap();
        let storage = MemoryStorageDriver::with_releases(vec![previous.clone()]);

        let release = Release::new("web", "prod", 2);
        let mut plan = Plan::new();
        let pending = plan
            .add_operation(Operation::CreatePendingRelease(ReleaseOp {
                release: release.clone(),
            }))
            .unwrap();
        let succeed = plan
            .add_operation(Operation::SucceedRelease(ReleaseOp { release }))
            .unwrap();
        let supersede = plan
            .add_operation(Operation::SupersedeRelease(ReleaseOp { release: previous }))
            .unwrap();
        plan.add_dependency(&pending, &succeed).unwrap();
        plan.add_dependency(&succeed, &supersede).unwrap();

        PlanExecutor::new(context(&cluster, &storage))
            .execute(&mut plan)
            .await
            .unwrap();

        let current = storage.get("prod", "web", 2).await.unwrap();
        let old = storage.get("prod", "web", 1).await.unwrap();
        assert_eq!(current.status, ReleaseStatus::Deployed);
        assert_eq!(old.status, ReleaseStatus::Superseded);
    }

    #[tokio::test]
    async fn test_fail_release_without_pending_record() {
        let cluster = InMemoryCluster::new();
        let storage = MemoryStorageDriver::new();
        let mut plan = Plan::new();
        plan.add_operation(Operation::FailRelease(ReleaseOp {
            release: Release::new("web", "prod", 1),
        }))
        .unwrap();

        PlanExecutor::new(context(&cluster, &storage))
            .execute(&mut plan)
            .await
            .unwrap();

        let stored = storage.get("prod", "web", 1).await.unwrap();
        assert_eq!(stored.status, ReleaseStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_creation_times_out() {
        let cluster = InMemoryCluster::new();
        let storage = MemoryStorageDriver::new();
        let mut ctx = context(&cluster, &storage);
        ctx.config.creation_timeout = Duration::from_secs(1);

        let mut plan = Plan::new();
        let wait = plan
            .add_operation(Operation::WaitResourceCreation(WaitCreationOp {
                resource: deckhand_core::ResourceId::new("", "v1", "Secret", None, "external"),
                dependent: deckhand_core::ResourceId::new("", "v1", "ConfigMap", None, "app"),
                fallback_namespace: "prod".to_string(),
            }))
            .unwrap();

        let err = PlanExecutor::new(ctx).execute(&mut plan).await.unwrap_err();
        assert!(err.to_string().contains("waiting for Secret/external"));
        assert_eq!(status(&plan, &wait), OperationStatus::Failed);
    }

    #[tokio::test]
    async fn test_slots_released_after_run() {
        let cluster = InMemoryCluster::new();
        let storage = MemoryStorageDriver::new();
        let mut plan = Plan::new();
        for name in ["a", "b", "c", "d"] {
            plan.add_operation(configmap_op(name)).unwrap();
        }

        let executor = PlanExecutor::new(context(&cluster, &storage));
        executor.execute(&mut plan).await.unwrap();

        assert_eq!(executor.context().available_slots(), 10);
        assert_eq!(cluster.len(), 4);
    }
}
