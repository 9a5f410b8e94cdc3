//! Readiness tracking of a group of resources
//!
//! One tracking operation polls all of its resources each round. A worker
//! slot is held only while a round talks to the cluster, never while
//! sleeping between rounds.

use deckhand_core::ResourceId;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::decision::{FailMode, TerminationMode, TrackingParams};
use crate::error::{KubeError, Result};
use crate::executor::ExecutionContext;
use crate::plan::TrackReadinessOp;
use crate::readiness::ReadinessState;
use crate::reconcile::GetOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Standing {
    Tracking,
    Ready,
    /// Dropped under IgnoreAndContinueDeployProcess
    Dropped,
    /// Still probed under HopeUntilEndOfDeployProcess, but no longer blocking
    Hopeless,
}

struct ResourceTracker {
    resource: ResourceId,
    params: TrackingParams,
    failures: u32,
    last_message: Option<String>,
    last_activity: Instant,
    standing: Standing,
}

impl ResourceTracker {
    fn new(resource: ResourceId, params: TrackingParams, now: Instant) -> Self {
        Self {
            resource,
            params,
            failures: 0,
            last_message: None,
            last_activity: now,
            standing: Standing::Tracking,
        }
    }

    fn is_probed(&self) -> bool {
        matches!(self.standing, Standing::Tracking | Standing::Hopeless)
    }

    fn is_blocking(&self) -> bool {
        self.standing == Standing::Tracking
            && self.params.termination_mode == TerminationMode::WaitUntilResourceReady
    }

    fn record_activity(&mut self, message: &str, now: Instant) {
        if self.last_message.as_deref() != Some(message) {
            self.last_message = Some(message.to_string());
            self.last_activity = now;
            if self.params.should_log(message) {
                info!(resource = %self.resource, status = %message, "readiness progress");
            }
        }
    }

    /// Apply one probe result; an error means the deploy must stop
    fn observe(&mut self, state: ReadinessState, now: Instant) -> Result<()> {
        match state {
            ReadinessState::Ready => {
                if self.standing == Standing::Tracking {
                    info!(resource = %self.resource, "resource ready");
                }
                self.standing = Standing::Ready;
                Ok(())
            }
            ReadinessState::InProgress { message } => {
                self.record_activity(&message, now);
                self.check_activity(now)
            }
            ReadinessState::Failed { reason } => {
                self.record_activity(&reason, now);
                self.failures += 1;
                if self.failures > self.params.failures_allowed {
                    self.breach(reason)
                } else {
                    debug!(
                        resource = %self.resource,
                        failures = self.failures,
                        allowed = self.params.failures_allowed,
                        "failure within budget"
                    );
                    Ok(())
                }
            }
        }
    }

    fn check_activity(&mut self, now: Instant) -> Result<()> {
        match self.params.no_activity_timeout {
            Some(timeout) if now.duration_since(self.last_activity) >= timeout => {
                self.breach(format!("no activity for {:?}", timeout))
            }
            _ => Ok(()),
        }
    }

    fn breach(&mut self, reason: String) -> Result<()> {
        if self.standing != Standing::Tracking {
            return Ok(());
        }

        match self.params.fail_mode {
            FailMode::FailWholeDeployProcessImmediately => Err(KubeError::ReadinessFailed {
                resource: self.resource.to_string(),
                reason,
            }),
            FailMode::IgnoreAndContinueDeployProcess => {
                warn!(resource = %self.resource, reason = %reason, "ignoring readiness failure");
                self.standing = Standing::Dropped;
                Ok(())
            }
            FailMode::HopeUntilEndOfDeployProcess => {
                warn!(
                    resource = %self.resource,
                    reason = %reason,
                    "resource not ready, continuing without it"
                );
                self.standing = Standing::Hopeless;
                Ok(())
            }
        }
    }
}

/// Poll every resource of the op until none is blocking
pub(crate) async fn track_readiness(op: &TrackReadinessOp, ctx: &ExecutionContext) -> Result<()> {
    let started = Instant::now();
    let mut trackers: Vec<ResourceTracker> = op
        .resources
        .iter()
        .map(|r| ResourceTracker::new(r.resource.clone(), r.params.clone(), started))
        .collect();
    let get_opts = GetOptions {
        fallback_namespace: Some(op.fallback_namespace.clone()),
    };

    loop {
        let mut observations = Vec::with_capacity(trackers.len());
        {
            let _slot = ctx.acquire_slot().await?;
            for (i, tracker) in trackers.iter().enumerate() {
                if !tracker.is_probed() {
                    continue;
                }
                let live = ctx.client.get_one(&tracker.resource, &get_opts).await?;
                observations.push((i, ctx.probe.assess(&tracker.resource, live.as_ref())));
            }
        }

        let now = Instant::now();
        for (i, state) in observations {
            if let Some(tracker) = trackers.get_mut(i) {
                tracker.observe(state, now)?;
            }
        }

        if !trackers.iter().any(ResourceTracker::is_blocking) {
            return Ok(());
        }

        if started.elapsed() >= ctx.config.tracking_timeout {
            // A timeout is a breach like any other; the fail mode decides
            let reason = format!("not ready after {:?}", ctx.config.tracking_timeout);
            for tracker in trackers.iter_mut().filter(|t| t.is_blocking()) {
                tracker.breach(reason.clone())?;
            }
            return Ok(());
        }

        sleep(ctx.config.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryCluster;
    use crate::config::DeployConfig;
    use crate::mapper::{GvrResolver, StaticMapper};
    use crate::mutator::MutatorPipeline;
    use crate::plan::{Stage, TrackedResource};
    use crate::readiness::StaticProbe;
    use crate::reconcile::ReconcileClient;
    use crate::storage::MemoryStorageDriver;
    use std::sync::Arc;
    use std::time::Duration;

    fn stuck_context() -> ExecutionContext {
        let client = ReconcileClient::new(
            GvrResolver::new(Arc::new(StaticMapper::with_builtin_kinds())),
            Arc::new(InMemoryCluster::new()),
            MutatorPipeline::new(),
            "default",
        );
        let probe = StaticProbe::new().script(
            "Deployment",
            "web",
            vec![ReadinessState::in_progress("0/1 replicas available")],
        );
        ExecutionContext::new(
            client,
            Arc::new(probe),
            Arc::new(MemoryStorageDriver::new()),
            DeployConfig::default()
                .with_poll_interval(Duration::from_secs(1))
                .with_tracking_timeout(Duration::from_secs(10)),
        )
        .unwrap()
    }

    fn track_op(params: TrackingParams) -> TrackReadinessOp {
        TrackReadinessOp {
            stage: Stage::Install,
            weight: 0,
            dedicated_to: None,
            resources: vec![TrackedResource {
                resource: ResourceId::new("apps", "v1", "Deployment", Some("prod"), "web"),
                params,
            }],
            fallback_namespace: "prod".to_string(),
        }
    }

    fn tracker(params: TrackingParams) -> ResourceTracker {
        ResourceTracker::new(
            ResourceId::new("apps", "v1", "Deployment", Some("prod"), "web"),
            params,
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn test_failure_budget() {
        let mut t = tracker(TrackingParams::default().with_failures_allowed(1));
        let now = Instant::now();

        assert!(t.observe(ReadinessState::failed("crash"), now).is_ok());
        let err = t.observe(ReadinessState::failed("crash"), now).unwrap_err();
        assert!(matches!(err, KubeError::ReadinessFailed { .. }));
    }

    #[tokio::test]
    async fn test_ignore_mode_drops_resource() {
        let mut t = tracker(
            TrackingParams::default().with_fail_mode(FailMode::IgnoreAndContinueDeployProcess),
        );
        t.observe(ReadinessState::failed("crash"), Instant::now()).unwrap();

        assert_eq!(t.standing, Standing::Dropped);
        assert!(!t.is_blocking());
        assert!(!t.is_probed());
    }

    #[tokio::test]
    async fn test_hope_mode_keeps_probing() {
        let mut t = tracker(
            TrackingParams::default().with_fail_mode(FailMode::HopeUntilEndOfDeployProcess),
        );
        t.observe(ReadinessState::failed("crash"), Instant::now()).unwrap();

        assert!(t.is_probed());
        assert!(!t.is_blocking());

        t.observe(ReadinessState::Ready, Instant::now()).unwrap();
        assert_eq!(t.standing, Standing::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_activity_timeout() {
        let mut t = tracker(
            TrackingParams::default().with_no_activity_timeout(Duration::from_secs(30)),
        );
        let start = Instant::now();
        t.observe(ReadinessState::in_progress("0/1"), start).unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let err = t
            .observe(ReadinessState::in_progress("0/1"), Instant::now())
            .unwrap_err();
        assert!(err.to_string().contains("no activity"));
    }

    #[tokio::test]
    async fn test_non_blocking_never_blocks() {
        let t = tracker(TrackingParams::default().with_termination_mode(TerminationMode::NonBlocking));
        assert!(!t.is_blocking());
        assert!(t.is_probed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_timeout_fails_deploy_in_fail_mode() {
        let ctx = stuck_context();
        let err = track_readiness(&track_op(TrackingParams::default()), &ctx)
            .await
            .unwrap_err();

        let KubeError::ReadinessFailed { resource, reason } = err else {
            panic!("expected a readiness failure, got {err:?}");
        };
        assert_eq!(resource, "Deployment/web (ns: prod)");
        assert!(reason.contains("not ready after 10s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_timeout_respects_ignore_and_hope_modes() {
        let ctx = stuck_context();
        for mode in [
            FailMode::IgnoreAndContinueDeployProcess,
            FailMode::HopeUntilEndOfDeployProcess,
        ] {
            let op = track_op(TrackingParams::default().with_fail_mode(mode));
            assert!(track_readiness(&op, &ctx).await.is_ok(), "{mode:?}");
        }
    }
}
