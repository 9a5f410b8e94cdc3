//! Deploy plan construction
//!
//! `DeployPlanBuilder` turns per-resource decisions into a staged plan:
//!
//! 1. Init: release namespace, pending release record, and deletion of
//!    resources only the previous release had
//! 2. Standalone CRDs
//! 3. Pre-hooks, general resources and post-hooks, each grouped by
//!    ascending weight with CRDs ahead of everything else of the same weight
//! 4. Cleanup deletes in the stage paired with the one that deployed them
//! 5. Final: succeed the new release, supersede the previous one
//!
//! Internal dependencies are linked in a second pass, then the stage and
//! group markers are chained into one total order and redundant edges are
//! removed.

use deckhand_core::{Release, ResourceId};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::{debug, info};

use crate::decision::{DependencyState, DeployAction, ResourceDecision};
use crate::error::{KubeError, Result};
use crate::history::ReleaseHistory;
use crate::plan::{
    Boundary, DeleteResourceOp, MarkerPosition, Operation, OperationId, OperationStatus, Plan,
    ReleaseOp, ResourceOp, Stage, SubGroup, TrackReadinessOp, TrackedResource, WaitCreationOp,
};

/// Everything needed to plan one deploy
#[derive(Debug, Clone)]
pub struct DeployPlanInputs {
    /// The new, pending release
    pub release: Release,
    pub history: ReleaseHistory,
    pub release_namespace: Option<ResourceDecision>,
    pub standalone_crds: Vec<ResourceDecision>,
    pub pre_hooks: Vec<ResourceDecision>,
    pub general: Vec<ResourceDecision>,
    pub post_hooks: Vec<ResourceDecision>,
    /// General resources of the previous release missing from this one
    pub previous_only: Vec<ResourceDecision>,
}

impl DeployPlanInputs {
    pub fn new(release: Release, history: ReleaseHistory) -> Self {
        Self {
            release,
            history,
            release_namespace: None,
            standalone_crds: Vec::new(),
            pre_hooks: Vec::new(),
            general: Vec::new(),
            post_hooks: Vec::new(),
            previous_only: Vec::new(),
        }
    }
}

/// Plan construction failed; the partial plan is kept for inspection
#[derive(Debug, Error)]
#[error("failed to build deploy plan: {source}")]
pub struct PlanBuildError {
    pub plan: Box<Plan>,
    #[source]
    pub source: KubeError,
}

/// Operations a resource ended up with
#[derive(Debug, Clone, Default)]
struct Handles {
    deploy: Option<OperationId>,
    track: Option<OperationId>,
}

/// Builds the deploy plan for one release revision
pub struct DeployPlanBuilder {
    inputs: DeployPlanInputs,
    plan: Plan,
    markers: BTreeMap<(Stage, MarkerPosition), OperationId>,
    index: BTreeMap<ResourceId, Handles>,
    /// Normalized ids of every resource seen so far
    claimed: HashSet<ResourceId>,
    /// Decisions with their dependency lists, for the linking pass
    linked: Vec<ResourceDecision>,
    pending_release: Option<OperationId>,
}

impl DeployPlanBuilder {
    pub fn new(inputs: DeployPlanInputs) -> Self {
        Self {
            inputs,
            plan: Plan::new(),
            markers: BTreeMap::new(),
            index: BTreeMap::new(),
            claimed: HashSet::new(),
            linked: Vec::new(),
            pending_release: None,
        }
    }

    /// Build the plan
    pub fn build(mut self) -> std::result::Result<Plan, PlanBuildError> {
        match self.build_inner() {
            Ok(()) => {
                info!(
                    release = %self.inputs.release.human_id(),
                    operations = self.plan.len(),
                    "deploy plan built"
                );
                Ok(self.plan)
            }
            Err(source) => Err(PlanBuildError {
                plan: Box::new(self.plan),
                source,
            }),
        }
    }

    fn build_inner(&mut self) -> Result<()> {
        for stage in Stage::ALL {
            self.marker(stage, MarkerPosition::StageStart)?;
            self.marker(stage, MarkerPosition::StageEnd)?;
        }

        self.build_init()?;

        let crds = std::mem::take(&mut self.inputs.standalone_crds);
        self.build_standalone_crds(crds)?;

        let pre_hooks = std::mem::take(&mut self.inputs.pre_hooks);
        self.build_weighted(Stage::PreInstall, pre_hooks)?;
        let general = std::mem::take(&mut self.inputs.general);
        self.build_weighted(Stage::Install, general)?;
        let post_hooks = std::mem::take(&mut self.inputs.post_hooks);
        self.build_weighted(Stage::PostInstall, post_hooks)?;

        self.build_previous_cleanup()?;
        self.build_final()?;

        self.link_dependencies()?;
        self.link_stages()?;
        self.plan.optimize();
        Ok(())
    }

    fn namespace(&self) -> &str {
        &self.inputs.release.namespace
    }

    fn normalized(&self, id: &ResourceId) -> ResourceId {
        id.with_fallback_namespace(self.namespace())
    }

    fn marker(&mut self, stage: Stage, position: MarkerPosition) -> Result<OperationId> {
        if let Some(id) = self.markers.get(&(stage, position)) {
            return Ok(id.clone());
        }
        let id = self.plan.add_operation(Operation::marker(stage, position))?;
        self.markers.insert((stage, position), id.clone());
        Ok(id)
    }

    fn add_to_stage(&mut self, op: Operation, stage: Stage) -> Result<OperationId> {
        let start = self.marker(stage, MarkerPosition::StageStart)?;
        let end = self.marker(stage, MarkerPosition::StageEnd)?;
        self.plan.insert_between(op, &start, &end)
    }

    fn add_to_group(
        &mut self,
        op: Operation,
        stage: Stage,
        weight: i64,
        sub: SubGroup,
    ) -> Result<OperationId> {
        let start = self.marker(stage, MarkerPosition::group(weight, sub, Boundary::Start))?;
        let end = self.marker(stage, MarkerPosition::group(weight, sub, Boundary::End))?;
        self.plan.insert_between(op, &start, &end)
    }

    fn deploy_op(&self, decision: &ResourceDecision) -> Option<Operation> {
        let op = ResourceOp {
            resource: decision.resource.clone(),
            fallback_namespace: self.namespace().to_string(),
            recreate_on_immutable: decision.recreate_on_immutable,
        };
        match decision.action {
            DeployAction::Create => Some(Operation::CreateResource(op)),
            DeployAction::Update => Some(Operation::UpdateResource(op)),
            DeployAction::Apply => Some(Operation::ApplyResource(op)),
            DeployAction::Recreate => Some(Operation::RecreateResource(op)),
            DeployAction::None => None,
        }
    }

    fn delete_op(&self, id: &ResourceId) -> Operation {
        Operation::DeleteResource(DeleteResourceOp {
            resource: id.clone(),
            fallback_namespace: self.namespace().to_string(),
        })
    }

    /// A resource may appear only once per release, whatever its namespace spelling
    fn claim(&mut self, decision: &ResourceDecision) -> Result<()> {
        let key = self.normalized(decision.id());
        if !self.claimed.insert(key.clone()) {
            return Err(KubeError::DuplicateOperation(format!(
                "deploy of {}",
                key.key()
            )));
        }
        Ok(())
    }

    fn register(&mut self, decision: &ResourceDecision, handles: Handles) {
        let key = self.normalized(decision.id());
        self.index.insert(key, handles);
        self.linked.push(decision.clone());
    }

    fn pending_release(&self) -> Result<OperationId> {
        self.pending_release.clone().ok_or_else(|| {
            KubeError::InvariantViolation("pending release operation not created".to_string())
        })
    }

    fn build_init(&mut self) -> Result<()> {
        let namespace_op = match self.inputs.release_namespace.take() {
            Some(decision) => {
                self.claim(&decision)?;
                match self.deploy_op(&decision) {
                    Some(op) => {
                        let id = self.add_to_stage(op, Stage::Init)?;
                        self.register(
                            &decision,
                            Handles {
                                deploy: Some(id.clone()),
                                track: None,
                            },
                        );
                        Some(id)
                    }
                    None => None,
                }
            }
            None => None,
        };

        let pending = self.add_to_stage(
            Operation::CreatePendingRelease(ReleaseOp {
                release: self.inputs.release.clone(),
            }),
            Stage::Init,
        )?;
        if let Some(ns) = &namespace_op {
            self.plan.add_dependency(ns, &pending)?;
        }
        self.pending_release = Some(pending);
        Ok(())
    }

    fn build_standalone_crds(&mut self, crds: Vec<ResourceDecision>) -> Result<()> {
        for decision in crds {
            self.claim(&decision)?;
            let deploy = match self.deploy_op(&decision) {
                Some(op) => Some(self.add_to_stage(op, Stage::PrePreInstall)?),
                None => None,
            };

            if decision.cleanup {
                self.add_cleanup(&decision, Stage::PrePreInstall, deploy.as_ref())?;
            }

            self.register(&decision, Handles { deploy, track: None });
        }
        Ok(())
    }

    fn build_weighted(&mut self, stage: Stage, decisions: Vec<ResourceDecision>) -> Result<()> {
        let mut shared: BTreeMap<i64, Vec<(usize, TrackedResource)>> = BTreeMap::new();
        let mut handles: Vec<Handles> = Vec::with_capacity(decisions.len());

        for (i, decision) in decisions.iter().enumerate() {
            self.claim(decision)?;
            let sub = sub_group(decision.id());

            let deploy = match self.deploy_op(decision) {
                Some(op) => Some(self.add_to_group(op, stage, decision.weight, sub)?),
                None => None,
            };

            for external in &decision.external_deps {
                let wait = self.add_to_group(
                    Operation::WaitResourceCreation(WaitCreationOp {
                        resource: external.resource.clone(),
                        dependent: decision.id().clone(),
                        fallback_namespace: self.namespace().to_string(),
                    }),
                    stage,
                    decision.weight,
                    sub,
                )?;
                if let Some(deploy) = &deploy {
                    self.plan.add_dependency(&wait, deploy)?;
                }
            }

            let mut track = None;
            if decision.track_readiness {
                let tracked = TrackedResource {
                    resource: decision.id().clone(),
                    params: decision.tracking.clone(),
                };

                if needs_dedicated_tracking(decision) {
                    let id = self.add_to_group(
                        Operation::TrackResourcesReadiness(TrackReadinessOp {
                            stage,
                            weight: decision.weight,
                            dedicated_to: Some(decision.id().clone()),
                            resources: vec![tracked],
                            fallback_namespace: self.namespace().to_string(),
                        }),
                        stage,
                        decision.weight,
                        SubGroup::Resources,
                    )?;
                    if let Some(deploy) = &deploy {
                        self.plan.add_dependency(deploy, &id)?;
                    }
                    track = Some(id);
                } else {
                    shared.entry(decision.weight).or_default().push((i, tracked));
                }
            }

            handles.push(Handles { deploy, track });
        }

        for (weight, members) in shared {
            let op = Operation::TrackResourcesReadiness(TrackReadinessOp {
                stage,
                weight,
                dedicated_to: None,
                resources: members.iter().map(|(_, t)| t.clone()).collect(),
                fallback_namespace: self.namespace().to_string(),
            });
            let track = self.add_to_group(op, stage, weight, SubGroup::Resources)?;

            for (i, _) in members {
                if let Some(h) = handles.get_mut(i) {
                    if let Some(deploy) = &h.deploy {
                        self.plan.add_dependency(deploy, &track)?;
                    }
                    h.track = Some(track.clone());
                }
            }
        }

        for (decision, handles) in decisions.iter().zip(handles) {
            if decision.cleanup {
                let after = handles.track.as_ref().or(handles.deploy.as_ref());
                self.add_cleanup(decision, stage, after)?;
            }
            self.register(decision, handles);
        }

        Ok(())
    }

    /// Delete in the paired cleanup stage, or in Init when nothing precedes it
    fn add_cleanup(
        &mut self,
        decision: &ResourceDecision,
        stage: Stage,
        after: Option<&OperationId>,
    ) -> Result<()> {
        let op = self.delete_op(decision.id());

        match after {
            Some(after) => {
                let delete = self.add_to_group(
                    op,
                    stage.cleanup_stage(),
                    decision.weight,
                    sub_group(decision.id()),
                )?;
                self.plan.add_dependency(after, &delete)?;
            }
            None => {
                let pending = self.pending_release()?;
                let delete = self.add_to_stage(op, Stage::Init)?;
                self.plan.add_dependency(&pending, &delete)?;
            }
        }
        Ok(())
    }

    fn build_previous_cleanup(&mut self) -> Result<()> {
        let previous = std::mem::take(&mut self.inputs.previous_only);
        if previous.is_empty() {
            return Ok(());
        }

        let new_ids: HashSet<ResourceId> = self.index.keys().cloned().collect();
        let new_uids: HashSet<String> = self
            .linked
            .iter()
            .filter_map(|d| d.live_uid.clone())
            .collect();
        let pending = self.pending_release()?;

        for decision in previous {
            let id = self.normalized(decision.id());
            if new_ids.contains(&id) {
                continue;
            }
            if decision
                .live_uid
                .as_ref()
                .is_some_and(|uid| new_uids.contains(uid))
            {
                debug!(resource = %id, "live object adopted by new release, not deleting");
                continue;
            }

            let delete = self.add_to_stage(self.delete_op(decision.id()), Stage::Init)?;
            self.plan.add_dependency(&pending, &delete)?;
        }
        Ok(())
    }

    fn build_final(&mut self) -> Result<()> {
        let succeed = self.add_to_stage(
            Operation::SucceedRelease(ReleaseOp {
                release: self.inputs.release.clone(),
            }),
            Stage::Final,
        )?;

        if let Some(previous) = self.inputs.history.last_deployed_release().cloned() {
            let supersede = self.add_to_stage(
                Operation::SupersedeRelease(ReleaseOp { release: previous }),
                Stage::Final,
            )?;
            self.plan.add_dependency(&succeed, &supersede)?;
        }
        Ok(())
    }

    fn link_dependencies(&mut self) -> Result<()> {
        let decisions = std::mem::take(&mut self.linked);

        for decision in &decisions {
            let own = self.normalized(decision.id());
            let Some(dependent) = self.index.get(&own).and_then(|h| h.deploy.clone()) else {
                continue;
            };

            for dep in decision.dependencies() {
                let targets: Vec<(ResourceId, Handles)> = self
                    .index
                    .iter()
                    .filter(|(id, _)| **id != own && dep.matches(id))
                    .map(|(id, h)| (id.clone(), h.clone()))
                    .collect();

                if targets.is_empty() {
                    debug!(resource = %own, dependency = %dep.name, "dependency not in release");
                }

                for (target, handles) in targets {
                    let prerequisite = match dep.state {
                        DependencyState::Ready => handles.track.or(handles.deploy),
                        DependencyState::Present => handles.deploy,
                    };
                    if let Some(prerequisite) = prerequisite {
                        debug!(resource = %own, dependency = %target, "linking dependency");
                        self.plan.add_dependency(&prerequisite, &dependent)?;
                    }
                }
            }
        }

        self.linked = decisions;
        Ok(())
    }

    /// Chain all markers in stage, weight and sub-group order
    fn link_stages(&mut self) -> Result<()> {
        let ordered: Vec<OperationId> = self.markers.values().cloned().collect();
        for pair in ordered.windows(2) {
            self.plan.add_dependency(&pair[0], &pair[1])?;
        }
        Ok(())
    }
}

fn sub_group(id: &ResourceId) -> SubGroup {
    if id.is_crd() {
        SubGroup::Crds
    } else {
        SubGroup::Resources
    }
}

/// Resources that wait on another resource's readiness get their own tracking
/// op so the shared group op cannot end up waiting on itself.
fn needs_dedicated_tracking(decision: &ResourceDecision) -> bool {
    !decision.manual_deps.is_empty()
        || decision
            .dependencies()
            .any(|d| d.state == DependencyState::Ready)
}

/// Builds the plan run after a failed deploy
///
/// The plan marks the pending release failed and, when rollback cleanup is
/// requested, deletes every resource the failed plan created.
pub struct FailurePlanBuilder<'a> {
    release: Release,
    failed_plan: &'a Plan,
    cleanup_created: bool,
}

impl<'a> FailurePlanBuilder<'a> {
    pub fn new(release: Release, failed_plan: &'a Plan) -> Self {
        Self {
            release,
            failed_plan,
            cleanup_created: false,
        }
    }

    /// Delete resources whose create completed in the failed plan
    pub fn with_cleanup_created(mut self, cleanup: bool) -> Self {
        self.cleanup_created = cleanup;
        self
    }

    pub fn build(self) -> Result<Plan> {
        let mut plan = Plan::new();
        plan.add_operation(Operation::FailRelease(ReleaseOp {
            release: self.release.clone(),
        }))?;

        if self.cleanup_created {
            let created: BTreeSet<(ResourceId, String)> = self
                .failed_plan
                .nodes()
                .filter(|n| n.status == OperationStatus::Completed)
                .filter_map(|n| match &n.operation {
                    Operation::CreateResource(op) | Operation::RecreateResource(op) => Some((
                        op.resource.id.clone(),
                        op.fallback_namespace.clone(),
                    )),
                    _ => None,
                })
                .collect();

            for (resource, fallback_namespace) in created {
                plan.add_operation(Operation::DeleteResource(DeleteResourceOp {
                    resource,
                    fallback_namespace,
                }))?;
            }
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DependencyRef, HookPhase};
    use crate::resource::ResourceSpec;
    use deckhand_core::ReleaseStatus;
    use regex::Regex;

    fn spec(api_version: &str, kind: &str, name: &str) -> ResourceSpec {
        ResourceSpec::from_yaml(&format!(
            "apiVersion: {}\nkind: {}\nmetadata:\n  name: {}\n",
            api_version, kind, name
        ))
        .unwrap()
    }

    fn deployment(name: &str) -> ResourceDecision {
        ResourceDecision::new(spec("apps/v1", "Deployment", name), DeployAction::Apply)
    }

    fn inputs() -> DeployPlanInputs {
        DeployPlanInputs::new(
            Release::new("web", "prod", 1),
            ReleaseHistory::from_releases("web", "prod", Vec::new()),
        )
    }

    fn id(s: &str) -> OperationId {
        OperationId::from(s)
    }

    #[test]
    fn test_empty_release_is_useless() {
        let plan = DeployPlanBuilder::new(inputs()).build().unwrap();
        assert!(plan.is_useless());
        assert!(plan.contains(&id("release/create-pending/web:1")));
        assert!(plan.contains(&id("release/succeed/web:1")));
    }

    #[test]
    fn test_stages_chained_in_order() {
        let plan = DeployPlanBuilder::new(inputs()).build().unwrap();

        for pair in Stage::ALL.windows(2) {
            let end = id(&format!("stage/{}/end", pair[0]));
            let start = id(&format!("stage/{}/start", pair[1]));
            assert!(plan.has_dependency(&end, &start), "{} -> {}", end, start);
        }
    }

    #[test]
    fn test_weight_groups_and_crd_subgroup() {
        let mut inputs = inputs();
        inputs.general = vec![
            deployment("late").with_weight(10),
            deployment("early").with_weight(-1),
            ResourceDecision::new(
                spec(
                    "apiextensions.k8s.io/v1",
                    "CustomResourceDefinition",
                    "widgets.example.com",
                ),
                DeployAction::Apply,
            )
            .with_weight(10),
        ];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let early = id("apply/apps:v1:Deployment::early");
        let late = id("apply/apps:v1:Deployment::late");
        let crd = id(
            "apply/apiextensions.k8s.io:v1:CustomResourceDefinition::widgets.example.com",
        );

        assert!(plan.depends_on(&late, &early));
        assert!(plan.depends_on(&late, &crd));
        assert!(plan.depends_on(&crd, &early));
    }

    #[test]
    fn test_no_edges_within_a_group() {
        let mut inputs = inputs();
        inputs.general = vec![deployment("a"), deployment("b"), deployment("c")];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let ops: Vec<OperationId> = ["a", "b", "c"]
            .iter()
            .map(|n| id(&format!("apply/apps:v1:Deployment::{}", n)))
            .collect();
        for a in &ops {
            for b in &ops {
                assert!(!plan.depends_on(a, b));
            }
            assert_eq!(
                plan.dependencies(a).unwrap(),
                vec![id("stage/install/weight/0/resources/start")]
            );
        }
    }

    #[test]
    fn test_shared_tracking_per_weight() {
        let mut inputs = inputs();
        inputs.general = vec![deployment("a").tracked(), deployment("b").tracked()];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let tracks = plan.find_by_regex(&Regex::new("^track-readiness/").unwrap());
        assert_eq!(tracks.len(), 1);
        let track = tracks[0].id();
        assert_eq!(track.as_str(), "track-readiness/install/0");
        assert!(plan.depends_on(&track, &id("apply/apps:v1:Deployment::a")));
        assert!(plan.depends_on(&track, &id("apply/apps:v1:Deployment::b")));
    }

    #[test]
    fn test_manual_dependency_gets_dedicated_tracking() {
        let mut inputs = inputs();
        inputs.general = vec![
            deployment("db").tracked(),
            deployment("app")
                .tracked()
                .with_manual_dep(DependencyRef::new("Deployment", "db").ready()),
        ];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let app = id("apply/apps:v1:Deployment::app");
        let shared = id("track-readiness/install/0");
        let dedicated = id("track-readiness/install/0/apps:v1:Deployment::app");

        assert!(plan.contains(&dedicated));
        assert!(plan.has_dependency(&shared, &app));
        assert!(plan.has_dependency(&app, &dedicated));
    }

    #[test]
    fn test_present_dependency_links_deploy_ops() {
        let mut inputs = inputs();
        inputs.general = vec![
            deployment("db"),
            deployment("app").with_auto_dep(DependencyRef::new("Deployment", "db")),
        ];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        assert!(plan.has_dependency(
            &id("apply/apps:v1:Deployment::db"),
            &id("apply/apps:v1:Deployment::app")
        ));
    }

    #[test]
    fn test_backward_ready_dependency_is_a_cycle() {
        let mut inputs = inputs();
        inputs.general = vec![
            deployment("late").with_weight(5).tracked(),
            deployment("early").with_manual_dep(DependencyRef::new("Deployment", "late").ready()),
        ];

        let err = DeployPlanBuilder::new(inputs).build().unwrap_err();
        assert!(matches!(err.source, KubeError::Cycle { .. }));
        assert!(err.plan.contains(&id("apply/apps:v1:Deployment::late")));
    }

    #[test]
    fn test_external_dependency_wait() {
        let mut inputs = inputs();
        let secret = ResourceId::new("", "v1", "Secret", Some("infra"), "creds");
        inputs.general = vec![deployment("app").with_external_dep(secret)];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let wait = id("wait-creation/:v1:Secret:infra:creds/for/apps:v1:Deployment::app");
        assert!(plan.has_dependency(&wait, &id("apply/apps:v1:Deployment::app")));
        assert!(plan.has_dependency(&id("stage/install/weight/0/resources/start"), &wait));
    }

    #[test]
    fn test_hook_cleanup_in_paired_stage() {
        let mut inputs = inputs();
        inputs.pre_hooks = vec![
            ResourceDecision::new(spec("batch/v1", "Job", "migrate"), DeployAction::Recreate)
                .with_hook(HookPhase::Pre)
                .with_weight(-5)
                .tracked()
                .with_cleanup(),
        ];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let delete = id("delete/batch:v1:Job::migrate");
        let track = id("track-readiness/pre-install/-5");
        assert!(plan.has_dependency(&id("stage/pre-uninstall/weight/-5/resources/start"), &delete));
        assert!(plan.depends_on(&delete, &track));
        assert!(plan.depends_on(&id("stage/install/start"), &delete));
    }

    #[test]
    fn test_cleanup_without_deploy_goes_to_init() {
        let mut inputs = inputs();
        inputs.general = vec![
            ResourceDecision::new(spec("v1", "ConfigMap", "stale"), DeployAction::None).with_cleanup(),
        ];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let delete = id("delete/:v1:ConfigMap::stale");
        assert!(plan.has_dependency(&id("release/create-pending/web:1"), &delete));
        assert!(plan.has_dependency(&delete, &id("stage/init/end")));
    }

    #[test]
    fn test_previous_release_cleanup() {
        let mut inputs = inputs();
        inputs.general = vec![deployment("kept"), deployment("renamed").with_live_uid("uid-7")];
        inputs.previous_only = vec![
            deployment("gone"),
            deployment("kept"),
            deployment("old-name").with_live_uid("uid-7"),
        ];
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let deletes = plan.find_by_regex(&Regex::new("^delete/").unwrap());
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].id().as_str(), "delete/apps:v1:Deployment::gone");
        assert!(plan.has_dependency(&id("release/create-pending/web:1"), &deletes[0].id()));
    }

    #[test]
    fn test_supersede_only_with_deployed_previous() {
        let mut previous = Release::new("web", "prod", 1);
        previous.status = ReleaseStatus::Deployed;
        let inputs = DeployPlanInputs::new(
            Release::new("web", "prod", 2),
            ReleaseHistory::from_releases("web", "prod", vec![previous]),
        );
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        let succeed = id("release/succeed/web:2");
        let supersede = id("release/supersede/web:1");
        assert!(plan.has_dependency(&succeed, &supersede));
    }

    #[test]
    fn test_namespace_precedes_pending_release() {
        let mut inputs = inputs();
        inputs.release_namespace = Some(ResourceDecision::new(
            spec("v1", "Namespace", "prod"),
            DeployAction::Apply,
        ));
        let plan = DeployPlanBuilder::new(inputs).build().unwrap();

        assert!(plan.has_dependency(
            &id("apply/:v1:Namespace::prod"),
            &id("release/create-pending/web:1")
        ));
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut inputs = inputs();
        inputs.general = vec![deployment("a"), deployment("a")];
        let err = DeployPlanBuilder::new(inputs).build().unwrap_err();
        assert!(matches!(err.source, KubeError::DuplicateOperation(_)));
    }

    #[test]
    fn test_same_resource_with_explicit_release_namespace_rejected() {
        let explicit = ResourceSpec::from_yaml(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: prod\n",
        )
        .unwrap();
        let mut inputs = inputs();
        inputs.general = vec![
            ResourceDecision::new(spec("v1", "ConfigMap", "a"), DeployAction::Apply),
            ResourceDecision::new(explicit, DeployAction::Apply),
        ];

        let err = DeployPlanBuilder::new(inputs).build().unwrap_err();
        let KubeError::DuplicateOperation(what) = &err.source else {
            panic!("expected a duplicate, got {}", err.source);
        };
        assert!(what.contains(":v1:ConfigMap:prod:a"));
        assert_eq!(
            err.plan
                .find_by_regex(&Regex::new(r"^apply/.*ConfigMap").unwrap())
                .len(),
            1
        );
    }

    #[test]
    fn test_failure_plan() {
        let mut inputs = inputs();
        inputs.general = vec![
            ResourceDecision::new(spec("v1", "ConfigMap", "cfg"), DeployAction::Create),
            deployment("web"),
        ];
        let mut failed = DeployPlanBuilder::new(inputs).build().unwrap();
        let create = id("create/:v1:ConfigMap::cfg");
        failed.set_status(&create, OperationStatus::Running).unwrap();
        failed.set_status(&create, OperationStatus::Completed).unwrap();

        let plan = FailurePlanBuilder::new(Release::new("web", "prod", 1), &failed)
            .with_cleanup_created(true)
            .build()
            .unwrap();

        assert_eq!(plan.find_by_regex(&Regex::new("^release/fail/").unwrap()).len(), 1);
        assert!(plan.contains(&id("delete/:v1:ConfigMap::cfg")));
        assert_eq!(plan.len(), 2);
    }
}
