//! Deckhand Kube - deploy plans for Kubernetes
//!
//! This crate provides:
//! - **Reconciliation**: Create, update, smart-apply and delete resources via forced Server-Side Apply
//! - **GVR Resolution**: Kind to API resource mapping with a one-shot discovery reset on misses
//! - **Plan Building**: Turn per-resource deploy decisions into a staged dependency graph
//! - **Plan Execution**: Concurrent graph walk bounded by a shared worker pool
//! - **Readiness Tracking**: Failure budgets, fail modes and no-activity timeouts
//! - **Release Storage**: Release history behind a pluggable storage driver
//! - **Reports**: DOT export and JSON reports of executed plans

pub mod backend;
pub mod builder;
pub mod config;
pub mod decision;
pub mod error;
pub mod executor;
pub mod history;
pub mod mapper;
pub mod mutator;
pub mod plan;
pub mod readiness;
pub mod reconcile;
pub mod report;
pub mod resource;
pub mod storage;
mod tracking;

pub use backend::{ClusterBackend, FIELD_MANAGER, InMemoryCluster, KubeBackend, WriteCounts};
pub use builder::{DeployPlanBuilder, DeployPlanInputs, FailurePlanBuilder, PlanBuildError};
pub use config::DeployConfig;
pub use decision::{
    DeployAction, DependencyRef, DependencyState, ExternalDependency, FailMode, HookPhase,
    ResourceDecision, TerminationMode, TrackingParams,
};
pub use error::{KubeError, Result};
pub use executor::{ExecutionContext, PlanExecutor};
pub use history::ReleaseHistory;
pub use mapper::{DiscoveryMapper, GvrResolver, ResolvedKind, RestMapper, StaticMapper};
pub use mutator::{ManagedByMutator, MutationKind, MutatorPipeline, ResourceMutator};
pub use plan::{
    Operation, OperationCategory, OperationId, OperationStatus, Plan, PlanNode, Stage,
};
pub use readiness::{KubeReadinessProbe, ReadinessProbe, ReadinessState, StaticProbe};
pub use reconcile::{
    ApplyOptions, ApplyOutcome, ApplyResult, BatchResult, CreateOptions, DeleteOptions,
    DeleteResult, GetOptions, GetResult, ReconcileClient,
};
pub use report::{ExecutionReport, ReportEntry};
pub use resource::ResourceSpec;
pub use storage::{MemoryStorageDriver, OperationCounts, StorageDriver};
