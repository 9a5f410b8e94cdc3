//! Readiness assessment of live objects
//!
//! A `ReadinessProbe` looks at one live object and says whether it is
//! ready, still progressing or has failed. The readiness tracking
//! operation fetches the object and asks the probe on each poll round.

use deckhand_core::ResourceId;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, StatefulSet},
    batch::v1::Job,
    core::v1::Pod,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::DynamicObject;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Readiness of one resource at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Ready,
    InProgress { message: String },
    Failed { reason: String },
}

impl ReadinessState {
    pub fn in_progress(message: impl Into<String>) -> Self {
        Self::InProgress {
            message: message.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Status text for logging
    pub fn message(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::InProgress { message } => message,
            Self::Failed { reason } => reason,
        }
    }
}

/// Assesses the readiness of a live object
pub trait ReadinessProbe: Send + Sync {
    /// `live` is `None` when the object does not exist (yet)
    fn assess(&self, id: &ResourceId, live: Option<&DynamicObject>) -> ReadinessState;
}

/// Probe that understands the built-in workload kinds
///
/// Kinds without a known status contract are ready as soon as they exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeReadinessProbe;

impl ReadinessProbe for KubeReadinessProbe {
    fn assess(&self, id: &ResourceId, live: Option<&DynamicObject>) -> ReadinessState {
        let Some(live) = live else {
            return ReadinessState::in_progress(format!("{} not found yet", id.short()));
        };

        match (id.group.as_str(), id.kind.as_str()) {
            ("apps", "Deployment") => typed(live, deployment_state),
            ("apps", "StatefulSet") => typed(live, statefulset_state),
            ("apps", "DaemonSet") => typed(live, daemonset_state),
            ("batch", "Job") => typed(live, job_state),
            ("", "Pod") => typed(live, pod_state),
            _ if id.is_crd() => typed(live, crd_state),
            _ => ReadinessState::Ready,
        }
    }
}

fn typed<K, F>(live: &DynamicObject, check: F) -> ReadinessState
where
    K: kube::Resource + Serialize + DeserializeOwned,
    F: FnOnce(&K) -> ReadinessState,
{
    match live.clone().try_parse::<K>() {
        Ok(object) => check(&object),
        Err(e) => ReadinessState::in_progress(format!("unreadable status: {}", e)),
    }
}

/// All replicas updated, ready and available
fn deployment_state(deployment: &Deployment) -> ReadinessState {
    let spec = deployment.spec.as_ref();
    let status = deployment.status.as_ref();

    let generation = deployment.metadata.generation.unwrap_or(0);
    let observed = status.and_then(|s| s.observed_generation).unwrap_or(0);
    if observed < generation {
        return ReadinessState::in_progress("waiting for rollout to be observed");
    }

    let failed_progress = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| {
            c.iter().find(|cond| {
                cond.type_ == "Progressing"
                    && cond.status == "False"
                    && cond.reason.as_deref() == Some("ProgressDeadlineExceeded")
            })
        });
    if let Some(cond) = failed_progress {
        return ReadinessState::failed(
            cond.message
                .clone()
                .unwrap_or_else(|| "progress deadline exceeded".to_string()),
        );
    }

    let desired = spec.and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0);

    if ready >= desired && updated >= desired && available >= desired {
        ReadinessState::Ready
    } else {
        ReadinessState::in_progress(format!(
            "{}/{} ready, {}/{} updated, {}/{} available",
            ready, desired, updated, desired, available, desired
        ))
    }
}

/// All replicas ready and the rollout revision reached
fn statefulset_state(sts: &StatefulSet) -> ReadinessState {
    let status = sts.status.as_ref();

    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let current_rev = status.and_then(|s| s.current_revision.as_ref());
    let update_rev = status.and_then(|s| s.update_revision.as_ref());

    if ready < desired {
        return ReadinessState::in_progress(format!("{}/{} ready", ready, desired));
    }
    if current_rev != update_rev {
        return ReadinessState::in_progress("rolling out new revision");
    }
    ReadinessState::Ready
}

fn daemonset_state(ds: &DaemonSet) -> ReadinessState {
    let status = ds.status.as_ref();

    let desired = status.map(|s| s.desired_number_scheduled).unwrap_or(0);
    let ready = status.map(|s| s.number_ready).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_number_scheduled).unwrap_or(0);

    if ready >= desired && updated >= desired {
        ReadinessState::Ready
    } else {
        ReadinessState::in_progress(format!(
            "{}/{} ready, {}/{} updated",
            ready, desired, updated, desired
        ))
    }
}

fn job_state(job: &Job) -> ReadinessState {
    let status = job.status.as_ref();
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    let active = status.and_then(|s| s.active).unwrap_or(0);

    let failed_condition = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| {
            c.iter()
                .find(|cond| cond.type_ == "Failed" && cond.status == "True")
        });

    if let Some(cond) = failed_condition {
        return ReadinessState::failed(
            cond.message
                .clone()
                .unwrap_or_else(|| format!("job failed with {} failures", failed)),
        );
    }

    if succeeded > 0 {
        ReadinessState::Ready
    } else if failed > 0 {
        // Failed pods count against the budget even while the job retries
        ReadinessState::failed(format!("{} failed pod(s), {} active", failed, active))
    } else {
        ReadinessState::in_progress(format!("{} active, {} succeeded", active, succeeded))
    }
}

fn pod_state(pod: &Pod) -> ReadinessState {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Pending");

    match phase {
        "Succeeded" => ReadinessState::Ready,
        "Failed" => ReadinessState::failed(
            status
                .and_then(|s| s.message.clone())
                .unwrap_or_else(|| "pod failed".to_string()),
        ),
        "Running" => {
            let ready = status
                .and_then(|s| s.conditions.as_ref())
                .map(|c| c.iter().any(|cond| cond.type_ == "Ready" && cond.status == "True"))
                .unwrap_or(false);
            if ready {
                ReadinessState::Ready
            } else {
                ReadinessState::in_progress("running, not ready")
            }
        }
        other => ReadinessState::in_progress(format!("phase {}", other)),
    }
}

fn crd_state(crd: &CustomResourceDefinition) -> ReadinessState {
    let established = crd
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| {
            c.iter()
                .any(|cond| cond.type_ == "Established" && cond.status == "True")
        })
        .unwrap_or(false);

    if established {
        ReadinessState::Ready
    } else {
        ReadinessState::in_progress("waiting for CRD to be established")
    }
}

/// Scripted probe for tests
///
/// Each resource (matched by `Kind/name`) walks through its scripted
/// states and then repeats the last one. Unscripted resources are ready.
#[derive(Clone, Default)]
pub struct StaticProbe {
    scripts: Arc<Mutex<HashMap<String, Vec<ReadinessState>>>>,
    probes: Arc<Mutex<HashMap<String, usize>>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the states reported for a resource
    pub fn script(self, kind: &str, name: &str, states: Vec<ReadinessState>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(format!("{}/{}", kind, name), states);
        }
        self
    }

    /// How many times a resource was assessed
    pub fn probe_count(&self, kind: &str, name: &str) -> usize {
        self.probes
            .lock()
            .ok()
            .and_then(|p| p.get(&format!("{}/{}", kind, name)).copied())
            .unwrap_or(0)
    }
}

impl ReadinessProbe for StaticProbe {
    fn assess(&self, id: &ResourceId, _live: Option<&DynamicObject>) -> ReadinessState {
        let key = id.short();

        let round = match self.probes.lock() {
            Ok(mut probes) => {
                let count = probes.entry(key.clone()).or_insert(0);
                *count += 1;
                *count - 1
            }
            Err(_) => 0,
        };

        self.scripts
            .lock()
            .ok()
            .and_then(|scripts| {
                scripts.get(&key).and_then(|states| {
                    states
                        .get(round)
                        .or_else(|| states.last())
                        .cloned()
                })
            })
            .unwrap_or(ReadinessState::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn deployment_id() -> ResourceId {
        ResourceId::new("apps", "v1", "Deployment", Some("prod"), "web")
    }

    #[test]
    fn test_missing_object_in_progress() {
        let state = KubeReadinessProbe.assess(&deployment_id(), None);
        assert!(matches!(state, ReadinessState::InProgress { .. }));
    }

    #[test]
    fn test_deployment_ready() {
        let live = dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "generation": 2 },
            "spec": {
                "replicas": 2,
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "spec": { "containers": [] } },
            },
            "status": {
                "observedGeneration": 2,
                "readyReplicas": 2,
                "updatedReplicas": 2,
                "availableReplicas": 2,
            },
        }));

        assert_eq!(
            KubeReadinessProbe.assess(&deployment_id(), Some(&live)),
            ReadinessState::Ready
        );
    }

    #[test]
    fn test_deployment_progressing() {
        let live = dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": {
                "replicas": 3,
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "spec": { "containers": [] } },
            },
            "status": { "readyReplicas": 1, "updatedReplicas": 3, "availableReplicas": 1 },
        }));

        let state = KubeReadinessProbe.assess(&deployment_id(), Some(&live));
        assert_eq!(state.message(), "1/3 ready, 3/3 updated, 1/3 available");
    }

    #[test]
    fn test_job_failed_condition() {
        let live = dynamic(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "migrate" },
            "spec": { "template": { "spec": { "containers": [] } } },
            "status": {
                "failed": 3,
                "conditions": [
                    { "type": "Failed", "status": "True", "message": "BackoffLimitExceeded" },
                ],
            },
        }));
        let id = ResourceId::new("batch", "v1", "Job", None, "migrate");

        assert_eq!(
            KubeReadinessProbe.assess(&id, Some(&live)),
            ReadinessState::failed("BackoffLimitExceeded")
        );
    }

    #[test]
    fn test_unknown_kind_ready_when_present() {
        let live = dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg" },
        }));
        let id = ResourceId::new("", "v1", "ConfigMap", None, "cfg");
        assert!(KubeReadinessProbe.assess(&id, Some(&live)).is_ready());
    }

    #[test]
    fn test_crd_established() {
        let live = dynamic(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "widgets.example.com" },
            "spec": {
                "group": "example.com",
                "names": { "kind": "Widget", "plural": "widgets" },
                "scope": "Namespaced",
                "versions": [],
            },
            "status": {
                "conditions": [ { "type": "Established", "status": "True" } ],
            },
        }));
        let id = ResourceId::new(
            "apiextensions.k8s.io",
            "v1",
            "CustomResourceDefinition",
            None,
            "widgets.example.com",
        );
        assert!(KubeReadinessProbe.assess(&id, Some(&live)).is_ready());
    }

    #[test]
    fn test_static_probe_script() {
        let probe = StaticProbe::new().script(
            "Deployment",
            "web",
            vec![ReadinessState::in_progress("0/1"), ReadinessState::Ready],
        );
        let id = deployment_id();

        assert!(!probe.assess(&id, None).is_ready());
        assert!(probe.assess(&id, None).is_ready());
        assert!(probe.assess(&id, None).is_ready());
        assert_eq!(probe.probe_count("Deployment", "web"), 3);

        let other = ResourceId::new("", "v1", "ConfigMap", None, "cfg");
        assert!(probe.assess(&other, None).is_ready());
    }
}
