//! Raw cluster access for dynamic objects
//!
//! `ClusterBackend` is the thin seam under the reconciliation client: one
//! GET, one server-side-apply PATCH and one DELETE against an already
//! resolved kind and namespace. `KubeBackend` talks to a real apiserver;
//! `InMemoryCluster` simulates server-side apply for tests.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PropagationPolicy},
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{KubeError, Result, is_immutable_response};
use crate::mapper::ResolvedKind;

/// Field manager name for Server-Side Apply
pub const FIELD_MANAGER: &str = "deckhand";

/// Dynamic object access against a resolved kind
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Server-side apply with forced ownership under [`FIELD_MANAGER`]
    async fn apply(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject>;

    /// Delete an object, `false` if it was already gone
    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str)
    -> Result<bool>;
}

/// Backend over `kube::Api<DynamicObject>`
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    /// Create a backend from a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if kind.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &kind.api_resource)
            }
            _ => Api::all_with(self.client.clone(), &kind.api_resource),
        }
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn get(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(kind, namespace)
            .get_opt(name)
            .await
            .map_err(KubeError::Api)
    }

    async fn apply(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let name = object.metadata.name.as_deref().ok_or_else(|| {
            KubeError::InvalidManifest("resource missing metadata.name".to_string())
        })?;

        let mut params = PatchParams::apply(FIELD_MANAGER).force();
        params.dry_run = dry_run;

        self.api(kind, namespace)
            .patch(name, &params, &Patch::Apply(object))
            .await
            .map_err(|e| match e {
                kube::Error::Api(resp) if is_immutable_response(&resp) => {
                    KubeError::ImmutableField {
                        resource: format!("{}/{}", kind.api_resource.kind, name),
                        message: resp.message,
                    }
                }
                other => KubeError::Api(other),
            })
    }

    async fn delete(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };

        match self.api(kind, namespace).delete(name, &params).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = KubeError::Api(e);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Key of an object in the in-memory cluster
type ObjectKey = (String, String, String, String);

/// Counts of backend calls for test assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteCounts {
    pub gets: usize,
    pub dry_runs: usize,
    pub applies: usize,
    pub deletes: usize,
}

/// In-memory cluster simulating server-side apply
///
/// Objects are stored as JSON. Every apply stamps a fresh managed-fields
/// timestamp, preserves server-owned metadata (uid, creationTimestamp,
/// status) and bumps the resourceVersion on real writes. Paths registered
/// with `immutable_path` reject changes the way the apiserver does.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    objects: Arc<Mutex<BTreeMap<ObjectKey, Value>>>,
    counts: Arc<Mutex<WriteCounts>>,
    immutable_paths: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<HashMap<String, String>>>,
    next_uid: Arc<Mutex<u64>>,
}

impl InMemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject changes to a JSON pointer (e.g. `/spec/selector`) on existing objects
    pub fn immutable_path(&self, pointer: &str) {
        if let Ok(mut paths) = self.immutable_paths.lock() {
            paths.push(pointer.to_string());
        }
    }

    /// Fail every write to objects with this name
    pub fn fail_writes_for(&self, name: &str, message: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(name.to_string(), message.to_string());
        }
    }

    /// Snapshot of call counters
    pub fn counts(&self) -> WriteCounts {
        self.counts.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Reset call counters
    pub fn reset_counts(&self) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts = WriteCounts::default();
        }
    }

    /// Stored object, if any
    pub fn object(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let objects = self.objects.lock().ok()?;
        objects
            .get(&Self::key(kind, namespace, name))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    /// Check if the cluster holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> ObjectKey {
        (
            kind.api_resource.api_version.clone(),
            kind.api_resource.kind.clone(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        )
    }

    fn bump<F: FnOnce(&mut WriteCounts)>(&self, f: F) {
        if let Ok(mut counts) = self.counts.lock() {
            f(&mut counts);
        }
    }

    fn injected_failure(&self, name: &str) -> Option<KubeError> {
        let failures = self.failures.lock().ok()?;
        failures.get(name).map(|message| {
            KubeError::Api(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: message.clone(),
                reason: "InternalError".to_string(),
                code: 500,
            }))
        })
    }

    fn lock_err<T>(e: std::sync::PoisonError<T>) -> KubeError {
        KubeError::InvariantViolation(format!("in-memory cluster lock poisoned: {}", e))
    }

    fn merge_server_fields(&self, desired: &DynamicObject, live: Option<&Value>, write: bool) -> Result<Value> {
        let mut merged = serde_json::to_value(desired)?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let api_version = merged
            .get("apiVersion")
            .cloned()
            .unwrap_or(Value::Null);

        let (uid, created, version) = match live {
            Some(live) => (
                live.pointer("/metadata/uid").cloned().unwrap_or(Value::Null),
                live.pointer("/metadata/creationTimestamp")
                    .cloned()
                    .unwrap_or(Value::Null),
                live.pointer("/metadata/resourceVersion")
                    .and_then(Value::as_str)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0),
            ),
            None => {
                let mut next = self.next_uid.lock().map_err(Self::lock_err)?;
                *next += 1;
                (json!(format!("uid-{}", *next)), json!(now.clone()), 0)
            }
        };
        let version = if write { version + 1 } else { version.max(1) };

        if let Some(metadata) = merged.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("uid".to_string(), uid);
            metadata.insert("creationTimestamp".to_string(), created);
            metadata.insert("resourceVersion".to_string(), json!(version.to_string()));
            metadata.insert(
                "managedFields".to_string(),
                json!([{
                    "manager": FIELD_MANAGER,
                    "operation": "Apply",
                    "apiVersion": api_version,
                    "fieldsType": "FieldsV1",
                    "time": now,
                }]),
            );
        }

        if let (Some(status), Some(obj)) = (
            live.and_then(|l| l.get("status")).cloned(),
            merged.as_object_mut(),
        ) {
            obj.entry("status").or_insert(status);
        }

        Ok(merged)
    }
}

#[async_trait]
impl ClusterBackend for InMemoryCluster {
    async fn get(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.bump(|c| c.gets += 1);
        let objects = self.objects.lock().map_err(Self::lock_err)?;
        match objects.get(&Self::key(kind, namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn apply(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let name = object.metadata.name.clone().ok_or_else(|| {
            KubeError::InvalidManifest("resource missing metadata.name".to_string())
        })?;
        if dry_run {
            self.bump(|c| c.dry_runs += 1);
        } else {
            self.bump(|c| c.applies += 1);
        }

        if let Some(err) = self.injected_failure(&name) {
            return Err(err);
        }

        let key = Self::key(kind, namespace, &name);
        let live = self
            .objects
            .lock()
            .map_err(Self::lock_err)?
            .get(&key)
            .cloned();

        let merged = self.merge_server_fields(object, live.as_ref(), !dry_run)?;

        if let Some(live) = &live {
            let paths = self.immutable_paths.lock().map_err(Self::lock_err)?;
            for path in paths.iter() {
                if live.pointer(path) != merged.pointer(path) {
                    return Err(KubeError::ImmutableField {
                        resource: format!("{}/{}", kind.api_resource.kind, name),
                        message: format!("{}: field is immutable", path.trim_start_matches('/')),
                    });
                }
            }
        }

        if !dry_run {
            self.objects
                .lock()
                .map_err(Self::lock_err)?
                .insert(key, merged.clone());
        }

        Ok(serde_json::from_value(merged)?)
    }

    async fn delete(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        self.bump(|c| c.deletes += 1);
        if let Some(err) = self.injected_failure(name) {
            return Err(err);
        }
        let mut objects = self.objects.lock().map_err(Self::lock_err)?;
        Ok(objects.remove(&Self::key(kind, namespace, name)).is_some())
    }
}
