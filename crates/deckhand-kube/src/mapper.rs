//! Group-Version-Kind to Group-Version-Resource resolution
//!
//! The `RestMapper` trait is the seam between Deckhand and API discovery.
//! `GvrResolver` adds the recovery policy: a miss resets the mapper cache
//! once (a CRD may have been installed since discovery ran) and retries.
//! Reads that poll for a kind the cluster does not serve reset at most once
//! per `READ_RESET_BACKOFF` for that kind.

use async_trait::async_trait;
use kube::{
    Client,
    core::GroupVersionKind,
    discovery::{ApiResource, Discovery, Scope},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{KubeError, Result};

/// A resolved kind: the API resource and whether it is namespaced
#[derive(Debug, Clone)]
pub struct ResolvedKind {
    /// API resource (carries the plural resource name)
    pub api_resource: ApiResource,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

/// Cached mapping from kinds to API resources
#[async_trait]
pub trait RestMapper: Send + Sync {
    /// Resolve a kind, `None` if the kind is unknown to the cache
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResolvedKind>>;

    /// Drop the cache and rediscover
    async fn reset(&self) -> Result<()>;
}

/// Minimum time between two read-triggered resets for the same kind
pub const READ_RESET_BACKOFF: Duration = Duration::from_secs(30);

/// Resolver that retries once after a mapper reset
#[derive(Clone)]
pub struct GvrResolver {
    mapper: Arc<dyn RestMapper>,
    read_resets: Arc<Mutex<HashMap<GroupVersionKind, Instant>>>,
}

impl GvrResolver {
    /// Create a resolver over a mapper
    pub fn new(mapper: Arc<dyn RestMapper>) -> Self {
        Self {
            mapper,
            read_resets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve a kind for a read, `None` if the cluster does not serve it
    ///
    /// Polling reads hit the same missing kind every round; only the first
    /// miss within `READ_RESET_BACKOFF` triggers a rediscovery.
    pub async fn resolve_for_read(&self, gvk: &GroupVersionKind) -> Result<Option<ResolvedKind>> {
        if let Some(resolved) = self.mapper.resolve(gvk).await? {
            return Ok(Some(resolved));
        }

        let now = Instant::now();
        let throttled = {
            let mut resets = self
                .read_resets
                .lock()
                .map_err(|e| KubeError::InvariantViolation(e.to_string()))?;
            match resets.get(gvk) {
                Some(at) if now.duration_since(*at) < READ_RESET_BACKOFF => true,
                _ => {
                    resets.insert(gvk.clone(), now);
                    false
                }
            }
        };
        if throttled {
            return Ok(None);
        }

        debug!(kind = %gvk.kind, "no matches for kind on read, resetting mapper");
        self.mapper.reset().await?;
        self.mapper.resolve(gvk).await
    }

    /// Resolve a kind, resetting the mapper once on a miss
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind> {
        if let Some(resolved) = self.mapper.resolve(gvk).await? {
            return Ok(resolved);
        }

        debug!(
            group = %gvk.group,
            version = %gvk.version,
            kind = %gvk.kind,
            "no matches for kind, resetting mapper"
        );
        self.mapper.reset().await?;

        self.mapper
            .resolve(gvk)
            .await?
            .ok_or_else(|| KubeError::UnresolvedKind {
                api_version: api_version_of(gvk),
                kind: gvk.kind.clone(),
            })
    }
}

/// Mapper backed by kube API discovery
pub struct DiscoveryMapper {
    client: Client,
    discovery: tokio::sync::RwLock<Discovery>,
}

impl DiscoveryMapper {
    /// Run discovery and build a mapper
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(KubeError::Api)?;

        Ok(Self {
            client,
            discovery: tokio::sync::RwLock::new(discovery),
        })
    }
}

#[async_trait]
impl RestMapper for DiscoveryMapper {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResolvedKind>> {
        let discovery = self.discovery.read().await;
        Ok(discovery
            .resolve_gvk(gvk)
            .map(|(api_resource, capabilities)| ResolvedKind {
                api_resource,
                namespaced: capabilities.scope == Scope::Namespaced,
            }))
    }

    async fn reset(&self) -> Result<()> {
        let fresh = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(KubeError::Api)?;
        *self.discovery.write().await = fresh;
        Ok(())
    }
}

/// In-memory mapper for tests and offline planning
///
/// Kinds registered with `register_after_reset` only become visible once
/// `reset` has been called, which simulates a CRD installed after discovery.
#[derive(Clone, Default)]
pub struct StaticMapper {
    state: Arc<RwLock<StaticMapperState>>,
    resets: Arc<AtomicUsize>,
}

#[derive(Default)]
struct StaticMapperState {
    visible: HashMap<GroupVersionKind, ResolvedKind>,
    pending: HashMap<GroupVersionKind, ResolvedKind>,
}

impl StaticMapper {
    /// Create an empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapper preloaded with common built-in kinds
    pub fn with_builtin_kinds() -> Self {
        let mapper = Self::new();
        for (group, version, kind, namespaced) in [
            ("", "v1", "Namespace", false),
            ("", "v1", "ConfigMap", true),
            ("", "v1", "Secret", true),
            ("", "v1", "Service", true),
            ("", "v1", "ServiceAccount", true),
            ("", "v1", "Pod", true),
            ("", "v1", "PersistentVolumeClaim", true),
            ("apps", "v1", "Deployment", true),
            ("apps", "v1", "StatefulSet", true),
            ("apps", "v1", "DaemonSet", true),
            ("batch", "v1", "Job", true),
            ("rbac.authorization.k8s.io", "v1", "ClusterRole", false),
            ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", false),
        ] {
            mapper.register(GroupVersionKind::gvk(group, version, kind), namespaced);
        }
        mapper
    }

    /// Make a kind resolvable immediately
    pub fn register(&self, gvk: GroupVersionKind, namespaced: bool) {
        let resolved = Self::resolved(&gvk, namespaced);
        if let Ok(mut state) = self.state.write() {
            state.visible.insert(gvk, resolved);
        }
    }

    /// Make a kind resolvable only after the next reset
    pub fn register_after_reset(&self, gvk: GroupVersionKind, namespaced: bool) {
        let resolved = Self::resolved(&gvk, namespaced);
        if let Ok(mut state) = self.state.write() {
            state.pending.insert(gvk, resolved);
        }
    }

    /// Number of resets performed
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    fn resolved(gvk: &GroupVersionKind, namespaced: bool) -> ResolvedKind {
        ResolvedKind {
            api_resource: ApiResource::from_gvk(gvk),
            namespaced,
        }
    }
}

#[async_trait]
impl RestMapper for StaticMapper {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResolvedKind>> {
        let state = self
            .state
            .read()
            .map_err(|e| KubeError::InvariantViolation(e.to_string()))?;
        Ok(state.visible.get(gvk).cloned())
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        let mut state = self
            .state
            .write()
            .map_err(|e| KubeError::InvariantViolation(e.to_string()))?;
        let pending: Vec<_> = state.pending.drain().collect();
        state.visible.extend(pending);
        Ok(())
    }
}

fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}
