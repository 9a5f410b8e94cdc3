//! Canonical resource identity
//!
//! A `ResourceId` names one Kubernetes object by group, version, kind,
//! namespace and name. The namespace is optional: cluster-scoped objects
//! never carry one, and namespaced objects rendered without one get it
//! resolved at use time (own namespace, then caller fallback, then the
//! cluster default).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// Kind of CustomResourceDefinition objects
pub const CRD_KIND: &str = "CustomResourceDefinition";

/// API group of CustomResourceDefinition objects
pub const CRD_GROUP: &str = "apiextensions.k8s.io";

/// Identity of a single Kubernetes resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    /// API group ("" for the core group)
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Resource kind
    pub kind: String,
    /// Namespace, if set on the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Resource name
    pub name: String,
}

impl ResourceId {
    /// Create a new resource id
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.map(String::from),
            name: name.into(),
        }
    }

    /// Create a resource id from an apiVersion string
    ///
    /// - "apps/v1" -> group="apps", version="v1"
    /// - "v1" -> group="", version="v1" (core API)
    pub fn from_api_version(
        api_version: &str,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let (group, version) = split_api_version(api_version)?;
        Ok(Self::new(group, version, kind, namespace, name))
    }

    /// The apiVersion string for this resource
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Check if this resource is a CustomResourceDefinition
    pub fn is_crd(&self) -> bool {
        self.kind == CRD_KIND && self.group == CRD_GROUP
    }

    /// Resolve the namespace through the fallback chain
    ///
    /// Returns `None` for cluster-scoped kinds regardless of what the
    /// manifest says.
    pub fn resolve_namespace(
        &self,
        namespaced: bool,
        fallback: Option<&str>,
        cluster_default: &str,
    ) -> Option<String> {
        if !namespaced {
            return None;
        }

        Some(
            self.namespace
                .as_deref()
                .filter(|ns| !ns.is_empty())
                .or(fallback.filter(|ns| !ns.is_empty()))
                .unwrap_or(cluster_default)
                .to_string(),
        )
    }

    /// Copy of this id with the namespace filled from `fallback` when missing
    pub fn with_fallback_namespace(&self, fallback: &str) -> Self {
        let mut id = self.clone();
        if id.namespace.as_deref().is_none_or(str::is_empty) {
            id.namespace = Some(fallback.to_string());
        }
        id
    }

    /// Stable machine identity, used to derive operation ids
    ///
    /// Format: `group:version:Kind:namespace:name`, with empty segments for
    /// the core group and for cluster-scoped resources.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.group,
            self.version,
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }

    /// Kind and name only, e.g. `Deployment/web`
    pub fn short(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} (ns: {})", self.kind, self.name, ns),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Split an apiVersion into group and version
pub fn split_api_version(api_version: &str) -> Result<(String, String)> {
    let api_version = api_version.trim();
    if api_version.is_empty() {
        return Err(CoreError::InvalidApiVersion(api_version.to_string()));
    }

    match api_version.split_once('/') {
        Some((group, version)) if !group.is_empty() && !version.is_empty() => {
            if version.contains('/') {
                return Err(CoreError::InvalidApiVersion(api_version.to_string()));
            }
            Ok((group.to_string(), version.to_string()))
        }
        Some(_) => Err(CoreError::InvalidApiVersion(api_version.to_string())),
        None => Ok((String::new(), api_version.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(ns: Option<&str>) -> ResourceId {
        ResourceId::new("apps", "v1", "Deployment", ns, "web")
    }

    #[test]
    fn test_from_api_version() {
        let id = ResourceId::from_api_version("apps/v1", "Deployment", None, "web").unwrap();
        assert_eq!(id.group, "apps");
        assert_eq!(id.version, "v1");

        let core = ResourceId::from_api_version("v1", "ConfigMap", Some("prod"), "cfg").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn test_invalid_api_version() {
        assert!(split_api_version("").is_err());
        assert!(split_api_version("/v1").is_err());
        assert!(split_api_version("a/b/c").is_err());
    }

    #[test]
    fn test_api_version_roundtrip() {
        assert_eq!(deployment(None).api_version(), "apps/v1");
    }

    #[test]
    fn test_namespace_fallback_chain() {
        let own = deployment(Some("own"));
        assert_eq!(
            own.resolve_namespace(true, Some("fallback"), "default").as_deref(),
            Some("own")
        );

        let bare = deployment(None);
        assert_eq!(
            bare.resolve_namespace(true, Some("fallback"), "default").as_deref(),
            Some("fallback")
        );
        assert_eq!(
            bare.resolve_namespace(true, None, "default").as_deref(),
            Some("default")
        );
        assert_eq!(
            bare.resolve_namespace(true, Some(""), "default").as_deref(),
            Some("default")
        );
    }

    #[test]
    fn test_cluster_scoped_ignores_namespace() {
        let id = ResourceId::new("", "v1", "Namespace", Some("stray"), "prod");
        assert_eq!(id.resolve_namespace(false, Some("x"), "default"), None);
    }

    #[test]
    fn test_is_crd() {
        let crd = ResourceId::new(CRD_GROUP, "v1", CRD_KIND, None, "widgets.example.com");
        assert!(crd.is_crd());
        assert!(!deployment(None).is_crd());
    }

    #[test]
    fn test_key_and_display() {
        let id = deployment(Some("prod"));
        assert_eq!(id.key(), "apps:v1:Deployment:prod:web");
        assert_eq!(id.to_string(), "Deployment/web (ns: prod)");
        assert_eq!(deployment(None).to_string(), "Deployment/web");
        assert_eq!(id.short(), "Deployment/web");
    }

    #[test]
    fn test_with_fallback_namespace() {
        assert_eq!(
            deployment(None).with_fallback_namespace("prod").namespace.as_deref(),
            Some("prod")
        );
        assert_eq!(
            deployment(Some("own")).with_fallback_namespace("prod").namespace.as_deref(),
            Some("own")
        );
    }

    #[test]
    fn test_serde_shape() {
        let id = deployment(None);
        let yaml = serde_yaml::to_string(&id).unwrap();
        assert!(!yaml.contains("namespace"));
        let back: ResourceId = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, id);
    }
}
