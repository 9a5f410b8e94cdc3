//! Desired resource manifests
//!
//! A `ResourceSpec` pairs the canonical `ResourceId` with the desired
//! `DynamicObject` that will be sent to the apiserver.

use deckhand_core::ResourceId;
use kube::{
    api::DynamicObject,
    core::{GroupVersionKind, TypeMeta},
};

use crate::error::{KubeError, Result};

/// A resource manifest ready for reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    /// Resource identity
    pub id: ResourceId,
    /// Desired object
    pub object: DynamicObject,
}

impl ResourceSpec {
    /// Build a spec from a dynamic object
    pub fn from_object(object: DynamicObject) -> Result<Self> {
        let types = object.types.as_ref().ok_or_else(|| {
            KubeError::InvalidManifest("resource missing apiVersion or kind".to_string())
        })?;
        let name = object.metadata.name.as_deref().ok_or_else(|| {
            KubeError::InvalidManifest(format!("{} is missing metadata.name", types.kind))
        })?;

        let id = ResourceId::from_api_version(
            &types.api_version,
            types.kind.clone(),
            object.metadata.namespace.as_deref(),
            name,
        )?;

        Ok(Self { id, object })
    }

    /// Parse a single YAML document
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let object: DynamicObject = serde_yaml::from_str(doc)
            .map_err(|e| KubeError::InvalidManifest(format!("YAML parse error: {}", e)))?;
        Self::from_object(object)
    }

    /// Parse a multi-document manifest, skipping empty and comment-only documents
    pub fn parse_manifest(manifest: &str) -> Result<Vec<Self>> {
        let mut specs = Vec::new();

        for (index, doc) in manifest.split("\n---").enumerate() {
            let doc = doc.trim().trim_start_matches("---").trim();
            if doc
                .lines()
                .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
            {
                continue;
            }

            let spec = Self::from_yaml(doc).map_err(|e| {
                KubeError::InvalidManifest(format!("failed to parse document {}: {}", index, e))
            })?;
            specs.push(spec);
        }

        Ok(specs)
    }

    /// Group-Version-Kind of this resource
    pub fn gvk(&self) -> GroupVersionKind {
        gvk_of(&self.id)
    }

    /// UID of the object, if it came from the cluster
    pub fn uid(&self) -> Option<&str> {
        self.object.metadata.uid.as_deref()
    }
}

/// Group-Version-Kind of a resource id
pub fn gvk_of(id: &ResourceId) -> GroupVersionKind {
    GroupVersionKind {
        group: id.group.clone(),
        version: id.version.clone(),
        kind: id.kind.clone(),
    }
}

/// TypeMeta of a resource id
pub fn type_meta_of(id: &ResourceId) -> TypeMeta {
    TypeMeta {
        api_version: id.api_version(),
        kind: id.kind.clone(),
    }
}
