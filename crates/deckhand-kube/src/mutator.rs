//! Transformations applied to objects right before they are written
//!
//! Mutators are injected into the reconciliation client at construction
//! and run in registration order. A mutator declares which kinds of write
//! it cares about; an error from any mutator aborts the write for that
//! resource only.

use deckhand_core::ResourceId;
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{KubeError, Result};

/// Label identifying the tool that manages a resource
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Annotation holding the owning release name
pub const RELEASE_NAME_ANNOTATION: &str = "deckhand.io/release-name";
/// Annotation holding the owning release namespace
pub const RELEASE_NAMESPACE_ANNOTATION: &str = "deckhand.io/release-namespace";

/// Which kind of write is about to happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Create,
    Update,
    Apply,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Apply => write!(f, "apply"),
        }
    }
}

/// A transformation of the desired object before a write
pub trait ResourceMutator: Send + Sync {
    /// Name used in error messages
    fn name(&self) -> &str;

    /// Whether this mutator runs for the given write kind
    fn applies_to(&self, _kind: MutationKind) -> bool {
        true
    }

    /// Mutate the object in place
    fn mutate(
        &self,
        object: &mut DynamicObject,
        id: &ResourceId,
        kind: MutationKind,
    ) -> std::result::Result<(), String>;
}

/// Ordered list of mutators
#[derive(Clone, Default)]
pub struct MutatorPipeline {
    mutators: Vec<Arc<dyn ResourceMutator>>,
}

impl MutatorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mutator
    pub fn with(mut self, mutator: impl ResourceMutator + 'static) -> Self {
        self.mutators.push(Arc::new(mutator));
        self
    }

    pub fn len(&self) -> usize {
        self.mutators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }

    /// Run every applicable mutator on a copy of the object
    pub fn run(
        &self,
        object: &DynamicObject,
        id: &ResourceId,
        kind: MutationKind,
    ) -> Result<DynamicObject> {
        let mut mutated = object.clone();

        for mutator in self.mutators.iter().filter(|m| m.applies_to(kind)) {
            mutator
                .mutate(&mut mutated, id, kind)
                .map_err(|message| KubeError::MutatorFailed {
                    mutator: mutator.name().to_string(),
                    resource: id.to_string(),
                    message,
                })?;
        }

        Ok(mutated)
    }
}

/// Stamps release ownership on every written object
#[derive(Debug, Clone)]
pub struct ManagedByMutator {
    release_name: String,
    release_namespace: String,
}

impl ManagedByMutator {
    pub fn new(release_name: impl Into<String>, release_namespace: impl Into<String>) -> Self {
        Self {
            release_name: release_name.into(),
            release_namespace: release_namespace.into(),
        }
    }
}

impl ResourceMutator for ManagedByMutator {
    fn name(&self) -> &str {
        "managed-by"
    }

    fn mutate(
        &self,
        object: &mut DynamicObject,
        _id: &ResourceId,
        _kind: MutationKind,
    ) -> std::result::Result<(), String> {
        object
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(MANAGED_BY_LABEL.to_string(), "deckhand".to_string());

        let annotations = object
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new);
        annotations.insert(
            RELEASE_NAME_ANNOTATION.to_string(),
            self.release_name.clone(),
        );
        annotations.insert(
            RELEASE_NAMESPACE_ANNOTATION.to_string(),
            self.release_namespace.clone(),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg" },
        }))
        .unwrap()
    }

    fn id() -> ResourceId {
        ResourceId::new("", "v1", "ConfigMap", Some("prod"), "cfg")
    }

    struct Refuse;

    impl ResourceMutator for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        fn applies_to(&self, kind: MutationKind) -> bool {
            kind == MutationKind::Create
        }

        fn mutate(
            &self,
            _object: &mut DynamicObject,
            _id: &ResourceId,
            _kind: MutationKind,
        ) -> std::result::Result<(), String> {
            Err("no creates allowed".to_string())
        }
    }

    #[test]
    fn test_managed_by_stamps_metadata() {
        let pipeline = MutatorPipeline::new().with(ManagedByMutator::new("web", "prod"));
        let mutated = pipeline
            .run(&object(), &id(), MutationKind::Apply)
            .unwrap();

        let labels = mutated.metadata.labels.unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], "deckhand");
        let annotations = mutated.metadata.annotations.unwrap();
        assert_eq!(annotations[RELEASE_NAME_ANNOTATION], "web");
        assert_eq!(annotations[RELEASE_NAMESPACE_ANNOTATION], "prod");
    }

    #[test]
    fn test_mutator_filtered_by_kind() {
        let pipeline = MutatorPipeline::new().with(Refuse);
        assert!(pipeline.run(&object(), &id(), MutationKind::Update).is_ok());

        let err = pipeline
            .run(&object(), &id(), MutationKind::Create)
            .unwrap_err();
        assert!(matches!(err, KubeError::MutatorFailed { ref mutator, .. } if mutator == "refuse"));
    }

    #[test]
    fn test_original_untouched() {
        let original = object();
        let pipeline = MutatorPipeline::new().with(ManagedByMutator::new("web", "prod"));
        pipeline.run(&original, &id(), MutationKind::Apply).unwrap();
        assert!(original.metadata.labels.is_none());
    }
}
