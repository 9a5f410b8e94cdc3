//! Deckhand Core - cluster-agnostic types for the Deckhand deployment engine
//!
//! This crate provides the foundational types used throughout Deckhand:
//! - `ResourceId`: Canonical identity of a Kubernetes resource
//! - `Release`: A versioned set of resources and its lifecycle status

pub mod error;
pub mod release;
pub mod resource;

pub use error::{CoreError, Result};
pub use release::{Release, ReleaseStatus};
pub use resource::ResourceId;
