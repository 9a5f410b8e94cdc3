//! Core error types

use thiserror::Error;

use crate::release::ReleaseStatus;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid apiVersion '{0}'")]
    InvalidApiVersion(String),

    #[error("resource is missing {field}")]
    MissingField { field: String },

    #[error("release '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: ReleaseStatus,
        to: ReleaseStatus,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
