// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for digi-orchestrator.

use thiserror::Error;

use crate::persistence::PersistenceError;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Persistence operation failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Call to an external system failed.
    #[error("External call failed: {0}")]
    Client(#[from] digi_clients::ClientError),

    /// Cache or pub/sub backend failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job payload does not match its job type.
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// Job type is not one the worker knows.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// Service does not exist.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Some other entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Entity id.
        id: String,
    },

    /// No hypervisor node can take another VM.
    #[error("No active hypervisor node has capacity")]
    NoCapacity,

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether retrying the job cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidPayload(_)
                | Error::UnknownJobType(_)
                | Error::InvalidRequest(_)
                | Error::ServiceNotFound(_)
                | Error::NotFound { .. }
        )
    }
}

/// Result type using orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;
