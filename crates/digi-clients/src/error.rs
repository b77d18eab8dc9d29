// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for digi-clients.

use thiserror::Error;

/// Result type using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors returned by the external clients.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Request could not be sent or the response body could not be read.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote API answered with a non-success status.
    #[error("API error [{status}]: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// Remote API answered 2xx but reported failure in its envelope.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A long-running hypervisor task finished unsuccessfully.
    #[error("task {task} failed: {exit_status}")]
    TaskFailed {
        /// Task handle (UPID).
        task: String,
        /// Exit status reported by the hypervisor.
        exit_status: String,
    },

    /// A bounded polling loop ran out of attempts.
    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Response did not have the expected shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Image build failed.
    #[error("build failed: {0}")]
    Build(String),

    /// Invalid argument supplied by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the error means the resource is already absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    /// Whether the error is a bounded-poll timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(ClientError::NotFound("route-abc".into()).is_not_found());
        assert!(
            !ClientError::Api {
                status: 500,
                body: "boom".into()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_display_includes_status() {
        let err = ClientError::Api {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "API error [502]: bad gateway");
    }

    #[test]
    fn test_timeout_classification() {
        let err = ClientError::Timeout {
            what: "task".into(),
            attempts: 60,
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("60 attempts"));
    }
}
