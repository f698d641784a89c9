// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Errors returned by platform clients.

use thiserror::Error;

/// Result type for platform operations.
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Errors that can occur while talking to the remote platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PlatformError {
    /// The platform answered with a non-success HTTP status.
    #[error("Controller operation failed: {status} {description}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error detail reported by the platform.
        description: String,
    },

    /// The request never reached the platform or the connection dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PlatformError {
    /// Create an HTTP error with the given status.
    pub fn http(status: u16, description: impl Into<String>) -> Self {
        Self::Http {
            status,
            description: description.into(),
        }
    }

    /// 404 Not Found.
    pub fn not_found(description: impl Into<String>) -> Self {
        Self::http(404, description)
    }

    /// 403 Forbidden.
    pub fn forbidden(description: impl Into<String>) -> Self {
        Self::http(403, description)
    }

    /// 503 Service Unavailable.
    pub fn unavailable(description: impl Into<String>) -> Self {
        Self::http(503, description)
    }

    /// HTTP status code, if the error came from an HTTP response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the platform reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Description reported by the platform, or the rendered error.
    pub fn description(&self) -> String {
        match self {
            Self::Http { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
