// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for multiapps-core.
//!
//! Every failure a step can raise is a [`CoreError`]. Its [`ErrorKind`] is what
//! the scheduler looks at: only platform errors are retried, content errors
//! fail the process for good.

use std::fmt;

use multiapps_platform::PlatformError;
use serde::{Deserialize, Serialize};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad input: descriptor mismatch, version rule violation, missing attribute.
    ContentError,
    /// Transient remote failure, retried by the scheduler.
    PlatformError,
    /// The remote platform refused the operation (403).
    PermissionError,
    /// The remote resource does not exist.
    NotFound,
    /// Local failure: persistence, serialization, lock conflicts, aborts.
    InternalError,
}

impl ErrorKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentError => "CONTENT_ERROR",
            Self::PlatformError => "PLATFORM_ERROR",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether the scheduler's job retry should pick this error up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PlatformError)
    }
}

/// Core errors that can occur while executing steps.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// The deployment content is invalid for the requested operation.
    Content {
        /// Human-readable reason.
        message: String,
    },

    /// A remote platform call failed.
    Platform {
        /// HTTP status, if the platform answered.
        status: Option<u16>,
        /// Human-readable reason.
        message: String,
    },

    /// The remote platform refused the operation.
    Permission {
        /// Human-readable reason.
        message: String,
    },

    /// A remote resource expected to exist is missing.
    NotFound {
        /// Resource kind (application, service, ...).
        resource: String,
        /// Resource name.
        name: String,
    },

    /// Another process holds the lock on a resource.
    Conflict {
        /// The contested resource key.
        resource: String,
        /// The process holding the lock.
        holder: String,
    },

    /// The owning process was aborted by an operator.
    Aborted {
        /// The aborted process.
        process_id: String,
    },

    /// A context variable is missing or cannot be (de)serialized.
    Variable {
        /// The variable name.
        name: String,
        /// Error details.
        details: String,
    },

    /// Input validation failed.
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for a content error.
    pub fn content(message: impl Into<String>) -> Self {
        Self::Content {
            message: message.into(),
        }
    }

    /// Shorthand for a platform error without a status.
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            status: None,
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Content { .. } => "CONTENT_ERROR",
            Self::Platform { .. } => "PLATFORM_ERROR",
            Self::Permission { .. } => "PERMISSION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICTING_PROCESS",
            Self::Aborted { .. } => "PROCESS_ABORTED",
            Self::Variable { .. } => "VARIABLE_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Classification used by the scheduler and the step runner.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Content { .. } | Self::Validation { .. } => ErrorKind::ContentError,
            Self::Platform { status: Some(404), .. } => ErrorKind::NotFound,
            Self::Platform { .. } => ErrorKind::PlatformError,
            Self::Permission { .. } => ErrorKind::PermissionError,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. }
            | Self::Aborted { .. }
            | Self::Variable { .. }
            | Self::Database { .. } => ErrorKind::InternalError,
        }
    }

    /// Prefix the message with a step-level description, keeping the variant
    /// and therefore the [`ErrorKind`].
    ///
    /// Aborts and lock conflicts are returned unchanged.
    pub fn with_prefix(self, prefix: &str) -> Self {
        let prefixed = |text: String| format!("{}: {}", prefix, text);
        match self {
            Self::Content { message } => Self::Content {
                message: prefixed(message),
            },
            Self::Platform { status, message } => Self::Platform {
                status,
                message: prefixed(message),
            },
            Self::Permission { message } => Self::Permission {
                message: prefixed(message),
            },
            Self::NotFound { resource, name } => Self::NotFound {
                resource: prefixed(resource),
                name,
            },
            Self::Variable { name, details } => Self::Variable {
                name,
                details: prefixed(details),
            },
            Self::Validation { field, message } => Self::Validation {
                field,
                message: prefixed(message),
            },
            Self::Database { operation, details } => Self::Database {
                operation,
                details: prefixed(details),
            },
            other @ (Self::Aborted { .. } | Self::Conflict { .. }) => other,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content { message } => write!(f, "{}", message),
            Self::Platform { message, .. } => write!(f, "{}", message),
            Self::Permission { message } => write!(f, "{}", message),
            Self::NotFound { resource, name } => {
                write!(f, "{} '{}' not found", resource, name)
            }
            Self::Conflict { resource, holder } => {
                write!(
                    f,
                    "Resource '{}' is locked by conflicting process '{}'",
                    resource, holder
                )
            }
            Self::Aborted { process_id } => {
                write!(f, "Process '{}' was aborted", process_id)
            }
            Self::Variable { name, details } => {
                write!(f, "Variable '{}': {}", name, details)
            }
            Self::Validation { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Database { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

/// Maps the platform's HTTP status onto the error taxonomy.
///
/// 400 and 422 are content errors, 403 a permission error; 404 keeps the
/// platform variant but classifies as [`ErrorKind::NotFound`].
impl From<PlatformError> for CoreError {
    fn from(err: PlatformError) -> Self {
        let message = err.to_string();
        match err.status() {
            Some(400) | Some(422) => Self::Content { message },
            Some(403) => Self::Permission { message },
            status => Self::Platform { status, message },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Variable {
            name: "<json>".to_string(),
            details: err.to_string(),
        }
    }
}
