//! Error types for the subscription cache.

use crate::types::{CacheKey, Operation};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Main error type for cache operations and observed failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl CacheError {
    /// The wrapped permission error, if this is one.
    pub fn as_permission(&self) -> Option<&PermissionError> {
        match self {
            CacheError::Permission(e) => Some(e),
            _ => None,
        }
    }

    /// Map a raw backend error for an operation on `path`.
    ///
    /// Permission denials are wrapped with the operation kind and path,
    /// everything else is passed through untouched.
    pub(crate) fn from_backend(error: BackendError, operation: Operation, path: &CacheKey) -> Self {
        if error.code == ErrorCode::PermissionDenied {
            CacheError::Permission(PermissionError {
                operation,
                path: path.clone(),
            })
        } else {
            CacheError::Backend(error)
        }
    }
}

/// A read rejected by the backend's security rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Missing or insufficient permissions: {operation} on {path}")]
pub struct PermissionError {
    pub operation: Operation,
    pub path: CacheKey,
}

/// Error reported by a backend subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: ErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }
}

/// Backend error discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PermissionDenied,
    Unavailable,
    InvalidArgument,
    ResourceExhausted,
    FailedPrecondition,
    Internal,
    /// Any code this crate has no name for.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::InvalidArgument => "invalid-argument",
            ErrorCode::ResourceExhausted => "resource-exhausted",
            ErrorCode::FailedPrecondition => "failed-precondition",
            ErrorCode::Internal => "internal",
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "permission-denied" => ErrorCode::PermissionDenied,
            "unavailable" => ErrorCode::Unavailable,
            "invalid-argument" => ErrorCode::InvalidArgument,
            "resource-exhausted" => ErrorCode::ResourceExhausted,
            "failed-precondition" => ErrorCode::FailedPrecondition,
            "internal" => ErrorCode::Internal,
            other => ErrorCode::Other(other.to_string()),
        })
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_is_wrapped() {
        let key = CacheKey::new("clients");
        let err = CacheError::from_backend(
            BackendError::permission_denied("rules rejected"),
            Operation::List,
            &key,
        );

        let perm = err.as_permission().unwrap();
        assert_eq!(perm.operation, Operation::List);
        assert_eq!(perm.path, key);
        assert_eq!(
            err.to_string(),
            "Missing or insufficient permissions: list on clients"
        );
    }

    #[test]
    fn test_other_codes_pass_through() {
        let key = CacheKey::new("clients/1");
        let raw = BackendError::unavailable("offline");
        let err = CacheError::from_backend(raw.clone(), Operation::Get, &key);

        assert_eq!(err, CacheError::Backend(raw));
        assert!(err.as_permission().is_none());
    }

    #[test]
    fn test_error_code_round_trips_through_str() {
        for code in ["permission-denied", "unavailable", "internal", "aborted"] {
            let parsed: ErrorCode = code.parse().unwrap();
            assert_eq!(parsed.as_str(), code);
        }
        assert_eq!("aborted".parse::<ErrorCode>().unwrap(), ErrorCode::Other("aborted".into()));
    }
}
