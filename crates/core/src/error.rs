//! Store error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Source,
    Derived,
    Namespace,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Source => "AppIngress",
            ResourceKind::Derived => "Ingress",
            ResourceKind::Namespace => "Namespace",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: ResourceKind, key: String },
    /// Stale optimistic-concurrency token; the whole reconcile must be redone.
    #[error("conflict updating {kind} {key}: {message}")]
    Conflict { kind: ResourceKind, key: String, message: String },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ResourceKind, key: String },
    /// Network, availability or timeout. Outcome unknown.
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("invalid {kind} {key}: {message}")]
    Invalid { kind: ResourceKind, key: String, message: String },
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
}

impl StoreError {
    pub fn not_found(kind: ResourceKind, key: impl fmt::Display) -> Self {
        StoreError::NotFound { kind, key: key.to_string() }
    }

    pub fn conflict(kind: ResourceKind, key: impl fmt::Display, message: impl Into<String>) -> Self {
        StoreError::Conflict { kind, key: key.to_string(), message: message.into() }
    }

    pub fn already_exists(kind: ResourceKind, key: impl fmt::Display) -> Self {
        StoreError::AlreadyExists { kind, key: key.to_string() }
    }

    pub fn invalid(kind: ResourceKind, key: impl fmt::Display, message: impl Into<String>) -> Self {
        StoreError::Invalid { kind, key: key.to_string(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Worth retrying without any change to the inputs.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict { .. } | StoreError::AlreadyExists { .. } | StoreError::Transient(_) => true,
            StoreError::Api { code, .. } => *code >= 500 || *code == 429,
            StoreError::NotFound { .. } | StoreError::Invalid { .. } => false,
        }
    }
}
