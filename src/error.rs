// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the registry engine.
//!
//! Errors fall into three groups: state machine outcomes that the caller
//! handles per entry, persistence errors from the registry store, and
//! engine/configuration errors.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `InvalidTransition` | No | Event not permitted from the entry's current state |
//! | `Precondition` | No | Verification attempted before the entry is synced |
//! | `RaceLost` | Yes | Another worker claimed or changed the entry first |
//! | `NotFound` | No | No registry entry for this resource and site |
//! | `Store` | Yes | SQLite error (busy/locked already retried internally) |
//! | `Resource` | Yes | A `Replicable` lookup against the primary failed |
//! | `Config` | No | Settings rejected, or a resource type registered twice/not at all |
//! | `InvalidState` | No | Engine lifecycle violation |
//! | `Shutdown` | No | Engine is stopping or stopped |
//! | `Internal` | No | Broken internal invariant (a bug) |
//!
//! # Expected Outcomes
//!
//! [`RegistryError::RaceLost`] is not a failure: two workers racing for the
//! same entry always produce exactly one loser. Use
//! [`RegistryError::is_expected()`] to skip it without logging an error.

use crate::types::{ResourceId, ResourceType};
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while tracking, reconciling or sweeping registries.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A state machine event was applied to a state that does not permit it.
    ///
    /// Surfaced to the caller. The entry is skipped and retried later.
    #[error("Invalid {machine} transition: cannot {event} from {from}")]
    InvalidTransition {
        machine: &'static str,
        from: &'static str,
        event: &'static str,
    },

    /// Verification attempted on an entry whose sync has not completed.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Compare-and-set lost against a concurrent writer.
    ///
    /// Expected under concurrency. Treat as "already in progress".
    #[error("Race lost on resource {resource_id}: entry changed concurrently")]
    RaceLost { resource_id: ResourceId },

    /// No registry entry exists for the resource on this site.
    #[error("No {resource_type} registry entry for resource {resource_id}")]
    NotFound {
        resource_type: ResourceType,
        resource_id: ResourceId,
    },

    /// SQLite error from the registry store.
    #[error("Registry store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A resource type's primary-side lookup failed.
    #[error("Resource error ({resource_type}): {message}")]
    Resource {
        resource_type: ResourceType,
        message: String,
    },

    /// Rejected settings or resource type registration.
    #[error("Invalid registry configuration: {0}")]
    Config(String),

    /// Engine lifecycle violation (e.g. `start()` on a running engine).
    #[error("Engine is {actual}, operation requires {expected}")]
    InvalidState { expected: String, actual: String },

    /// The engine is stopping or stopped.
    #[error("Registry engine is shut down")]
    Shutdown,

    /// Broken internal invariant.
    #[error("Internal registry error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Create a resource lookup error.
    pub fn resource(resource_type: &ResourceType, message: impl Into<String>) -> Self {
        Self::Resource {
            resource_type: resource_type.clone(),
            message: message.into(),
        }
    }

    /// Whether a later attempt at the same operation may succeed.
    ///
    /// `Store` errors count: busy/locked was already retried, but the next
    /// pass runs against a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RaceLost { .. } | Self::Store(_) | Self::Resource { .. }
        )
    }

    /// Check if this is an expected concurrency outcome rather than a failure.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::RaceLost { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Precondition(_) => "precondition",
            Self::RaceLost { .. } => "race_lost",
            Self::NotFound { .. } => "not_found",
            Self::Store(_) => "store",
            Self::Resource { .. } => "resource",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
