//! Engine state types.
//!
//! Defines the lifecycle of the registry engine's background tasks.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ shutdown()                 │ shutdown()
//!    ↓                            ↓
//! Stopped ←────────────────── ShuttingDown
//! ```
//!
//! `start()` is only accepted from `Created`; a stopped engine is not
//! restarted. Open a new one on the same store instead.
//!
//! # State Descriptions
//!
//! - **Created**: After `RegistryEngine::open()`. The store is open and the
//!   per-entry operations already work; no background tasks run yet.
//! - **Running**: Reconciliation and reaper tasks are scheduled.
//! - **ShuttingDown**: `shutdown()` called. In-flight passes are finishing.
//! - **Stopped**: Tasks joined, store closed. Safe to drop.

use crate::resource::Replicable;
use crate::store::RegistryTable;
use crate::types::ResourceType;
use std::sync::Arc;

/// State of the registry engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine opened but background tasks not started.
    ///
    /// Call [`start()`](super::RegistryEngine::start) to begin periodic work.
    Created,

    /// Reconciliation and timeout sweeps are running.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Stopped.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A resource type plugged into the engine, with its registry table.
#[derive(Clone)]
pub struct RegisteredResource {
    pub resource: Arc<dyn Replicable>,
    pub table: RegistryTable,
}

impl RegisteredResource {
    pub fn resource_type(&self) -> &ResourceType {
        self.table.resource_type()
    }
}

impl std::fmt::Debug for RegisteredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredResource")
            .field("resource_type", self.resource_type())
            .finish()
    }
}

/// Snapshot for health endpoints. Collected without I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running with at least one registered resource type.
    pub ready: bool,
    pub resource_types: Vec<ResourceType>,
    pub reconcile_enabled: bool,
    pub reaper_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_engine_state_debug_matches_display() {
        for state in [
            EngineState::Created,
            EngineState::Running,
            EngineState::ShuttingDown,
            EngineState::Stopped,
        ] {
            assert_eq!(format!("{:?}", state), state.to_string());
        }
    }
}
