//! Registry state machines.
//!
//! Two independent axes per registry entry, each an explicit transition table.
//!
//! # Sync
//!
//! ```text
//!            start              succeed
//! Pending ─────────→ Started ─────────→ Synced
//!    ↑  ↖              │                  │
//!    │   └── reset ────┼── reset ─────────┘
//!    │                 │ fail
//!    │    start        ↓
//!    └──────────── Failed
//!         (reset)
//! ```
//!
//! # Verification
//!
//! ```text
//!            start               succeed
//! Pending ─────────→ Started ──────────→ Succeeded
//!    ↑                 │   ↑                 │
//!    │                 │   │ start           │
//!    │           fail  ↓   │                 │
//!    │               Failed                  │
//!    └──────────── reset (from any) ─────────┘
//! ```
//!
//! The tables here only know about their own axis. The cross-axis rule
//! (verification needs `Synced`) is enforced by
//! [`RegistryEntry`](crate::entry::RegistryEntry).

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sync lifecycle of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending = 0,
    Started = 1,
    Synced = 2,
    Failed = 3,
}

/// Events driving [`SyncState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEvent {
    Start,
    Succeed,
    Fail,
    Reset,
}

impl SyncState {
    pub const ALL: [SyncState; 4] = [
        SyncState::Pending,
        SyncState::Started,
        SyncState::Synced,
        SyncState::Failed,
    ];

    /// Apply `event`, returning the next state.
    pub fn on(self, event: SyncEvent) -> Result<SyncState> {
        use SyncEvent::*;
        use SyncState::*;
        match (self, event) {
            (Pending | Failed, Start) => Ok(Started),
            (Started, Succeed) => Ok(Synced),
            (Started, Fail) => Ok(Failed),
            (_, Reset) => Ok(Pending),
            (from, event) => Err(RegistryError::InvalidTransition {
                machine: "sync",
                from: from.as_str(),
                event: event.as_str(),
            }),
        }
    }

    /// Integer stored in the registry table.
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(SyncState::Pending),
            1 => Some(SyncState::Started),
            2 => Some(SyncState::Synced),
            3 => Some(SyncState::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Started => "started",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }
}

impl SyncEvent {
    pub const ALL: [SyncEvent; 4] = [
        SyncEvent::Start,
        SyncEvent::Succeed,
        SyncEvent::Fail,
        SyncEvent::Reset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncEvent::Start => "start",
            SyncEvent::Succeed => "succeed",
            SyncEvent::Fail => "fail",
            SyncEvent::Reset => "reset",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checksum verification lifecycle of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Pending = 0,
    Started = 1,
    Succeeded = 2,
    Failed = 3,
}

/// Events driving [`VerificationState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationEvent {
    Start,
    Succeed,
    Fail,
    Reset,
}

impl VerificationState {
    pub const ALL: [VerificationState; 4] = [
        VerificationState::Pending,
        VerificationState::Started,
        VerificationState::Succeeded,
        VerificationState::Failed,
    ];

    /// Apply `event`, returning the next state.
    pub fn on(self, event: VerificationEvent) -> Result<VerificationState> {
        use VerificationEvent::*;
        use VerificationState::*;
        match (self, event) {
            (Pending | Failed, Start) => Ok(Started),
            (Started, Succeed) => Ok(Succeeded),
            (Started, Fail) => Ok(Failed),
            (_, Reset) => Ok(Pending),
            (from, event) => Err(RegistryError::InvalidTransition {
                machine: "verification",
                from: from.as_str(),
                event: event.as_str(),
            }),
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(VerificationState::Pending),
            1 => Some(VerificationState::Started),
            2 => Some(VerificationState::Succeeded),
            3 => Some(VerificationState::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationState::Pending => "pending",
            VerificationState::Started => "started",
            VerificationState::Succeeded => "succeeded",
            VerificationState::Failed => "failed",
        }
    }
}

impl VerificationEvent {
    pub const ALL: [VerificationEvent; 4] = [
        VerificationEvent::Start,
        VerificationEvent::Succeed,
        VerificationEvent::Fail,
        VerificationEvent::Reset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationEvent::Start => "start",
            VerificationEvent::Succeed => "succeed",
            VerificationEvent::Fail => "fail",
            VerificationEvent::Reset => "reset",
        }
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
