//! Lifecycle state of the core

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Phase of the core lifecycle
///
/// ```text
/// NotRunning → Starting → Running → Stopping → FinalWrite → Stopped
///                  ↑                    │
///                  └──── Restarting ────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CoreState {
    #[default]
    NotRunning = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    FinalWrite = 4,
    Stopped = 5,
    Restarting = 6,
}

impl CoreState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CoreState::Starting,
            2 => CoreState::Running,
            3 => CoreState::Stopping,
            4 => CoreState::FinalWrite,
            5 => CoreState::Stopped,
            6 => CoreState::Restarting,
            _ => CoreState::NotRunning,
        }
    }

    /// Whether the core is on its way down
    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            CoreState::Stopping | CoreState::FinalWrite | CoreState::Restarting
        )
    }

    /// Canonical string form
    pub fn as_str(self) -> &'static str {
        match self {
            CoreState::NotRunning => "NOT_RUNNING",
            CoreState::Starting => "STARTING",
            CoreState::Running => "RUNNING",
            CoreState::Stopping => "STOPPING",
            CoreState::FinalWrite => "FINAL_WRITE",
            CoreState::Stopped => "STOPPED",
            CoreState::Restarting => "RESTARTING",
        }
    }
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state shared between the orchestrator and its config
#[derive(Debug, Clone, Default)]
pub struct SharedCoreState(Arc<AtomicU8>);

impl SharedCoreState {
    /// Create a new cell in `NotRunning`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn get(&self) -> CoreState {
        CoreState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Replace the state, returning the previous one
    pub fn set(&self, state: CoreState) -> CoreState {
        CoreState::from_u8(self.0.swap(state as u8, Ordering::SeqCst))
    }
}
