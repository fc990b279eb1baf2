//! Supervisor lifecycle state machine.
//!
//! ```text
//! Starting → ValidatingApp → Running ⟲ (worker restarts)
//!                 │             ├──→ Draining → Stopped
//!                 └──→ Crashed ←┘ (boot failure halt)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use stevedore_shared::{StevedoreError, StevedoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorState {
    Starting,
    /// Importing the application before the port is bound.
    ValidatingApp,
    /// Port bound, workers supervised.
    Running,
    /// Listener closed, waiting for workers to exit.
    Draining,
    Stopped,
    Crashed,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Crashed)
    }

    pub fn can_transition_to(&self, target: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, target),
            (Starting, ValidatingApp)
                | (ValidatingApp, Running)
                | (ValidatingApp, Crashed)
                // Worker restarts keep the master running
                | (Running, Running)
                | (Running, Draining)
                | (Running, Crashed)
                | (Draining, Stopped)
        )
    }

    /// Move to `target`, rejecting transitions the machine does not allow.
    pub fn transition(&mut self, target: SupervisorState) -> StevedoreResult<()> {
        if !self.can_transition_to(target) {
            return Err(StevedoreError::InvalidState(format!(
                "supervisor cannot move from {self} to {target}"
            )));
        }
        tracing::debug!(from = %self, to = %target, "Supervisor state change");
        *self = target;
        Ok(())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Starting => "starting",
            SupervisorState::ValidatingApp => "validating-app",
            SupervisorState::Running => "running",
            SupervisorState::Draining => "draining",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
