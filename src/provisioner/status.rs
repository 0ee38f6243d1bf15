use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of one provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerStatus {
    #[default]
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProvisionerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// `stopped` and `error` only leave through a fresh `starting`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn can_transition_to(self, to: ProvisionerStatus) -> bool {
        use ProvisionerStatus::*;
        matches!(
            (self, to),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Stopped, Starting)
        ) || (to == Error && !self.is_terminal())
    }
}

impl fmt::Display for ProvisionerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ProvisionerStatus,
    pub to: ProvisionerStatus,
}

/// Backend-agnostic status machine. Drivers never touch it; the
/// `Provisioner` facade records their outcomes here.
#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    current: ProvisionerStatus,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ProvisionerStatus {
        self.current
    }

    /// Moves to `to` or fails without mutating state.
    pub fn transition(&mut self, to: ProvisionerStatus) -> Result<(), InvalidTransition> {
        let from = self.current;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        tracing::debug!(%from, %to, "status transition");
        self.current = to;
        Ok(())
    }

    /// Marks the tracker failed unless it already sits in a terminal state.
    /// Returns whether the status changed.
    pub fn fail(&mut self) -> bool {
        self.transition(ProvisionerStatus::Error).is_ok()
    }
}
