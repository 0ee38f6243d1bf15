//! Boundary between the daemon and the machine it controls.
//!
//! Input injection and screen capture are provided by an external backend
//! implementing [`Computer`]. [`ShellComputer`] covers the part the daemon
//! can do on its own: running shell commands.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::{
    Action, CommandAction, KeyboardStateObservation, MouseStateObservation, ScreenshotObservation,
};

#[derive(thiserror::Error, Debug)]
pub enum ComputerError {
    #[error("{0} is not supported by this computer")]
    Unsupported(&'static str),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with code {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Computer: Send + Sync {
    async fn screenshot(&self) -> Result<ScreenshotObservation, ComputerError>;

    async fn mouse_state(&self) -> Result<MouseStateObservation, ComputerError>;

    async fn keyboard_state(&self) -> Result<KeyboardStateObservation, ComputerError>;

    async fn execute(&self, action: Action) -> Result<(), ComputerError>;

    /// Return the machine to a clean state between episodes.
    async fn reset(&self) -> Result<(), ComputerError>;
}

/// Runs `command` actions through the platform shell. Everything that needs
/// an input or capture backend reports `Unsupported`.
#[derive(Debug, Clone, Default)]
pub struct ShellComputer;

impl ShellComputer {
    async fn run(&self, action: CommandAction) -> Result<(), ComputerError> {
        if action.command.trim().is_empty() {
            return Err(ComputerError::InvalidAction("command must not be empty".into()));
        }

        let mut cmd = if cfg!(windows) {
            let mut c = tokio::process::Command::new("cmd");
            c.arg("/C").arg(&action.command);
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(&action.command);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let output = match action.timeout.filter(|t| t.is_finite() && *t > 0.0) {
            Some(secs) => {
                let limit = Duration::from_secs_f64(secs);
                tokio::time::timeout(limit, child.wait_with_output())
                    .await
                    .map_err(|_| ComputerError::Timeout(limit))??
            }
            None => child.wait_with_output().await?,
        };

        if output.status.success() {
            tracing::debug!(command = %action.command, "command succeeded");
            Ok(())
        } else {
            Err(ComputerError::CommandFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Computer for ShellComputer {
    async fn screenshot(&self) -> Result<ScreenshotObservation, ComputerError> {
        Err(ComputerError::Unsupported("screenshot"))
    }

    async fn mouse_state(&self) -> Result<MouseStateObservation, ComputerError> {
        Err(ComputerError::Unsupported("mouse_state"))
    }

    async fn keyboard_state(&self) -> Result<KeyboardStateObservation, ComputerError> {
        Err(ComputerError::Unsupported("keyboard_state"))
    }

    async fn execute(&self, action: Action) -> Result<(), ComputerError> {
        match action {
            Action::Command(command) => self.run(command).await,
            other => Err(ComputerError::Unsupported(other.name())),
        }
    }

    async fn reset(&self) -> Result<(), ComputerError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording computer for daemon and client tests.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::{KeyboardKey, MouseButton};

    #[derive(Default)]
    pub struct RecordingComputer {
        pub actions: Mutex<Vec<Action>>,
        pub resets: Mutex<u32>,
        /// Commands containing this substring fail.
        pub fail_marker: Option<String>,
    }

    impl RecordingComputer {
        pub fn commands(&self) -> Vec<String> {
            self.actions
                .lock()
                .unwrap()
                .iter()
                .filter_map(|a| match a {
                    Action::Command(c) => Some(c.command.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Computer for RecordingComputer {
        async fn screenshot(&self) -> Result<ScreenshotObservation, ComputerError> {
            Ok(ScreenshotObservation {
                screenshot: "iVBORw0KGgo=".into(),
            })
        }

        async fn mouse_state(&self) -> Result<MouseStateObservation, ComputerError> {
            Ok(MouseStateObservation {
                buttons: BTreeMap::from([
                    (MouseButton::Left, false),
                    (MouseButton::Right, false),
                    (MouseButton::Middle, false),
                ]),
                position: (100, 200),
            })
        }

        async fn keyboard_state(&self) -> Result<KeyboardStateObservation, ComputerError> {
            Ok(KeyboardStateObservation {
                keys: BTreeMap::from([(KeyboardKey::Shift, true)]),
            })
        }

        async fn execute(&self, action: Action) -> Result<(), ComputerError> {
            let fails = match (&action, &self.fail_marker) {
                (Action::Command(c), Some(marker)) => c.command.contains(marker.as_str()),
                _ => false,
            };
            self.actions.lock().unwrap().push(action);
            if fails {
                return Err(ComputerError::CommandFailed {
                    code: Some(1),
                    stderr: "scripted failure".into(),
                });
            }
            Ok(())
        }

        async fn reset(&self) -> Result<(), ComputerError> {
            *self.resets.lock().unwrap() += 1;
            Ok(())
        }
    }
}
