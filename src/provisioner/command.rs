//! Seam between drivers and the backend CLIs they shell out to.
//!
//! Drivers never spawn processes directly; they go through a
//! [`CommandRunner`] so tests can replay canned CLI output.

use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use super::error::ProvisionError;

/// Result of running one backend CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub program: String,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Converts a non-zero exit into `ProvisionError::CommandFailed`.
    pub fn check(self) -> Result<Self, ProvisionError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProvisionError::CommandFailed {
                program: self.program.clone(),
                code: self.exit_code,
                stderr: self.stderr_string(),
            })
        }
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProvisionError> {
        serde_json::from_slice(&self.stdout).map_err(|e| {
            ProvisionError::Parse(format!("{} returned invalid JSON: {e}", self.program))
        })
    }

    /// Whether a failed invocation means "that resource does not exist".
    pub fn is_not_found(&self) -> bool {
        if self.success() {
            return false;
        }
        let stderr = self.stderr_string().to_ascii_lowercase();
        NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m))
    }
}

// Wording used by kubectl, aws, az and gcloud.
const NOT_FOUND_MARKERS: &[&str] = &[
    "notfound",
    "not found",
    "invalidinstanceid.notfound",
    "resourcenotfound",
    "resourcegroupnotfound",
    "was not found",
    "does not exist",
];

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, ProvisionError>;
}

/// Runs CLIs on the local machine via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct LocalCommandRunner;

#[async_trait]
impl CommandRunner for LocalCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, ProvisionError> {
        tracing::debug!(program, args = ?args, "running backend command");

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        Ok(CommandOutput {
            program: program.to_string(),
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Escape a string for safe use inside a POSIX shell command.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
