use std::io;
use std::time::Duration;

use super::status::InvalidTransition;
use super::types::{BackendKind, Endpoint, ResourceHandle};

/// Errors from provisioning operations.
///
/// Drivers map their backend failures into these variants. Whether the
/// retry loop tries again is decided by [`ProvisionError::is_retryable`].
#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{backend} backend error: {message}")]
    Backend {
        backend: BackendKind,
        message: String,
    },

    #[error("`{program}` failed: code={code:?}, stderr={stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource not ready: {0}")]
    NotReady(String),

    #[error("control port {endpoint} unreachable: {message}")]
    Unreachable { endpoint: Endpoint, message: String },

    #[error("{backend} driver cannot operate on {handle}")]
    HandleMismatch {
        backend: BackendKind,
        handle: ResourceHandle,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected backend output: {0}")]
    Parse(String),

    #[error(transparent)]
    Retry(#[from] Box<RetryError>),

    #[error("{backend} setup failed (handle: {}): {source}", display_handle(.handle))]
    Setup {
        backend: BackendKind,
        handle: Option<ResourceHandle>,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("{backend} teardown of {handle} failed: {source}")]
    Teardown {
        backend: BackendKind,
        handle: ResourceHandle,
        #[source]
        source: Box<ProvisionError>,
    },
}

fn display_handle(handle: &Option<ResourceHandle>) -> String {
    handle
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl ProvisionError {
    pub fn backend(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt. Ordering and
    /// configuration mistakes never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { .. }
            | Self::CommandFailed { .. }
            | Self::NotReady(_)
            | Self::Unreachable { .. }
            | Self::Timeout(_)
            | Self::Io(_) => true,
            Self::InvalidTransition(_)
            | Self::Config(_)
            | Self::NotFound(_)
            | Self::HandleMismatch { .. }
            | Self::Parse(_)
            | Self::Retry(_)
            | Self::Setup { .. }
            | Self::Teardown { .. } => false,
        }
    }

    /// The handle a failed setup left behind, if any.
    pub fn handle(&self) -> Option<&ResourceHandle> {
        match self {
            Self::Setup { handle, .. } => handle.as_ref(),
            Self::Teardown { handle, .. } => Some(handle),
            Self::HandleMismatch { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Walks `Setup`/`Retry` wrappers down to the last backend error.
    pub fn root(&self) -> &ProvisionError {
        match self {
            Self::Setup { source, .. } | Self::Teardown { source, .. } => source.root(),
            Self::Retry(retry) => match retry.last() {
                Some(last) => last.root(),
                None => self,
            },
            _ => self,
        }
    }
}

/// Why a retried operation gave up.
#[derive(thiserror::Error, Debug)]
pub enum RetryError {
    #[error("{operation}: gave up after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: ProvisionError,
    },

    #[error("{operation}: deadline of {timeout:?} exceeded after {attempts} attempts{}", last_suffix(.last))]
    DeadlineExceeded {
        operation: String,
        attempts: u32,
        timeout: Duration,
        last: Option<ProvisionError>,
    },

    #[error("{operation}: {source}")]
    Fatal {
        operation: String,
        #[source]
        source: ProvisionError,
    },
}

fn last_suffix(last: &Option<ProvisionError>) -> String {
    match last {
        Some(e) => format!(": {e}"),
        None => String::new(),
    }
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => *attempts,
            Self::Fatal { .. } => 1,
        }
    }

    pub fn last(&self) -> Option<&ProvisionError> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::DeadlineExceeded { last, .. } => last.as_ref(),
            Self::Fatal { source, .. } => Some(source),
        }
    }
}

impl From<RetryError> for ProvisionError {
    fn from(err: RetryError) -> Self {
        ProvisionError::Retry(Box::new(err))
    }
}
