use async_trait::async_trait;

use super::DaemonLaunch;
use crate::provisioner::driver::Driver;
use crate::provisioner::error::ProvisionError;
use crate::provisioner::types::{BackendKind, BackendState, Endpoint, ResourceHandle};

/// The operator starts the daemon by hand. Nothing is created or deleted.
pub struct ManualDriver {
    launch: DaemonLaunch,
}

impl ManualDriver {
    pub fn new(launch: DaemonLaunch) -> Self {
        Self { launch }
    }

    pub fn instructions(&self) -> String {
        format!(
            "Start the daemon on the target machine:\n\n    \
             DAEMON_TOKEN=<token> commandrig daemon --port {port}\n\n\
             then point the client at http://<host>:{port} with the same token.",
            port = self.launch.port
        )
    }
}

#[async_trait]
impl Driver for ManualDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Manual
    }

    async fn create(&self) -> Result<ResourceHandle, ProvisionError> {
        println!("{}", self.instructions());
        tracing::info!(port = self.launch.port, "manual backend: waiting on operator");
        Ok(ResourceHandle::Manual)
    }

    async fn inspect(&self, handle: &ResourceHandle) -> Result<BackendState, ProvisionError> {
        match handle {
            ResourceHandle::Manual => Ok(BackendState::running(Endpoint::new(
                "localhost",
                self.launch.port,
            ))),
            other => Err(ProvisionError::HandleMismatch {
                backend: BackendKind::Manual,
                handle: other.clone(),
            }),
        }
    }

    async fn teardown(&self, _handle: &ResourceHandle) -> Result<(), ProvisionError> {
        Ok(())
    }

    // Liveness is the client's job: the operator may not have started it yet.
    fn probe_port(&self) -> bool {
        false
    }
}
