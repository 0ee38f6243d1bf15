use async_trait::async_trait;

use super::error::ProvisionError;
use super::readiness::probe_tcp;
use super::retry::RetryPolicy;
use super::types::{BackendKind, BackendState, Endpoint, Provisioned, ResourceHandle};

/// Backend-specific half of the provisioner contract.
///
/// Drivers only talk to their backend. Retry, readiness polling and the
/// status machine live in [`setup`] and the `Provisioner` facade.
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the resource, or find the one a previous call created.
    /// Calling this twice must not produce a duplicate.
    async fn create(&self) -> Result<ResourceHandle, ProvisionError>;

    /// Current backend view of the resource. Not retried.
    async fn inspect(&self, handle: &ResourceHandle) -> Result<BackendState, ProvisionError>;

    /// Delete the resource. A resource that is already gone is a success.
    async fn teardown(&self, handle: &ResourceHandle) -> Result<(), ProvisionError>;

    /// Handle a `create` would produce, used to clean up after a create
    /// that failed part-way. `None` when the id is only known after launch.
    fn planned_handle(&self) -> Option<ResourceHandle> {
        None
    }

    /// Handle of whatever a `create` that failed or never returned may
    /// have left behind. Drivers whose ids are only known after launch
    /// look the resource up by its tag.
    async fn find_orphan(&self) -> Result<Option<ResourceHandle>, ProvisionError> {
        Ok(self.planned_handle())
    }

    /// Whether readiness also requires a TCP connect to the control port.
    fn probe_port(&self) -> bool {
        true
    }

    /// Point query: is the resource up right now.
    async fn is_running(&self, handle: &ResourceHandle) -> bool {
        match self.inspect(handle).await {
            Ok(state) => state.running,
            Err(e) => {
                tracing::debug!(backend = %self.kind(), %handle, error = %e, "inspect failed");
                false
            }
        }
    }
}

/// Policies for the two retried phases of `setup`.
#[derive(Debug, Clone, Copy)]
pub struct SetupPolicies {
    pub provision: RetryPolicy,
    pub readiness: RetryPolicy,
}

/// Create-or-find, then poll until the backend reports running and the
/// control port answers. `on_created` sees the handle as soon as it exists
/// so an aborted caller can still clean it up.
///
/// On failure whatever was created is torn down before the error is
/// returned.
pub async fn setup<F>(
    driver: &dyn Driver,
    policies: SetupPolicies,
    on_created: F,
) -> Result<Provisioned, ProvisionError>
where
    F: FnOnce(&ResourceHandle) + Send,
{
    let kind = driver.kind();

    let handle = match policies.provision.run("create", || driver.create()).await {
        Ok(handle) => handle,
        Err(e) => {
            let leftover = release_orphan(driver).await;
            return Err(ProvisionError::Setup {
                backend: kind,
                handle: leftover,
                source: Box::new(e.into()),
            });
        }
    };
    on_created(&handle);
    tracing::info!(backend = %kind, %handle, "resource created, waiting for readiness");

    match wait_ready(driver, &handle, policies.readiness).await {
        Ok(endpoint) => Ok(Provisioned { handle, endpoint }),
        Err(e) => {
            if let Err(cleanup_err) = cleanup(driver, &handle).await {
                tracing::warn!(backend = %kind, %handle, error = %cleanup_err, "cleanup after failed setup failed");
            }
            Err(ProvisionError::Setup {
                backend: kind,
                handle: Some(handle),
                source: Box::new(e),
            })
        }
    }
}

/// Polls `inspect` (and the control port when the driver asks for it)
/// under the readiness policy.
pub async fn wait_ready(
    driver: &dyn Driver,
    handle: &ResourceHandle,
    policy: RetryPolicy,
) -> Result<Endpoint, ProvisionError> {
    let endpoint = policy
        .run("readiness", || async {
            let state = driver.inspect(handle).await?;
            if !state.running {
                return Err(ProvisionError::NotReady(format!("{handle} is not running yet")));
            }
            let endpoint = state
                .endpoint
                .ok_or_else(|| ProvisionError::NotReady(format!("{handle} has no address yet")))?;
            if driver.probe_port() {
                probe_tcp(&endpoint).await?;
            }
            Ok::<_, ProvisionError>(endpoint)
        })
        .await?;
    tracing::info!(backend = %driver.kind(), %handle, %endpoint, "backend ready");
    Ok(endpoint)
}

async fn cleanup(driver: &dyn Driver, handle: &ResourceHandle) -> Result<(), ProvisionError> {
    tracing::warn!(backend = %driver.kind(), %handle, "setup failed, tearing down partial resource");
    driver.teardown(handle).await
}

/// Tears down what an unfinished `create` left behind. Returns the handle
/// when that resource could not be released.
pub(crate) async fn release_orphan(driver: &dyn Driver) -> Option<ResourceHandle> {
    let handle = match driver.find_orphan().await {
        Ok(Some(handle)) => handle,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(backend = %driver.kind(), error = %e, "could not look up partial resource");
            return driver.planned_handle();
        }
    };
    match cleanup(driver, &handle).await {
        Ok(()) => None,
        Err(e) => {
            tracing::warn!(backend = %driver.kind(), %handle, error = %e, "cleanup after failed setup failed");
            Some(handle)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory driver for facade and client tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    pub struct FakeDriver {
        pub endpoint: Endpoint,
        pub fail_create: AtomicBool,
        pub fail_teardown: AtomicBool,
        /// Number of inspect calls that report "not running" before ready.
        pub pending_polls: AtomicU32,
        pub hang_create: AtomicBool,
        /// Whether the resource name is known before `create` returns.
        pub planned: AtomicBool,
        pub running: AtomicBool,
        pub creates: AtomicU32,
        pub teardowns: Mutex<Vec<ResourceHandle>>,
    }

    impl FakeDriver {
        pub fn new(endpoint: Endpoint) -> Self {
            Self {
                endpoint,
                fail_create: AtomicBool::new(false),
                fail_teardown: AtomicBool::new(false),
                pending_polls: AtomicU32::new(0),
                hang_create: AtomicBool::new(false),
                planned: AtomicBool::new(false),
                running: AtomicBool::new(false),
                creates: AtomicU32::new(0),
                teardowns: Mutex::new(Vec::new()),
            }
        }

        pub fn handle() -> ResourceHandle {
            ResourceHandle::Docker {
                container: "fake".into(),
            }
        }

        pub fn teardown_count(&self) -> usize {
            self.teardowns.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Driver for FakeDriver {
        fn kind(&self) -> BackendKind {
            BackendKind::Docker
        }

        async fn create(&self) -> Result<ResourceHandle, ProvisionError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.hang_create.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(ProvisionError::backend(BackendKind::Docker, "daemon not reachable"));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(Self::handle())
        }

        async fn inspect(&self, _handle: &ResourceHandle) -> Result<BackendState, ProvisionError> {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(BackendState::gone());
            }
            let pending = self.pending_polls.load(Ordering::SeqCst);
            if pending > 0 {
                self.pending_polls.store(pending - 1, Ordering::SeqCst);
                return Ok(BackendState::pending(None));
            }
            Ok(BackendState::running(self.endpoint.clone()))
        }

        async fn teardown(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
            self.teardowns.lock().unwrap().push(handle.clone());
            self.running.store(false, Ordering::SeqCst);
            if self.fail_teardown.load(Ordering::SeqCst) {
                return Err(ProvisionError::backend(BackendKind::Docker, "delete rejected"));
            }
            Ok(())
        }

        fn planned_handle(&self) -> Option<ResourceHandle> {
            self.planned.load(Ordering::SeqCst).then(Self::handle)
        }

        fn probe_port(&self) -> bool {
            false
        }
    }
}
