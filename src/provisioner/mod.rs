pub mod backends;
pub mod command;
pub mod driver;
pub mod error;
pub mod readiness;
pub mod retry;
pub mod status;
pub mod types;

pub use command::{CommandOutput, CommandRunner, LocalCommandRunner};
pub use driver::{Driver, SetupPolicies};
pub use error::{ProvisionError, RetryError};
pub use retry::RetryPolicy;
pub use status::{InvalidTransition, ProvisionerStatus, StatusTracker};
pub use types::*;

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use backends::DaemonLaunch;

/// What the facade knows about its one resource.
#[derive(Debug, Clone, Default)]
struct Lifecycle {
    tracker: StatusTracker,
    handle: Option<ResourceHandle>,
    endpoint: Option<Endpoint>,
}

/// Owns one backend resource's create / poll / destroy lifecycle.
///
/// `setup` and `teardown` are serialized: a teardown issued while a setup
/// is in flight waits for the setup's outcome. Status reads never wait.
#[derive(Clone)]
pub struct Provisioner {
    config: Arc<ProvisionerConfig>,
    token: String,
    driver: Arc<dyn Driver>,
    policies: SetupPolicies,
    state: Arc<watch::Sender<Lifecycle>>,
    serial: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("backend", &self.driver.kind())
            .field("port", &self.config.port)
            .field("status", &self.get_status())
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Build a provisioner for the configured backend. Docker is driven
    /// through the Engine API, the cloud backends through their CLIs.
    pub fn new(config: ProvisionerConfig) -> Result<Self, ProvisionError> {
        Self::with_runner(config, Arc::new(LocalCommandRunner))
    }

    pub fn with_runner(
        config: ProvisionerConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ProvisionError> {
        let token = resolve_token(&config)?;
        let launch = DaemonLaunch {
            port: config.port,
            token: token.clone(),
        };
        let driver = backends::build_driver(&config, launch, runner)?;
        tracing::info!(backend = %driver.kind(), port = config.port, "provisioner initialized");
        Ok(Self::assemble(config, token, driver))
    }

    /// Use a caller-supplied driver.
    pub fn from_driver(config: ProvisionerConfig, driver: Arc<dyn Driver>) -> Result<Self, ProvisionError> {
        let token = resolve_token(&config)?;
        Ok(Self::assemble(config, token, driver))
    }

    fn assemble(config: ProvisionerConfig, token: String, driver: Arc<dyn Driver>) -> Self {
        let policies = SetupPolicies {
            provision: config.retry.provision.into(),
            readiness: config.retry.readiness.into(),
        };
        let (state, _) = watch::channel(Lifecycle::default());
        Self {
            config: Arc::new(config),
            token,
            driver,
            policies,
            state: Arc::new(state),
            serial: Arc::new(Mutex::new(())),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.driver.kind()
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Token the daemon was (or will be) launched with.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn readiness_policy(&self) -> RetryPolicy {
        self.policies.readiness
    }

    pub fn get_status(&self) -> ProvisionerStatus {
        self.state.borrow().tracker.current()
    }

    pub fn handle(&self) -> Option<ResourceHandle> {
        self.state.borrow().handle.clone()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.state.borrow().endpoint.clone()
    }

    /// Direct point query against the backend; `false` without a handle.
    pub async fn is_running(&self) -> bool {
        match self.handle() {
            Some(handle) => self.driver.is_running(&handle).await,
            None => false,
        }
    }

    fn transition(&self, to: ProvisionerStatus) -> Result<(), InvalidTransition> {
        let mut result = Ok(());
        self.state.send_if_modified(|s| {
            result = s.tracker.transition(to);
            result.is_ok()
        });
        result
    }

    /// Bring the backend up and wait until its control port is reachable.
    ///
    /// Returns the existing resource when it is already running. After a
    /// failure the status is `error` and the error carries any handle that
    /// could not be cleaned up.
    pub async fn setup(&self) -> Result<Provisioned, ProvisionError> {
        let serial = self.serial.clone().lock_owned().await;

        let (status, existing) = {
            let s = self.state.borrow();
            (s.tracker.current(), s.handle.clone().zip(s.endpoint.clone()))
        };
        if status == ProvisionerStatus::Running {
            if let Some((handle, endpoint)) = existing {
                if self.driver.is_running(&handle).await {
                    tracing::debug!(backend = %self.kind(), %handle, "already running");
                    return Ok(Provisioned { handle, endpoint });
                }
                tracing::warn!(backend = %self.kind(), %handle, "resource stopped behind our back, recreating");
            }
            self.state.send_modify(|s| {
                s.tracker.fail();
            });
        }

        self.transition(ProvisionerStatus::Starting)?;
        self.state.send_modify(|s| s.endpoint = None);

        let in_flight = InFlight {
            serial: Some(serial),
            driver: self.driver.clone(),
            state: self.state.clone(),
        };
        let state = self.state.clone();
        let result = driver::setup(self.driver.as_ref(), self.policies, move |handle| {
            state.send_modify(|s| s.handle = Some(handle.clone()));
        })
        .await;
        let _serial = in_flight.finish();

        match result {
            Ok(provisioned) => {
                self.state.send_modify(|s| {
                    s.handle = Some(provisioned.handle.clone());
                    s.endpoint = Some(provisioned.endpoint.clone());
                });
                self.transition(ProvisionerStatus::Running)?;
                tracing::info!(
                    backend = %self.kind(),
                    handle = %provisioned.handle,
                    endpoint = %provisioned.endpoint,
                    "provisioned"
                );
                Ok(provisioned)
            }
            Err(e) => {
                // The driver already attempted cleanup of anything it created.
                self.state.send_modify(|s| {
                    s.tracker.fail();
                    s.handle = None;
                    s.endpoint = None;
                });
                tracing::error!(backend = %self.kind(), error = %e, "setup failed");
                Err(e)
            }
        }
    }

    /// Release the backend resource. The status always ends in `stopped`;
    /// a failed driver teardown is reported, not hidden.
    pub async fn teardown(&self) -> Result<(), ProvisionError> {
        let _serial = self.serial.lock().await;

        let Some(handle) = self.handle() else {
            tracing::debug!(backend = %self.kind(), status = %self.get_status(), "nothing to tear down");
            return Ok(());
        };
        let stopping = self.transition(ProvisionerStatus::Stopping).is_ok();

        let mut result = self.driver.teardown(&handle).await;
        if result.is_ok() && self.config.teardown == TeardownPolicy::Confirm {
            result = self.confirm_gone(&handle).await;
        }

        self.state.send_modify(|s| {
            s.handle = None;
            s.endpoint = None;
            if stopping {
                let _ = s.tracker.transition(ProvisionerStatus::Stopped);
            }
        });

        match result {
            Ok(()) => {
                tracing::info!(backend = %self.kind(), %handle, "torn down");
                Ok(())
            }
            Err(e) => {
                tracing::error!(backend = %self.kind(), %handle, error = %e, "teardown failed, resource may need manual cleanup");
                Err(ProvisionError::Teardown {
                    backend: self.kind(),
                    handle,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn confirm_gone(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
        self.policies
            .readiness
            .run("confirm teardown", || async {
                if self.driver.is_running(handle).await {
                    Err(ProvisionError::NotReady(format!("{handle} is still running")))
                } else {
                    Ok(())
                }
            })
            .await?;
        Ok(())
    }
}

fn resolve_token(config: &ProvisionerConfig) -> Result<String, ProvisionError> {
    match config.token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => crate::daemon::auth::generate_token()
            .map_err(|e| ProvisionError::Config(format!("failed to generate token: {e}"))),
    }
}

/// Held for the duration of a setup. Dropping it before `finish` means the
/// caller abandoned the setup: mark the status failed and tear down what
/// the setup created, still holding the serial lock so a following
/// teardown or setup waits for the cleanup. When `create` had not returned
/// yet, the driver is asked for what it may have left behind.
struct InFlight {
    serial: Option<OwnedMutexGuard<()>>,
    driver: Arc<dyn Driver>,
    state: Arc<watch::Sender<Lifecycle>>,
}

impl InFlight {
    fn finish(mut self) -> Option<OwnedMutexGuard<()>> {
        self.serial.take()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(serial) = self.serial.take() else {
            return;
        };

        let mut recorded = None;
        self.state.send_modify(|s| {
            s.tracker.fail();
            recorded = s.handle.take();
            s.endpoint = None;
        });

        let driver = self.driver.clone();
        match &recorded {
            Some(handle) => {
                tracing::warn!(backend = %driver.kind(), %handle, "setup aborted, tearing down partial resource");
            }
            None => tracing::warn!(backend = %driver.kind(), "setup aborted during create, looking for partial resource"),
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(backend = %driver.kind(), "no runtime to clean up aborted setup");
            return;
        };
        runtime.spawn(async move {
            let _serial = serial;
            match recorded {
                Some(handle) => {
                    if let Err(e) = driver.teardown(&handle).await {
                        tracing::error!(backend = %driver.kind(), %handle, error = %e, "cleanup after aborted setup failed");
                    }
                }
                None => {
                    if let Some(handle) = driver::release_orphan(driver.as_ref()).await {
                        tracing::error!(backend = %driver.kind(), %handle, "aborted setup left a resource behind");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::driver::testing::FakeDriver;
    use super::*;

    fn fast_retry() -> RetrySettings {
        let phase = RetryConfig {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            timeout_secs: 5,
        };
        RetrySettings {
            provision: phase,
            readiness: phase,
        }
    }

    fn provisioner(driver: Arc<FakeDriver>) -> Provisioner {
        let config = ProvisionerConfig::new(Backend::Manual)
            .with_token("test-token")
            .with_retry(fast_retry());
        Provisioner::from_driver(config, driver).unwrap()
    }

    fn fake() -> Arc<FakeDriver> {
        Arc::new(FakeDriver::new(Endpoint::new("127.0.0.1", 8000)))
    }

    #[tokio::test(start_paused = true)]
    async fn setup_then_teardown_walks_the_status_machine() {
        let driver = fake();
        let p = provisioner(driver.clone());
        assert_eq!(p.get_status(), ProvisionerStatus::NotStarted);
        assert!(!p.is_running().await);

        let provisioned = p.setup().await.unwrap();
        assert_eq!(p.get_status(), ProvisionerStatus::Running);
        assert_eq!(p.handle(), Some(provisioned.handle.clone()));
        assert_eq!(p.endpoint(), Some(Endpoint::new("127.0.0.1", 8000)));
        assert!(p.is_running().await);

        p.teardown().await.unwrap();
        assert_eq!(p.get_status(), ProvisionerStatus::Stopped);
        assert_eq!(p.handle(), None);
        assert!(!p.is_running().await);
        assert_eq!(driver.teardown_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_setup_reuses_running_resource() {
        let driver = fake();
        let p = provisioner(driver.clone());
        let first = p.setup().await.unwrap();
        let second = p.setup().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(driver.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_setup_ends_in_error_and_can_be_retried() {
        let driver = fake();
        driver.fail_create.store(true, Ordering::SeqCst);
        let p = provisioner(driver.clone());

        let err = p.setup().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Setup { .. }), "{err}");
        assert_eq!(p.get_status(), ProvisionerStatus::Error);
        assert_eq!(p.handle(), None);

        driver.fail_create.store(false, Ordering::SeqCst);
        p.setup().await.unwrap();
        assert_eq!(p.get_status(), ProvisionerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_tears_down_and_reports_handle() {
        let driver = fake();
        driver.pending_polls.store(1_000, Ordering::SeqCst);
        let p = provisioner(driver.clone());

        let err = p.setup().await.unwrap_err();
        assert_eq!(err.handle(), Some(&FakeDriver::handle()));
        assert_eq!(p.get_status(), ProvisionerStatus::Error);
        assert_eq!(driver.teardown_count(), 1);
        // Nothing left for a later teardown to do.
        p.teardown().await.unwrap();
        assert_eq!(driver.teardown_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_failure_still_reaches_stopped() {
        let driver = fake();
        let p = provisioner(driver.clone());
        p.setup().await.unwrap();
        driver.fail_teardown.store(true, Ordering::SeqCst);

        let err = p.teardown().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Teardown { .. }), "{err}");
        assert_eq!(p.get_status(), ProvisionerStatus::Stopped);
        assert_eq!(p.handle(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_before_setup_is_a_noop() {
        let driver = fake();
        let p = provisioner(driver.clone());
        p.teardown().await.unwrap();
        assert_eq!(p.get_status(), ProvisionerStatus::NotStarted);
        assert_eq!(driver.teardown_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop() {
        let driver = fake();
        let p = provisioner(driver.clone());
        p.setup().await.unwrap();
        p.teardown().await.unwrap();
        p.setup().await.unwrap();
        assert_eq!(p.get_status(), ProvisionerStatus::Running);
        assert_eq!(driver.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_waits_for_in_flight_setup() {
        let driver = fake();
        driver.pending_polls.store(2, Ordering::SeqCst);
        let p = provisioner(driver.clone());

        let setup = tokio::spawn({
            let p = p.clone();
            async move { p.setup().await }
        });
        while p.get_status() != ProvisionerStatus::Starting {
            tokio::task::yield_now().await;
        }

        p.teardown().await.unwrap();

        // Setup finished first, then teardown released what it created.
        assert!(setup.await.unwrap().is_ok());
        assert_eq!(p.get_status(), ProvisionerStatus::Stopped);
        assert_eq!(driver.teardown_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_setup_tears_down_recorded_handle() {
        let driver = fake();
        driver.pending_polls.store(1_000_000, Ordering::SeqCst);
        let config = ProvisionerConfig::new(Backend::Manual)
            .with_token("t")
            .with_retry(RetrySettings {
                provision: fast_retry().provision,
                readiness: RetryConfig {
                    max_retries: 10_000,
                    base_delay_ms: 10,
                    max_delay_ms: 10,
                    timeout_secs: 3_600,
                },
            });
        let p = Provisioner::from_driver(config, driver.clone()).unwrap();

        let setup = tokio::spawn({
            let p = p.clone();
            async move { p.setup().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(p.handle(), Some(FakeDriver::handle()));

        setup.abort();
        assert!(setup.await.unwrap_err().is_cancelled());

        // Waits on the serial lock held by the cleanup task.
        p.teardown().await.unwrap();
        assert_eq!(driver.teardown_count(), 1);
        assert_eq!(p.get_status(), ProvisionerStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_create_releases_planned_resource() {
        let driver = fake();
        driver.hang_create.store(true, Ordering::SeqCst);
        driver.planned.store(true, Ordering::SeqCst);
        let p = provisioner(driver.clone());

        let setup = tokio::spawn({
            let p = p.clone();
            async move { p.setup().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(driver.creates.load(Ordering::SeqCst), 1);
        assert_eq!(p.handle(), None);

        setup.abort();
        assert!(setup.await.unwrap_err().is_cancelled());

        p.teardown().await.unwrap();
        assert_eq!(driver.teardowns.lock().unwrap().as_slice(), [FakeDriver::handle()]);
        assert_eq!(p.get_status(), ProvisionerStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_create_times_out_into_error() {
        let driver = fake();
        driver.hang_create.store(true, Ordering::SeqCst);
        driver.planned.store(true, Ordering::SeqCst);
        let p = provisioner(driver.clone());

        let err = p.setup().await.unwrap_err();

        assert!(matches!(err, ProvisionError::Setup { .. }), "{err}");
        assert!(matches!(err.root(), ProvisionError::Timeout(_)), "{err}");
        let ProvisionError::Setup { source, .. } = &err else {
            unreachable!()
        };
        assert!(
            matches!(source.as_ref(), ProvisionError::Retry(r) if matches!(**r, RetryError::DeadlineExceeded { .. })),
            "{err}"
        );
        assert_eq!(p.get_status(), ProvisionerStatus::Error);
        assert_eq!(driver.teardown_count(), 1);
        assert!(err.handle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_policy_polls_until_gone() {
        let driver = fake();
        let config = ProvisionerConfig::new(Backend::Manual)
            .with_token("t")
            .with_retry(fast_retry())
            .with_teardown(TeardownPolicy::Confirm);
        let p = Provisioner::from_driver(config, driver.clone()).unwrap();
        p.setup().await.unwrap();
        p.teardown().await.unwrap();
        assert!(!driver.running.load(Ordering::SeqCst));
        assert_eq!(p.get_status(), ProvisionerStatus::Stopped);
    }

    #[test]
    fn token_is_generated_when_absent() {
        let config = ProvisionerConfig::new(Backend::Manual);
        let a = Provisioner::from_driver(config.clone(), fake()).unwrap();
        let b = Provisioner::from_driver(config.with_token("fixed"), fake()).unwrap();
        assert_eq!(a.token().len(), 43);
        assert_eq!(b.token(), "fixed");
    }
}
