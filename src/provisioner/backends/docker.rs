use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, ContainerInspectResponse, HostConfig, PortBinding};
use bollard::query_parameters::{CreateContainerOptionsBuilder, RemoveContainerOptionsBuilder};
use bollard::{API_DEFAULT_VERSION, Docker};

use super::DaemonLaunch;
use crate::provisioner::driver::Driver;
use crate::provisioner::error::ProvisionError;
use crate::provisioner::types::{BackendKind, BackendState, DockerConfig, Endpoint, ResourceHandle};

const SOCKET_TIMEOUT_SECS: u64 = 120;

/// The slice of the Docker Engine API the driver uses.
#[async_trait]
pub trait DockerApi: Send + Sync {
    async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse, BollardError>;
    async fn create(&self, name: &str, body: ContainerCreateBody) -> Result<(), BollardError>;
    async fn start(&self, name: &str) -> Result<(), BollardError>;
    /// Force-removes, stopping the container first if it runs.
    async fn remove(&self, name: &str) -> Result<(), BollardError>;
}

#[async_trait]
impl DockerApi for Docker {
    async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse, BollardError> {
        self.inspect_container(name, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
    }

    async fn create(&self, name: &str, body: ContainerCreateBody) -> Result<(), BollardError> {
        self.create_container(Some(CreateContainerOptionsBuilder::new().name(name).build()), body)
            .await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), BollardError> {
        self.start_container(name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
    }

    async fn remove(&self, name: &str) -> Result<(), BollardError> {
        self.remove_container(
            name,
            Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
        )
        .await
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn api_error(operation: &str, name: &str, error: BollardError) -> ProvisionError {
    ProvisionError::backend(BackendKind::Docker, format!("{operation} {name}: {error}"))
}

/// One named container on a Docker engine, driven through the Engine API.
pub struct DockerDriver {
    config: DockerConfig,
    launch: DaemonLaunch,
    api: Arc<dyn DockerApi>,
}

impl DockerDriver {
    /// Connects to `config.socket`, or to the local engine's defaults
    /// (`DOCKER_HOST`, then the platform socket).
    pub fn new(config: DockerConfig, launch: DaemonLaunch) -> Result<Self, ProvisionError> {
        let docker = match config.socket.as_deref() {
            Some(path) => Docker::connect_with_socket(path, SOCKET_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| ProvisionError::Config(format!("cannot connect to docker: {e}")))?;
        Ok(Self::with_api(config, launch, Arc::new(docker)))
    }

    pub fn with_api(config: DockerConfig, launch: DaemonLaunch, api: Arc<dyn DockerApi>) -> Self {
        Self {
            config,
            launch,
            api,
        }
    }

    fn container<'a>(&self, handle: &'a ResourceHandle) -> Result<&'a str, ProvisionError> {
        match handle {
            ResourceHandle::Docker { container } => Ok(container.as_str()),
            other => Err(ProvisionError::HandleMismatch {
                backend: BackendKind::Docker,
                handle: other.clone(),
            }),
        }
    }

    fn handle(&self) -> ResourceHandle {
        ResourceHandle::Docker {
            container: self.config.container_name.clone(),
        }
    }

    /// `Some(running)` when the container exists, `None` when it does not.
    async fn state_of(&self, name: &str) -> Result<Option<bool>, ProvisionError> {
        match self.api.inspect(name).await {
            Ok(info) => Ok(Some(info.state.and_then(|s| s.running).unwrap_or(false))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(api_error("inspect", name, e)),
        }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.config.host.clone(), self.launch.port)
    }

    fn container_body(&self) -> ContainerCreateBody {
        let port = self.launch.port;
        let key = format!("{port}/tcp");
        ContainerCreateBody {
            image: Some(self.config.image.clone()),
            env: Some(vec![
                format!("DAEMON_PORT={port}"),
                format!("DAEMON_TOKEN={}", self.launch.token),
            ]),
            exposed_ports: Some(HashMap::from([(key.clone(), HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(HashMap::from([(
                    key,
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(port.to_string()),
                    }]),
                )])),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        }
    }

    async fn remove_partial(&self, name: &str) {
        match self.api.remove(name).await {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => tracing::warn!(container = %name, error = %e, "failed to remove partial container"),
        }
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn create(&self) -> Result<ResourceHandle, ProvisionError> {
        let name = &self.config.container_name;

        match self.state_of(name).await? {
            Some(true) => {
                tracing::info!(container = %name, "reusing running container");
                return Ok(self.handle());
            }
            Some(false) => {
                tracing::info!(container = %name, "starting existing container");
                self.api
                    .start(name)
                    .await
                    .map_err(|e| api_error("start", name, e))?;
                return Ok(self.handle());
            }
            None => {}
        }

        tracing::info!(container = %name, image = %self.config.image, port = self.launch.port, "creating container");
        match self.api.create(name, self.container_body()).await {
            Ok(()) => {}
            // On create, 404 is the image, not the container.
            Err(e) if is_not_found(&e) => {
                return Err(ProvisionError::NotFound(format!(
                    "docker image {}: {e}",
                    self.config.image
                )));
            }
            Err(e) => return Err(api_error("create", name, e)),
        }

        if let Err(e) = self.api.start(name).await {
            // A created-but-unstarted container would block the name.
            self.remove_partial(name).await;
            return Err(api_error("start", name, e));
        }
        Ok(self.handle())
    }

    async fn inspect(&self, handle: &ResourceHandle) -> Result<BackendState, ProvisionError> {
        let name = self.container(handle)?;
        match self.state_of(name).await? {
            Some(true) => Ok(BackendState::running(self.endpoint())),
            Some(false) => Ok(BackendState::pending(Some(self.endpoint()))),
            None => Ok(BackendState::gone()),
        }
    }

    async fn teardown(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
        let name = self.container(handle)?;
        match self.api.remove(name).await {
            Ok(()) => {
                tracing::info!(container = %name, "container removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                tracing::debug!(container = %name, "container already gone");
                Ok(())
            }
            Err(e) => Err(api_error("remove", name, e)),
        }
    }

    fn planned_handle(&self) -> Option<ResourceHandle> {
        Some(self.handle())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted Engine API for driver tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use bollard::models::ContainerState;

    use super::*;

    pub fn server_error(status_code: u16, message: &str) -> BollardError {
        BollardError::DockerResponseServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn container(running: bool) -> ContainerInspectResponse {
        ContainerInspectResponse {
            state: Some(ContainerState {
                running: Some(running),
                ..ContainerState::default()
            }),
            ..ContainerInspectResponse::default()
        }
    }

    pub type Script<T> = Mutex<VecDeque<Result<T, BollardError>>>;

    /// Each call pops the next scripted result; an empty script answers
    /// inspect and remove with 404 and everything else with success.
    #[derive(Default)]
    pub struct ScriptedDocker {
        pub inspects: Script<ContainerInspectResponse>,
        pub creates: Script<()>,
        pub starts: Script<()>,
        pub removes: Script<()>,
        pub calls: Mutex<Vec<String>>,
        pub bodies: Mutex<Vec<ContainerCreateBody>>,
    }

    impl ScriptedDocker {
        pub fn push<T>(script: &Script<T>, result: Result<T, BollardError>) {
            script.lock().unwrap().push_back(result);
        }

        pub fn count(&self, op: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| c.starts_with(op)).count()
        }

        fn record(&self, op: &str, name: &str) {
            self.calls.lock().unwrap().push(format!("{op} {name}"));
        }
    }

    fn pop<T>(script: &Script<T>) -> Option<Result<T, BollardError>> {
        script.lock().unwrap().pop_front()
    }

    #[async_trait]
    impl DockerApi for ScriptedDocker {
        async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse, BollardError> {
            self.record("inspect", name);
            pop(&self.inspects).unwrap_or_else(|| Err(server_error(404, "missing")))
        }

        async fn create(&self, name: &str, body: ContainerCreateBody) -> Result<(), BollardError> {
            self.record("create", name);
            self.bodies.lock().unwrap().push(body);
            pop(&self.creates).unwrap_or(Ok(()))
        }

        async fn start(&self, name: &str) -> Result<(), BollardError> {
            self.record("start", name);
            pop(&self.starts).unwrap_or(Ok(()))
        }

        async fn remove(&self, name: &str) -> Result<(), BollardError> {
            self.record("remove", name);
            pop(&self.removes).unwrap_or_else(|| Err(server_error(404, "missing")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::{ScriptedDocker, container, server_error};
    use super::*;
    use crate::provisioner::driver::{SetupPolicies, setup};
    use crate::provisioner::retry::RetryPolicy;

    fn driver(api: Arc<ScriptedDocker>) -> DockerDriver {
        DockerDriver::with_api(
            DockerConfig::default(),
            DaemonLaunch {
                port: 8001,
                token: "tok".into(),
            },
            api,
        )
    }

    #[tokio::test]
    async fn create_runs_new_container_with_port_and_token() {
        let api = Arc::new(ScriptedDocker::default());
        let handle = driver(api.clone()).create().await.unwrap();

        assert_eq!(
            handle,
            ResourceHandle::Docker {
                container: "commandrig-daemon".into()
            }
        );
        assert_eq!(
            *api.calls.lock().unwrap(),
            vec![
                "inspect commandrig-daemon",
                "create commandrig-daemon",
                "start commandrig-daemon"
            ]
        );

        let body = api.bodies.lock().unwrap().pop().unwrap();
        assert_eq!(body.image.as_deref(), Some("commandrig-daemon:latest"));
        assert_eq!(
            body.env.unwrap(),
            vec!["DAEMON_PORT=8001".to_string(), "DAEMON_TOKEN=tok".to_string()]
        );
        let bindings = body.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings["8001/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8001"));
    }

    #[tokio::test]
    async fn missing_container_is_decided_by_status_code_not_message() {
        let api = Arc::new(ScriptedDocker::default());
        ScriptedDocker::push(&api.inspects, Err(server_error(404, "Kein solcher Container")));

        driver(api.clone()).create().await.unwrap();
        assert_eq!(api.count("create"), 1);
    }

    #[tokio::test]
    async fn create_reuses_running_container() {
        let api = Arc::new(ScriptedDocker::default());
        ScriptedDocker::push(&api.inspects, Ok(container(true)));

        driver(api.clone()).create().await.unwrap();
        assert_eq!(api.count("create"), 0);
        assert_eq!(api.count("start"), 0);
    }

    #[tokio::test]
    async fn create_starts_stopped_container() {
        let api = Arc::new(ScriptedDocker::default());
        ScriptedDocker::push(&api.inspects, Ok(container(false)));

        driver(api.clone()).create().await.unwrap();
        assert_eq!(api.count("start"), 1);
        assert_eq!(api.count("create"), 0);
    }

    #[tokio::test]
    async fn failed_start_removes_partial_container() {
        let api = Arc::new(ScriptedDocker::default());
        ScriptedDocker::push(
            &api.starts,
            Err(server_error(500, "port is already allocated")),
        );
        ScriptedDocker::push(&api.removes, Ok(()));

        let err = driver(api.clone()).create().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Backend { .. }), "{err}");
        assert!(err.is_retryable());
        assert_eq!(api.count("remove"), 1);
    }

    #[tokio::test]
    async fn missing_image_is_not_retried() {
        let api = Arc::new(ScriptedDocker::default());
        ScriptedDocker::push(&api.creates, Err(server_error(404, "No such image")));

        let err = driver(api).create().await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(_)), "{err}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn inspect_maps_states() {
        let api = Arc::new(ScriptedDocker::default());
        ScriptedDocker::push(&api.inspects, Ok(container(true)));
        ScriptedDocker::push(&api.inspects, Ok(container(false)));
        let driver = driver(api);
        let handle = driver.handle();

        let running = driver.inspect(&handle).await.unwrap();
        assert_eq!(running.endpoint, Some(Endpoint::new("localhost", 8001)));
        assert!(running.running);
        assert!(!driver.inspect(&handle).await.unwrap().running);
        assert_eq!(driver.inspect(&handle).await.unwrap(), BackendState::gone());
    }

    #[tokio::test]
    async fn teardown_treats_missing_container_as_success() {
        let api = Arc::new(ScriptedDocker::default());
        driver(api.clone()).teardown(&ResourceHandle::Docker {
            container: "commandrig-daemon".into(),
        })
        .await
        .unwrap();
        assert_eq!(api.count("remove"), 1);
    }

    #[tokio::test]
    async fn teardown_reports_other_errors() {
        let api = Arc::new(ScriptedDocker::default());
        ScriptedDocker::push(&api.removes, Err(server_error(409, "removal in progress")));
        let driver = driver(api);
        let err = driver.teardown(&driver.handle()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Backend { .. }), "{err}");
    }

    #[tokio::test]
    async fn rejects_foreign_handle() {
        let api = Arc::new(ScriptedDocker::default());
        let err = driver(api)
            .teardown(&ResourceHandle::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::HandleMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_docker_daemon_exhausts_and_leaves_nothing_behind() {
        let api = Arc::new(ScriptedDocker::default());
        for _ in 0..3 {
            ScriptedDocker::push(&api.inspects, Err(server_error(500, "engine unavailable")));
        }
        ScriptedDocker::push(&api.removes, Err(server_error(500, "engine unavailable")));
        let driver = driver(api.clone());
        let policies = SetupPolicies {
            provision: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(900)),
            readiness: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(900)),
        };

        let err = setup(&driver, policies, |_| {}).await.unwrap_err();

        assert!(matches!(err, ProvisionError::Setup { .. }), "{err}");
        assert!(matches!(err.root(), ProvisionError::Backend { .. }));
        assert_eq!(api.count("inspect"), 3);
        assert_eq!(api.count("create"), 0);
        // Cleanup was attempted; the engine being down means it could not confirm.
        assert_eq!(api.count("remove"), 1);
        assert_eq!(err.handle(), Some(&driver.handle()));
    }
}
