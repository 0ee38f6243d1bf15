use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Manual,
    Docker,
    Kubernetes,
    Aws,
    Azure,
    Gcp,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Manual => "manual",
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        };
        f.write_str(name)
    }
}

// ── Provisioner config ──────────────────────────────────────────────

/// Everything a `Provisioner` needs. Immutable once the provisioner is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Port the in-guest daemon listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Token handed to the in-guest daemon. Generated when absent.
    #[serde(default)]
    pub token: Option<String>,
    pub backend: Backend,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub teardown: TeardownPolicy,
}

pub(crate) fn default_port() -> u16 {
    8000
}

impl ProvisionerConfig {
    pub fn new(backend: Backend) -> Self {
        Self {
            port: default_port(),
            token: None,
            backend,
            retry: RetrySettings::default(),
            teardown: TeardownPolicy::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

/// Closed set of backends. Selecting one is a match, not a string lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    Manual,
    Docker(DockerConfig),
    Kubernetes(KubernetesConfig),
    Aws(AwsConfig),
    Azure(AzureConfig),
    Gcp(GcpConfig),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Manual => BackendKind::Manual,
            Self::Docker(_) => BackendKind::Docker,
            Self::Kubernetes(_) => BackendKind::Kubernetes,
            Self::Aws(_) => BackendKind::Aws,
            Self::Azure(_) => BackendKind::Azure,
            Self::Gcp(_) => BackendKind::Gcp,
        }
    }
}

const DEFAULT_NAME: &str = "commandrig-daemon";
const DEFAULT_IMAGE: &str = "commandrig-daemon:latest";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub container_name: String,
    pub image: String,
    /// Host the published port is reachable on.
    pub host: String,
    /// Engine socket; `None` uses `DOCKER_HOST` or the platform default.
    pub socket: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            container_name: DEFAULT_NAME.into(),
            image: DEFAULT_IMAGE.into(),
            host: "localhost".into(),
            socket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KubernetesPlatform {
    #[default]
    Local,
    AwsEks,
    AzureAks,
    GcpGke,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub platform: KubernetesPlatform,
    pub namespace: String,
    pub deployment_name: String,
    pub service_name: String,
    pub image: String,
    pub service_type: String,
    pub cluster_name: Option<String>,
    pub region: Option<String>,
    pub resource_group: Option<String>,
    pub project: Option<String>,
    pub kubectl_bin: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            platform: KubernetesPlatform::Local,
            namespace: "default".into(),
            deployment_name: DEFAULT_NAME.into(),
            service_name: format!("{DEFAULT_NAME}-svc"),
            image: DEFAULT_IMAGE.into(),
            service_type: "LoadBalancer".into(),
            cluster_name: None,
            region: None,
            resource_group: None,
            project: None,
            kubectl_bin: "kubectl".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    pub instance_type: String,
    pub image_id: String,
    pub instance_name: String,
    pub security_group_ids: Vec<String>,
    pub subnet_ids: Vec<String>,
    pub aws_bin: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".into(),
            instance_type: "t2.micro".into(),
            image_id: String::new(),
            instance_name: DEFAULT_NAME.into(),
            security_group_ids: Vec::new(),
            subnet_ids: Vec::new(),
            aws_bin: "aws".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub resource_group: String,
    pub location: String,
    pub vm_size: String,
    pub image: String,
    pub vm_name: String,
    pub admin_username: String,
    pub subscription: Option<String>,
    pub az_bin: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            resource_group: "commandrig-rg".into(),
            location: "eastus".into(),
            vm_size: "Standard_DS1_v2".into(),
            image: String::new(),
            vm_name: DEFAULT_NAME.into(),
            admin_username: "commandrig".into(),
            subscription: None,
            az_bin: "az".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    pub image: String,
    pub instance_name: String,
    pub network_tag: String,
    pub gcloud_bin: String,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: "us-central1-a".into(),
            machine_type: "n1-standard-1".into(),
            image: String::new(),
            instance_name: DEFAULT_NAME.into(),
            network_tag: DEFAULT_NAME.into(),
            gcloud_bin: "gcloud".into(),
        }
    }
}

// ── Retry knobs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            timeout_secs: 900,
        }
    }
}

/// Provisioning and "wait until reachable" are retried separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub provision: RetryConfig,
    pub readiness: RetryConfig,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            provision: RetryConfig::default(),
            readiness: RetryConfig {
                max_retries: 180,
                base_delay_ms: 1_000,
                max_delay_ms: 5_000,
                timeout_secs: 900,
            },
        }
    }
}

/// What `teardown()` waits for before discarding the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Return once the backend accepted the delete request.
    #[default]
    FireAndForget,
    /// Poll until the backend no longer reports the resource running.
    Confirm,
}

// ── Handles & endpoints ─────────────────────────────────────────────

/// Identifier of the one backend resource a provisioner owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ResourceHandle {
    Manual,
    Docker {
        container: String,
    },
    Kubernetes {
        namespace: String,
        deployment: String,
        service: String,
    },
    Aws {
        region: String,
        instance_id: String,
    },
    Azure {
        resource_group: String,
        vm_name: String,
    },
    Gcp {
        project: String,
        zone: String,
        instance: String,
    },
}

impl ResourceHandle {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Manual => BackendKind::Manual,
            Self::Docker { .. } => BackendKind::Docker,
            Self::Kubernetes { .. } => BackendKind::Kubernetes,
            Self::Aws { .. } => BackendKind::Aws,
            Self::Azure { .. } => BackendKind::Azure,
            Self::Gcp { .. } => BackendKind::Gcp,
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual daemon"),
            Self::Docker { container } => write!(f, "docker container {container}"),
            Self::Kubernetes {
                namespace,
                deployment,
                service,
            } => write!(f, "kubernetes {namespace}/{deployment} (service {service})"),
            Self::Aws {
                region,
                instance_id,
            } => write!(f, "aws instance {instance_id} in {region}"),
            Self::Azure {
                resource_group,
                vm_name,
            } => write!(f, "azure vm {resource_group}/{vm_name}"),
            Self::Gcp {
                project,
                zone,
                instance,
            } => write!(f, "gcp instance {project}/{zone}/{instance}"),
        }
    }
}

/// Where the daemon's control port can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form for socket connects, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Point-in-time answer from a driver's `inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendState {
    pub running: bool,
    pub endpoint: Option<Endpoint>,
}

impl BackendState {
    pub fn running(endpoint: Endpoint) -> Self {
        Self {
            running: true,
            endpoint: Some(endpoint),
        }
    }

    pub fn pending(endpoint: Option<Endpoint>) -> Self {
        Self {
            running: false,
            endpoint,
        }
    }

    pub fn gone() -> Self {
        Self {
            running: false,
            endpoint: None,
        }
    }
}

/// A resource that passed its readiness poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub handle: ResourceHandle,
    pub endpoint: Endpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_backend_parses_with_defaults() {
        let yaml = r#"
            port: 8001
            backend:
              kind: docker
              image: "my/daemon:1.2"
        "#;
        let config: ProvisionerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 8001);
        assert_eq!(config.kind(), BackendKind::Docker);
        let Backend::Docker(docker) = config.backend else {
            panic!("expected docker backend");
        };
        assert_eq!(docker.image, "my/daemon:1.2");
        assert_eq!(docker.container_name, "commandrig-daemon");
        assert_eq!(docker.host, "localhost");
    }

    #[test]
    fn manual_backend_needs_no_parameters() {
        let config: ProvisionerConfig = serde_yaml::from_str("backend:\n  kind: manual\n").unwrap();
        assert_eq!(config.port, 8000);
        assert!(config.token.is_none());
        assert_eq!(config.kind(), BackendKind::Manual);
        assert_eq!(config.teardown, TeardownPolicy::FireAndForget);
    }

    #[test]
    fn kubernetes_platform_parses_snake_case() {
        let yaml = r#"
            backend:
              kind: kubernetes
              platform: gcp_gke
              project: proj
              region: us-central1
              cluster_name: rig
        "#;
        let config: ProvisionerConfig = serde_yaml::from_str(yaml).unwrap();
        let Backend::Kubernetes(k8s) = config.backend else {
            panic!("expected kubernetes backend");
        };
        assert_eq!(k8s.platform, KubernetesPlatform::GcpGke);
        assert_eq!(k8s.namespace, "default");
        assert_eq!(k8s.service_name, "commandrig-daemon-svc");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let result: Result<ProvisionerConfig, _> =
            serde_yaml::from_str("backend:\n  kind: vagrant\n");
        assert!(result.is_err());
    }

    #[test]
    fn retry_settings_override_one_phase() {
        let yaml = r#"
            backend:
              kind: manual
            retry:
              provision:
                max_retries: 5
            teardown: confirm
        "#;
        let config: ProvisionerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.retry.provision.max_retries, 5);
        assert_eq!(config.retry.provision.base_delay_ms, 1_000);
        assert_eq!(config.retry.readiness, RetrySettings::default().readiness);
        assert_eq!(config.teardown, TeardownPolicy::Confirm);
    }

    #[test]
    fn endpoint_brackets_ipv6() {
        assert_eq!(Endpoint::new("10.0.0.4", 8000).base_url(), "http://10.0.0.4:8000");
        assert_eq!(Endpoint::new("::1", 8000).authority(), "[::1]:8000");
    }

    #[test]
    fn handle_reports_its_backend() {
        let handle = ResourceHandle::Aws {
            region: "us-west-2".into(),
            instance_id: "i-0abc".into(),
        };
        assert_eq!(handle.kind(), BackendKind::Aws);
        assert_eq!(handle.to_string(), "aws instance i-0abc in us-west-2");
    }
}
