use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::DaemonLaunch;
use crate::provisioner::command::{CommandOutput, CommandRunner};
use crate::provisioner::driver::Driver;
use crate::provisioner::error::ProvisionError;
use crate::provisioner::types::{
    BackendKind, BackendState, Endpoint, KubernetesConfig, KubernetesPlatform, ResourceHandle,
};

/// A Deployment plus a Service in one namespace, applied with `kubectl`.
pub struct KubernetesDriver {
    config: KubernetesConfig,
    context: Option<String>,
    launch: DaemonLaunch,
    runner: Arc<dyn CommandRunner>,
}

/// Kube context name for a managed cluster, following each provider's
/// naming convention. `None` means "use the current context".
pub fn context_for(config: &KubernetesConfig) -> Result<Option<String>, ProvisionError> {
    let need = |value: &Option<String>, what: &str| -> Result<String, ProvisionError> {
        value
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ProvisionError::Config(format!("{what} is required for {:?}", config.platform))
            })
    };

    Ok(match config.platform {
        KubernetesPlatform::Local => None,
        KubernetesPlatform::AwsEks => Some(format!(
            "arn:aws:eks:{}:{}",
            need(&config.region, "region")?,
            need(&config.cluster_name, "cluster_name")?
        )),
        KubernetesPlatform::AzureAks => Some(format!(
            "{}_{}",
            need(&config.resource_group, "resource_group")?,
            need(&config.cluster_name, "cluster_name")?
        )),
        KubernetesPlatform::GcpGke => Some(format!(
            "gke_{}_{}_{}",
            need(&config.project, "project")?,
            need(&config.region, "region")?,
            need(&config.cluster_name, "cluster_name")?
        )),
    })
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct List<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct Pod {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

impl Pod {
    fn is_ready(&self) -> bool {
        self.status.phase == "Running"
            && self
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
    }
}

#[derive(Deserialize)]
struct Endpoints {
    #[serde(default)]
    subsets: Vec<Subset>,
}

#[derive(Deserialize)]
struct Subset {
    #[serde(default)]
    addresses: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct Service {
    spec: ServiceSpec,
    #[serde(default)]
    status: ServiceStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSpec {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(rename = "clusterIP", default)]
    cluster_ip: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServiceStatus {
    #[serde(default)]
    load_balancer: LoadBalancerStatus,
}

#[derive(Deserialize, Default)]
struct LoadBalancerStatus {
    #[serde(default)]
    ingress: Vec<Ingress>,
}

#[derive(Deserialize)]
struct Ingress {
    ip: Option<String>,
    hostname: Option<String>,
}

impl Service {
    fn address(&self) -> Option<String> {
        if let Some(ingress) = self.status.load_balancer.ingress.first() {
            return ingress.ip.clone().or_else(|| ingress.hostname.clone());
        }
        if self.spec.kind == "LoadBalancer" {
            return None;
        }
        self.spec.cluster_ip.clone().filter(|ip| !ip.is_empty() && ip != "None")
    }
}

impl KubernetesDriver {
    pub fn new(
        config: KubernetesConfig,
        launch: DaemonLaunch,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ProvisionError> {
        super::require(&config.image, "kubernetes image")?;
        let context = context_for(&config)?;
        Ok(Self {
            config,
            context,
            launch,
            runner,
        })
    }

    async fn kubectl(&self, rest: &[&str], stdin: Option<&str>) -> Result<CommandOutput, ProvisionError> {
        let mut argv = Vec::with_capacity(rest.len() + 4);
        if let Some(context) = &self.context {
            argv.push("--context".to_string());
            argv.push(context.clone());
        }
        argv.push("-n".to_string());
        argv.push(self.config.namespace.clone());
        argv.extend(rest.iter().map(|s| s.to_string()));
        self.runner.run(&self.config.kubectl_bin, &argv, stdin).await
    }

    fn handle(&self) -> ResourceHandle {
        ResourceHandle::Kubernetes {
            namespace: self.config.namespace.clone(),
            deployment: self.config.deployment_name.clone(),
            service: self.config.service_name.clone(),
        }
    }

    fn names<'a>(&self, handle: &'a ResourceHandle) -> Result<(&'a str, &'a str), ProvisionError> {
        match handle {
            ResourceHandle::Kubernetes {
                namespace,
                deployment,
                service,
            } if *namespace == self.config.namespace => Ok((deployment.as_str(), service.as_str())),
            other => Err(ProvisionError::HandleMismatch {
                backend: BackendKind::Kubernetes,
                handle: other.clone(),
            }),
        }
    }

    /// Deployment + Service as one `v1/List`, so a single `apply` creates
    /// or updates both.
    pub fn manifest(&self) -> serde_json::Value {
        let port = self.launch.port;
        let app = &self.config.deployment_name;
        json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": { "name": app, "labels": { "app": app } },
                    "spec": {
                        "replicas": 1,
                        "selector": { "matchLabels": { "app": app } },
                        "template": {
                            "metadata": { "labels": { "app": app } },
                            "spec": {
                                "containers": [{
                                    "name": "commandrig-daemon",
                                    "image": self.config.image,
                                    "args": ["daemon", "--host", "0.0.0.0", "--port", port.to_string()],
                                    "env": [
                                        { "name": "DAEMON_PORT", "value": port.to_string() },
                                        { "name": "DAEMON_TOKEN", "value": self.launch.token },
                                    ],
                                    "ports": [{ "containerPort": port }],
                                }]
                            }
                        }
                    }
                },
                {
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": { "name": self.config.service_name },
                    "spec": {
                        "type": self.config.service_type,
                        "selector": { "app": app },
                        "ports": [{ "port": port, "targetPort": port }],
                    }
                }
            ]
        })
    }

    async fn pods_ready(&self, deployment: &str) -> Result<bool, ProvisionError> {
        let selector = format!("app={deployment}");
        let out = self
            .kubectl(&["get", "pods", "-l", selector.as_str(), "-o", "json"], None)
            .await?
            .check()?;
        let pods: List<Pod> = out.json()?;
        Ok(pods.items.iter().any(Pod::is_ready))
    }

    async fn service_endpoint(&self, service: &str) -> Result<Option<Endpoint>, ProvisionError> {
        let out = self.kubectl(&["get", "endpoints", service, "-o", "json"], None).await?;
        if out.is_not_found() {
            return Ok(None);
        }
        let endpoints: Endpoints = out.check()?.json()?;
        if !endpoints.subsets.iter().any(|s| !s.addresses.is_empty()) {
            return Ok(None);
        }

        let out = self.kubectl(&["get", "service", service, "-o", "json"], None).await?;
        if out.is_not_found() {
            return Ok(None);
        }
        let svc: Service = out.check()?.json()?;
        Ok(svc.address().map(|host| Endpoint::new(host, self.launch.port)))
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<(), ProvisionError> {
        let out = self
            .kubectl(&["delete", kind, name, "--ignore-not-found"], None)
            .await?;
        if out.is_not_found() {
            return Ok(());
        }
        out.check()?;
        Ok(())
    }
}

#[async_trait]
impl Driver for KubernetesDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    async fn create(&self) -> Result<ResourceHandle, ProvisionError> {
        let manifest = self.manifest().to_string();
        tracing::info!(
            namespace = %self.config.namespace,
            deployment = %self.config.deployment_name,
            service = %self.config.service_name,
            "applying deployment and service"
        );
        self.kubectl(&["apply", "-f", "-"], Some(&manifest))
            .await?
            .check()?;
        Ok(self.handle())
    }

    async fn inspect(&self, handle: &ResourceHandle) -> Result<BackendState, ProvisionError> {
        let (deployment, service) = self.names(handle)?;
        let ready = self.pods_ready(deployment).await?;
        let endpoint = self.service_endpoint(service).await?;
        Ok(BackendState {
            running: ready && endpoint.is_some(),
            endpoint,
        })
    }

    async fn teardown(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
        let (deployment, service) = self.names(handle)?;
        // Either object may be missing after a partial failure; try both.
        let deployment_result = self.delete("deployment", deployment).await;
        let service_result = self.delete("service", service).await;
        if let Err(e) = &deployment_result {
            tracing::warn!(deployment, error = %e, "failed to delete deployment");
        }
        if let Err(e) = &service_result {
            tracing::warn!(service, error = %e, "failed to delete service");
        }
        deployment_result.and(service_result)
    }

    fn planned_handle(&self) -> Option<ResourceHandle> {
        Some(self.handle())
    }

    // Pod readiness plus service endpoints already cover reachability inside
    // the cluster; the address may not be routable from the caller.
    fn probe_port(&self) -> bool {
        false
    }
}
