use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::DaemonLaunch;
use crate::provisioner::command::{CommandOutput, CommandRunner};
use crate::provisioner::driver::Driver;
use crate::provisioner::error::ProvisionError;
use crate::provisioner::types::{BackendKind, BackendState, Endpoint, GcpConfig, ResourceHandle};

/// One Compute Engine instance, driven through `gcloud compute`.
pub struct GcpDriver {
    config: GcpConfig,
    launch: DaemonLaunch,
    runner: Arc<dyn CommandRunner>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceInstance {
    status: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

impl GceInstance {
    fn address(&self) -> Option<String> {
        let nic = self.network_interfaces.first()?;
        nic.access_configs
            .iter()
            .find_map(|ac| ac.nat_ip.clone())
            .or_else(|| nic.network_ip.clone())
    }
}

impl GcpDriver {
    pub fn new(
        config: GcpConfig,
        launch: DaemonLaunch,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ProvisionError> {
        super::require(&config.project, "gcp project")?;
        super::require(&config.image, "gcp image")?;
        Ok(Self {
            config,
            launch,
            runner,
        })
    }

    async fn instances(&self, verb: &str, name: &str, extra: Vec<String>) -> Result<CommandOutput, ProvisionError> {
        let mut argv = vec![
            "compute".to_string(),
            "instances".into(),
            verb.into(),
            name.into(),
            "--project".into(),
            self.config.project.clone(),
            "--zone".into(),
            self.config.zone.clone(),
            "--format".into(),
            "json".into(),
        ];
        argv.extend(extra);
        self.runner.run(&self.config.gcloud_bin, &argv, None).await
    }

    fn handle(&self) -> ResourceHandle {
        ResourceHandle::Gcp {
            project: self.config.project.clone(),
            zone: self.config.zone.clone(),
            instance: self.config.instance_name.clone(),
        }
    }

    fn instance<'a>(&self, handle: &'a ResourceHandle) -> Result<&'a str, ProvisionError> {
        match handle {
            ResourceHandle::Gcp {
                project,
                zone,
                instance,
            } if *project == self.config.project && *zone == self.config.zone => Ok(instance.as_str()),
            other => Err(ProvisionError::HandleMismatch {
                backend: BackendKind::Gcp,
                handle: other.clone(),
            }),
        }
    }

    async fn describe(&self, name: &str) -> Result<Option<GceInstance>, ProvisionError> {
        let out = self.instances("describe", name, Vec::new()).await?;
        if out.is_not_found() {
            return Ok(None);
        }
        Ok(Some(out.check()?.json()?))
    }
}

#[async_trait]
impl Driver for GcpDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Gcp
    }

    async fn create(&self) -> Result<ResourceHandle, ProvisionError> {
        let name = self.config.instance_name.as_str();

        if let Some(existing) = self.describe(name).await? {
            tracing::info!(instance = %name, status = %existing.status, "reusing existing instance");
            if matches!(existing.status.as_str(), "TERMINATED" | "STOPPED" | "SUSPENDED") {
                self.instances("start", name, Vec::new()).await?.check()?;
            }
            return Ok(self.handle());
        }

        tracing::info!(instance = %name, project = %self.config.project, zone = %self.config.zone, "creating instance");
        self.instances(
            "create",
            name,
            vec![
                "--machine-type".into(),
                self.config.machine_type.clone(),
                "--image".into(),
                self.config.image.clone(),
                "--tags".into(),
                self.config.network_tag.clone(),
                "--metadata".into(),
                format!("startup-script={}", self.launch.startup_script()),
            ],
        )
        .await?
        .check()?;
        Ok(self.handle())
    }

    async fn inspect(&self, handle: &ResourceHandle) -> Result<BackendState, ProvisionError> {
        let name = self.instance(handle)?;
        let Some(instance) = self.describe(name).await? else {
            return Ok(BackendState::gone());
        };
        Ok(BackendState {
            running: instance.status == "RUNNING",
            endpoint: instance
                .address()
                .map(|host| Endpoint::new(host, self.launch.port)),
        })
    }

    async fn teardown(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
        let name = self.instance(handle)?;
        let out = self
            .instances("delete", name, vec!["--quiet".into(), "--async".into()])
            .await?;
        if out.is_not_found() {
            return Ok(());
        }
        out.check()?;
        tracing::info!(instance = %name, "delete requested");
        Ok(())
    }

    fn planned_handle(&self) -> Option<ResourceHandle> {
        Some(self.handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::command::testing::{ScriptedRunner, fail, ok};

    const DESCRIBE: &str = "gcloud compute instances describe commandrig-daemon --project proj --zone us-central1-a";
    const NOT_FOUND: &str = "ERROR: (gcloud.compute.instances.describe) Could not fetch resource:\n - The resource 'projects/proj/zones/us-central1-a/instances/commandrig-daemon' was not found";

    fn driver(runner: Arc<ScriptedRunner>) -> GcpDriver {
        GcpDriver::new(
            GcpConfig {
                project: "proj".into(),
                image: "projects/proj/global/images/commandrig".into(),
                ..GcpConfig::default()
            },
            DaemonLaunch {
                port: 8000,
                token: "tok".into(),
            },
            runner,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_passes_startup_script_metadata() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(DESCRIBE, vec![fail(1, NOT_FOUND)])
                .on("gcloud compute instances create", vec![ok("[]")]),
        );
        let handle = driver(runner.clone()).create().await.unwrap();

        assert!(matches!(handle, ResourceHandle::Gcp { .. }));
        let create = runner
            .calls()
            .into_iter()
            .find(|c| c.starts_with("gcloud compute instances create"))
            .unwrap();
        assert!(create.contains("--machine-type n1-standard-1"));
        assert!(create.contains("--tags commandrig-daemon"));
        assert!(create.contains("--metadata startup-script=#!/bin/sh"));
    }

    #[tokio::test]
    async fn create_restarts_terminated_instance() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(DESCRIBE, vec![ok(r#"{"status":"TERMINATED"}"#)])
                .on("gcloud compute instances start", vec![ok("[]")]),
        );
        driver(runner.clone()).create().await.unwrap();
        assert_eq!(runner.count("gcloud compute instances start"), 1);
        assert_eq!(runner.count("gcloud compute instances create"), 0);
    }

    #[tokio::test]
    async fn inspect_uses_nat_ip() {
        let runner = Arc::new(ScriptedRunner::new().on(
            DESCRIBE,
            vec![ok(
                r#"{"status":"RUNNING","networkInterfaces":[{"networkIP":"10.128.0.2","accessConfigs":[{"natIP":"35.1.2.3"}]}]}"#,
            )],
        ));
        let driver = driver(runner);
        let state = driver.inspect(&driver.handle()).await.unwrap();
        assert!(state.running);
        assert_eq!(state.endpoint, Some(Endpoint::new("35.1.2.3", 8000)));
    }

    #[tokio::test]
    async fn inspect_missing_instance_is_gone() {
        let runner = Arc::new(ScriptedRunner::new().on(DESCRIBE, vec![fail(1, NOT_FOUND)]));
        let driver = driver(runner);
        assert_eq!(driver.inspect(&driver.handle()).await.unwrap(), BackendState::gone());
        assert!(!driver.is_running(&driver.handle()).await);
    }

    #[tokio::test]
    async fn teardown_is_async_delete() {
        let runner = Arc::new(ScriptedRunner::new().on("gcloud compute instances delete", vec![ok("")]));
        let driver = driver(runner.clone());
        driver.teardown(&driver.handle()).await.unwrap();
        assert!(runner.calls()[0].ends_with("--format json --quiet --async"));
    }

    #[tokio::test]
    async fn handle_from_other_project_is_rejected() {
        let runner = Arc::new(ScriptedRunner::new());
        let foreign = ResourceHandle::Gcp {
            project: "other".into(),
            zone: "us-central1-a".into(),
            instance: "commandrig-daemon".into(),
        };
        let err = driver(runner.clone()).teardown(&foreign).await.unwrap_err();
        assert!(matches!(err, ProvisionError::HandleMismatch { .. }));
        assert!(runner.calls().is_empty());
    }
}
