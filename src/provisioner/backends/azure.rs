use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::DaemonLaunch;
use crate::provisioner::command::{CommandOutput, CommandRunner};
use crate::provisioner::driver::Driver;
use crate::provisioner::error::ProvisionError;
use crate::provisioner::types::{AzureConfig, BackendKind, BackendState, Endpoint, ResourceHandle};

/// One Azure VM in a resource group, driven through `az`.
pub struct AzureDriver {
    config: AzureConfig,
    launch: DaemonLaunch,
    runner: Arc<dyn CommandRunner>,
}

/// Subset of `az vm show -d`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmDetails {
    #[serde(default)]
    power_state: Option<String>,
    #[serde(default)]
    public_ips: Option<String>,
    #[serde(default)]
    private_ips: Option<String>,
}

impl VmDetails {
    fn running(&self) -> bool {
        self.power_state.as_deref() == Some("VM running")
    }

    fn stopped(&self) -> bool {
        matches!(
            self.power_state.as_deref(),
            Some("VM stopped") | Some("VM deallocated")
        )
    }

    fn address(&self) -> Option<String> {
        // `-d` joins multiple addresses with commas.
        [&self.public_ips, &self.private_ips]
            .into_iter()
            .flatten()
            .filter_map(|ips| ips.split(',').map(str::trim).find(|ip| !ip.is_empty()))
            .map(str::to_string)
            .next()
    }
}

impl AzureDriver {
    pub fn new(
        config: AzureConfig,
        launch: DaemonLaunch,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ProvisionError> {
        super::require(&config.image, "azure image")?;
        super::require(&config.resource_group, "azure resource_group")?;
        Ok(Self {
            config,
            launch,
            runner,
        })
    }

    async fn az(&self, rest: Vec<String>) -> Result<CommandOutput, ProvisionError> {
        let mut argv = rest;
        argv.extend(["--output".to_string(), "json".to_string()]);
        if let Some(subscription) = &self.config.subscription {
            argv.push("--subscription".into());
            argv.push(subscription.clone());
        }
        self.runner.run(&self.config.az_bin, &argv, None).await
    }

    fn vm_args(&self, verb: &[&str], name: &str) -> Vec<String> {
        let mut argv: Vec<String> = verb.iter().map(|s| s.to_string()).collect();
        argv.extend([
            "--resource-group".to_string(),
            self.config.resource_group.clone(),
            "--name".to_string(),
            name.to_string(),
        ]);
        argv
    }

    fn handle(&self) -> ResourceHandle {
        ResourceHandle::Azure {
            resource_group: self.config.resource_group.clone(),
            vm_name: self.config.vm_name.clone(),
        }
    }

    fn vm_name<'a>(&self, handle: &'a ResourceHandle) -> Result<&'a str, ProvisionError> {
        match handle {
            ResourceHandle::Azure {
                resource_group,
                vm_name,
            } if *resource_group == self.config.resource_group => Ok(vm_name.as_str()),
            other => Err(ProvisionError::HandleMismatch {
                backend: BackendKind::Azure,
                handle: other.clone(),
            }),
        }
    }

    async fn show(&self, name: &str) -> Result<Option<VmDetails>, ProvisionError> {
        let out = self.az(self.vm_args(&["vm", "show", "--show-details"], name)).await?;
        if out.is_not_found() {
            return Ok(None);
        }
        Ok(Some(out.check()?.json()?))
    }

    async fn open_port(&self, name: &str) -> Result<(), ProvisionError> {
        let mut argv = self.vm_args(&["vm", "open-port"], name);
        argv.extend(["--port".to_string(), self.launch.port.to_string()]);
        self.az(argv).await?.check()?;
        Ok(())
    }
}

#[async_trait]
impl Driver for AzureDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Azure
    }

    async fn create(&self) -> Result<ResourceHandle, ProvisionError> {
        let name = self.config.vm_name.as_str();

        match self.show(name).await? {
            Some(vm) => {
                tracing::info!(vm = %name, power_state = ?vm.power_state, "reusing existing vm");
                if vm.stopped() {
                    self.az(self.vm_args(&["vm", "start"], name)).await?.check()?;
                }
            }
            None => {
                self.az(vec![
                    "group".into(),
                    "create".into(),
                    "--name".into(),
                    self.config.resource_group.clone(),
                    "--location".into(),
                    self.config.location.clone(),
                ])
                .await?
                .check()?;

                let mut argv = self.vm_args(&["vm", "create"], name);
                argv.extend([
                    "--image".to_string(),
                    self.config.image.clone(),
                    "--size".into(),
                    self.config.vm_size.clone(),
                    "--location".into(),
                    self.config.location.clone(),
                    "--admin-username".into(),
                    self.config.admin_username.clone(),
                    "--generate-ssh-keys".into(),
                    "--custom-data".into(),
                    self.launch.startup_script(),
                    "--tags".into(),
                    "managed-by=commandrig".into(),
                ]);
                tracing::info!(vm = %name, resource_group = %self.config.resource_group, "creating vm");
                self.az(argv).await?.check()?;
            }
        }

        // Idempotent; also repairs a VM whose earlier create stopped short of it.
        self.open_port(name).await?;
        Ok(self.handle())
    }

    async fn inspect(&self, handle: &ResourceHandle) -> Result<BackendState, ProvisionError> {
        let name = self.vm_name(handle)?;
        let Some(vm) = self.show(name).await? else {
            return Ok(BackendState::gone());
        };
        Ok(BackendState {
            running: vm.running(),
            endpoint: vm.address().map(|host| Endpoint::new(host, self.launch.port)),
        })
    }

    async fn teardown(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
        let name = self.vm_name(handle)?;
        let mut argv = self.vm_args(&["vm", "delete"], name);
        argv.extend(["--yes".to_string(), "--no-wait".to_string()]);
        let out = self.az(argv).await?;
        if out.is_not_found() {
            return Ok(());
        }
        out.check()?;
        tracing::info!(vm = %name, "delete requested");
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

    const SHOW: &str = "az vm show --show-details --resource-group commandrig-rg --name commandrig-daemon";

    fn driver(runner: Arc<ScriptedRunner>) -> AzureDriver {
        AzureDriver::new(
            AzureConfig {
                image: "Ubuntu2204".into(),
                ..AzureConfig::default()
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
    async fn create_makes_group_vm_and_opens_port() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(SHOW, vec![fail(3, "(ResourceNotFound) The Resource 'commandrig-daemon' was not found")])
                .on("az group create", vec![ok("{}")])
                .on("az vm create", vec![ok("{}")])
                .on("az vm open-port", vec![ok("{}")]),
        );
        let handle = driver(runner.clone()).create().await.unwrap();

        assert_eq!(
            handle,
            ResourceHandle::Azure {
                resource_group: "commandrig-rg".into(),
                vm_name: "commandrig-daemon".into()
            }
        );
        let calls = runner.calls();
        let create = calls.iter().find(|c| c.starts_with("az vm create")).unwrap();
        assert!(create.contains("--image Ubuntu2204 --size Standard_DS1_v2 --location eastus"));
        assert!(create.contains("--custom-data #!/bin/sh"));
        assert!(calls.iter().any(|c| c.contains("open-port") && c.contains("--port 8000")));
    }

    #[tokio::test]
    async fn create_starts_deallocated_vm() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(SHOW, vec![ok(r#"{"powerState":"VM deallocated","publicIps":""}"#)])
                .on("az vm start", vec![ok("")])
                .on("az vm open-port", vec![ok("{}")]),
        );
        driver(runner.clone()).create().await.unwrap();
        assert_eq!(runner.count("az vm start"), 1);
        assert_eq!(runner.count("az vm create"), 0);
    }

    #[tokio::test]
    async fn inspect_reads_power_state_and_public_ip() {
        let runner = Arc::new(ScriptedRunner::new().on(
            SHOW,
            vec![ok(r#"{"powerState":"VM running","publicIps":"20.1.2.3","privateIps":"10.0.0.4"}"#)],
        ));
        let driver = driver(runner);
        let state = driver.inspect(&driver.handle()).await.unwrap();
        assert!(state.running);
        assert_eq!(state.endpoint, Some(Endpoint::new("20.1.2.3", 8000)));
    }

    #[test]
    fn inspect_falls_back_to_private_ip() {
        let vm: VmDetails =
            serde_json::from_str(r#"{"powerState":"VM starting","publicIps":"","privateIps":"10.0.0.4,10.0.0.5"}"#)
                .unwrap();
        assert!(!vm.running());
        assert_eq!(vm.address().as_deref(), Some("10.0.0.4"));
    }

    #[tokio::test]
    async fn teardown_does_not_wait_and_tolerates_missing() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "az vm delete",
            vec![fail(3, "(ResourceNotFound) The Resource 'commandrig-daemon' was not found")],
        ));
        let driver = driver(runner.clone());
        driver.teardown(&driver.handle()).await.unwrap();
        let calls = runner.calls();
        assert!(calls[0].contains("--yes --no-wait"));
    }

    #[tokio::test]
    async fn subscription_is_appended() {
        let runner = Arc::new(ScriptedRunner::new().on("az vm delete", vec![ok("")]));
        let driver = AzureDriver::new(
            AzureConfig {
                image: "Ubuntu2204".into(),
                subscription: Some("sub-1".into()),
                ..AzureConfig::default()
            },
            DaemonLaunch {
                port: 8000,
                token: "tok".into(),
            },
            runner.clone(),
        )
        .unwrap();
        driver.teardown(&driver.handle()).await.unwrap();
        assert!(runner.calls()[0].ends_with("--output json --subscription sub-1"));
    }
}
