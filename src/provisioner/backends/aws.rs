use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::DaemonLaunch;
use crate::provisioner::command::{CommandOutput, CommandRunner};
use crate::provisioner::driver::Driver;
use crate::provisioner::error::ProvisionError;
use crate::provisioner::types::{AwsConfig, BackendKind, BackendState, Endpoint, ResourceHandle};

/// One EC2 instance, found or launched by its `Name` tag.
pub struct AwsDriver {
    config: AwsConfig,
    launch: DaemonLaunch,
    runner: Arc<dyn CommandRunner>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: InstanceState,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstances {
    instances: Vec<Instance>,
}

impl DescribeInstances {
    fn into_instances(self) -> impl Iterator<Item = Instance> {
        self.reservations.into_iter().flat_map(|r| r.instances)
    }
}

impl Instance {
    fn address(&self) -> Option<&str> {
        self.public_ip_address
            .as_deref()
            .or(self.private_ip_address.as_deref())
    }
}

impl AwsDriver {
    pub fn new(
        config: AwsConfig,
        launch: DaemonLaunch,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ProvisionError> {
        super::require(&config.image_id, "aws image_id")?;
        super::require(&config.region, "aws region")?;
        Ok(Self {
            config,
            launch,
            runner,
        })
    }

    async fn ec2(&self, rest: Vec<String>) -> Result<CommandOutput, ProvisionError> {
        let mut argv = vec![
            "--region".to_string(),
            self.config.region.clone(),
            "--output".to_string(),
            "json".to_string(),
            "ec2".to_string(),
        ];
        argv.extend(rest);
        self.runner.run(&self.config.aws_bin, &argv, None).await
    }

    fn handle(&self, instance_id: String) -> ResourceHandle {
        ResourceHandle::Aws {
            region: self.config.region.clone(),
            instance_id,
        }
    }

    fn instance_id<'a>(&self, handle: &'a ResourceHandle) -> Result<&'a str, ProvisionError> {
        match handle {
            ResourceHandle::Aws { instance_id, .. } => Ok(instance_id.as_str()),
            other => Err(ProvisionError::HandleMismatch {
                backend: BackendKind::Aws,
                handle: other.clone(),
            }),
        }
    }

    /// Live (not terminated) instance carrying our `Name` tag.
    async fn find_by_name(&self) -> Result<Option<Instance>, ProvisionError> {
        let out = self
            .ec2(vec![
                "describe-instances".into(),
                "--filters".into(),
                format!("Name=tag:Name,Values={}", self.config.instance_name),
                "Name=instance-state-name,Values=pending,running,stopping,stopped".into(),
            ])
            .await?
            .check()?;
        let described: DescribeInstances = out.json()?;
        Ok(described.into_instances().next())
    }

    async fn run_instance(&self) -> Result<String, ProvisionError> {
        let mut argv = vec![
            "run-instances".to_string(),
            "--image-id".into(),
            self.config.image_id.clone(),
            "--instance-type".into(),
            self.config.instance_type.clone(),
            "--count".into(),
            "1".into(),
            "--user-data".into(),
            self.launch.startup_script(),
            "--tag-specifications".into(),
            format!(
                "ResourceType=instance,Tags=[{{Key=Name,Value={}}}]",
                self.config.instance_name
            ),
        ];
        if !self.config.security_group_ids.is_empty() {
            argv.push("--security-group-ids".into());
            argv.extend(self.config.security_group_ids.iter().cloned());
        }
        if let Some(subnet) = self.config.subnet_ids.first() {
            argv.push("--subnet-id".into());
            argv.push(subnet.clone());
        }

        let out = self.ec2(argv).await?.check()?;
        let launched: RunInstances = out.json()?;
        launched
            .instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .ok_or_else(|| ProvisionError::Parse("run-instances returned no instances".into()))
    }
}

#[async_trait]
impl Driver for AwsDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Aws
    }

    async fn create(&self) -> Result<ResourceHandle, ProvisionError> {
        if let Some(existing) = self.find_by_name().await? {
            tracing::info!(
                instance_id = %existing.instance_id,
                state = %existing.state.name,
                "reusing tagged instance"
            );
            if existing.state.name == "stopped" {
                self.ec2(vec![
                    "start-instances".into(),
                    "--instance-ids".into(),
                    existing.instance_id.clone(),
                ])
                .await?
                .check()?;
            }
            return Ok(self.handle(existing.instance_id));
        }

        let instance_id = self.run_instance().await?;
        tracing::info!(%instance_id, region = %self.config.region, "launched instance");
        Ok(self.handle(instance_id))
    }

    async fn inspect(&self, handle: &ResourceHandle) -> Result<BackendState, ProvisionError> {
        let id = self.instance_id(handle)?;
        let out = self
            .ec2(vec!["describe-instances".into(), "--instance-ids".into(), id.to_string()])
            .await?;
        if out.is_not_found() {
            return Ok(BackendState::gone());
        }
        let described: DescribeInstances = out.check()?.json()?;
        let Some(instance) = described.into_instances().next() else {
            return Ok(BackendState::gone());
        };
        let endpoint = instance
            .address()
            .map(|host| Endpoint::new(host, self.launch.port));
        Ok(BackendState {
            running: instance.state.name == "running",
            endpoint,
        })
    }

    async fn teardown(&self, handle: &ResourceHandle) -> Result<(), ProvisionError> {
        let id = self.instance_id(handle)?;
        let out = self
            .ec2(vec!["terminate-instances".into(), "--instance-ids".into(), id.to_string()])
            .await?;
        if out.is_not_found() {
            return Ok(());
        }
        out.check()?;
        tracing::info!(instance_id = %id, "terminate requested");
        Ok(())
    }

    /// The instance id is only known once `run-instances` answers, so a
    /// launch whose reply was lost is found again by its `Name` tag.
    async fn find_orphan(&self) -> Result<Option<ResourceHandle>, ProvisionError> {
        Ok(self
            .find_by_name()
            .await?
            .map(|instance| self.handle(instance.instance_id)))
    }
}
