//! One driver per backend. `build_driver` is the only place that maps a
//! `Backend` variant to an implementation.

pub mod aws;
pub mod azure;
pub mod docker;
pub mod gcp;
pub mod kubernetes;
pub mod manual;

use std::sync::Arc;

use super::command::{CommandRunner, shell_escape};
use super::driver::Driver;
use super::error::ProvisionError;
use super::types::{Backend, ProvisionerConfig};

/// What every driver needs to launch the daemon, besides its own config.
#[derive(Debug, Clone)]
pub struct DaemonLaunch {
    pub port: u16,
    pub token: String,
}

impl DaemonLaunch {
    /// Boot script for cloud VMs. The image is expected to ship the
    /// `commandrig` binary on PATH.
    pub fn startup_script(&self) -> String {
        let token = shell_escape(&self.token);
        format!(
            "#!/bin/sh\n\
             export DAEMON_PORT={port}\n\
             export DAEMON_TOKEN={token}\n\
             nohup commandrig daemon --host 0.0.0.0 --port {port} > /var/log/commandrig-daemon.log 2>&1 &\n",
            port = self.port,
        )
    }
}

pub fn build_driver(
    config: &ProvisionerConfig,
    launch: DaemonLaunch,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn Driver>, ProvisionError> {
    let driver: Arc<dyn Driver> = match &config.backend {
        Backend::Manual => Arc::new(manual::ManualDriver::new(launch)),
        Backend::Docker(cfg) => Arc::new(docker::DockerDriver::new(cfg.clone(), launch)?),
        Backend::Kubernetes(cfg) => {
            Arc::new(kubernetes::KubernetesDriver::new(cfg.clone(), launch, runner)?)
        }
        Backend::Aws(cfg) => Arc::new(aws::AwsDriver::new(cfg.clone(), launch, runner)?),
        Backend::Azure(cfg) => Arc::new(azure::AzureDriver::new(cfg.clone(), launch, runner)?),
        Backend::Gcp(cfg) => Arc::new(gcp::GcpDriver::new(cfg.clone(), launch, runner)?),
    };
    Ok(driver)
}

fn require(value: &str, what: &str) -> Result<(), ProvisionError> {
    if value.trim().is_empty() {
        return Err(ProvisionError::Config(format!("{what} is required")));
    }
    Ok(())
}
