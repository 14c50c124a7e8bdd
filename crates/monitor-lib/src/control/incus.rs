use super::ContainerControl;
use crate::error::{MonitorError, Result};
use crate::exec::{render_command, CommandRunner, SystemRunner, DEFAULT_COMMAND_TIMEOUT};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IncusConfig {
    pub binary: String,
    pub project: String,
    /// NIC whose address and host interface are reported
    pub nic: String,
    pub timeout: Duration,
}

impl Default for IncusConfig {
    fn default() -> Self {
        Self {
            binary: "incus".to_string(),
            project: "default".to_string(),
            nic: "eth0".to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Subset of `GET /1.0/instances/<name>/state`
#[derive(Debug, Deserialize)]
struct InstanceState {
    #[serde(default)]
    pid: Option<i64>,
    #[serde(default)]
    network: Option<HashMap<String, NicState>>,
}

#[derive(Debug, Deserialize)]
struct NicState {
    #[serde(default)]
    host_name: String,
    #[serde(default)]
    addresses: Vec<NicAddress>,
}

#[derive(Debug, Deserialize)]
struct NicAddress {
    family: String,
    address: String,
}

/// Drives containers through the `incus` CLI
pub struct IncusControl {
    config: IncusConfig,
    runner: Arc<dyn CommandRunner>,
}

impl IncusControl {
    pub fn new(config: IncusConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: IncusConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn args<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["--project", self.config.project.as_str()];
        args.extend_from_slice(rest);
        args
    }

    async fn incus(&self, rest: &[&str]) -> Result<String> {
        let args = self.args(rest);
        self.runner
            .output(&self.config.binary, &args, self.config.timeout)
            .await
    }

    async fn state(&self, name: &str) -> Result<InstanceState> {
        let path = format!("/1.0/instances/{}/state", name);
        let raw = self.incus(&["query", &path]).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl ContainerControl for IncusControl {
    async fn pause(&self, name: &str) -> Result<()> {
        let args = self.args(&["pause", name]);
        let out = self
            .runner
            .run(&self.config.binary, &args, self.config.timeout)
            .await?;
        if out.success() {
            return Ok(());
        }

        let message = out.combined();
        let lower = message.to_lowercase();
        if lower.contains("already frozen") || lower.contains("already paused") {
            return Err(MonitorError::AlreadyInState {
                state: "frozen".to_string(),
            });
        }
        Err(MonitorError::CommandFailed {
            command: render_command(&self.config.binary, &args),
            message,
        })
    }

    async fn stop(&self, name: &str, force: bool) -> Result<()> {
        if force {
            self.incus(&["stop", name, "--force"]).await?;
        } else {
            self.incus(&["stop", name]).await?;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.incus(&["delete", name]).await?;
        Ok(())
    }

    async fn exec(&self, name: &str, command: &[&str]) -> Result<String> {
        let mut rest = vec!["exec", name, "--"];
        rest.extend_from_slice(command);
        self.incus(&rest).await
    }

    async fn ip(&self, name: &str) -> Result<Option<IpAddr>> {
        let state = self.state(name).await?;
        Ok(state
            .network
            .as_ref()
            .and_then(|nics| nics.get(&self.config.nic))
            .and_then(|nic| {
                nic.addresses
                    .iter()
                    .find(|addr| addr.family == "inet")
                    .and_then(|addr| addr.address.parse().ok())
            }))
    }

    async fn interface_name(&self, name: &str) -> Result<Option<String>> {
        let state = self.state(name).await?;
        Ok(state
            .network
            .as_ref()
            .and_then(|nics| nics.get(&self.config.nic))
            .map(|nic| nic.host_name.clone())
            .filter(|host| !host.is_empty()))
    }

    async fn init_pid(&self, name: &str) -> Result<Option<u32>> {
        let state = self.state(name).await?;
        Ok(state
            .pid
            .filter(|pid| *pid > 0)
            .and_then(|pid| u32::try_from(pid).ok()))
    }
}
