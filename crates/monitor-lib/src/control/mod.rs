//! Container runtime and host firewall collaborators
//!
//! The monitor only ever talks to the container runtime and the host firewall
//! through these traits. `IncusControl` and `FirewalldControl` drive the real
//! command-line tools; tests substitute in-memory fakes.

mod firewalld;
mod incus;

pub use firewalld::FirewalldControl;
pub use incus::{IncusConfig, IncusControl};

use crate::error::Result;
use async_trait::async_trait;
use std::net::IpAddr;

#[async_trait]
pub trait ContainerControl: Send + Sync {
    /// Freeze the container. Returns an "already in state" error when it is
    /// already frozen.
    async fn pause(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str, force: bool) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Run a command inside the container and return its stdout
    async fn exec(&self, name: &str, command: &[&str]) -> Result<String>;

    /// Primary IPv4 address, `None` when the container has none
    async fn ip(&self, name: &str) -> Result<Option<IpAddr>>;

    /// Host-side interface backing the container's primary NIC
    async fn interface_name(&self, name: &str) -> Result<Option<String>>;

    /// PID of the container's init process as seen from the host
    async fn init_pid(&self, name: &str) -> Result<Option<u32>>;
}

#[async_trait]
pub trait FirewallControl: Send + Sync {
    /// Remove every host firewall rule referencing `ip`; returns how many went
    async fn remove_rules(&self, ip: IpAddr) -> Result<usize>;

    async fn remove_zone_binding(&self, interface: &str) -> Result<()>;
}
