//! Per-tick metric collection for one container
//!
//! Four sub-collectors (network, process, filesystem, resources) run
//! concurrently; the snapshot is assembled only after all of them finish.
//! A failing sub-collector marks its domain unavailable and records an
//! error string, it never fails the snapshot.

mod cgroup;
mod filesystem;
mod network;
mod process;

#[cfg(test)]
mod tests;

pub use cgroup::{CgroupReader, CpuStat, IoCounters};
pub use filesystem::{parse_df, FilesystemMonitor, TmpUsage};
pub use network::{
    check_suspicious, parse_hex_addr, parse_hex_ip, parse_proc_net_tcp, tcp_state_name,
    NetworkCollector,
};
pub use process::{
    check_env_access, detect_env_scanning, detect_reverse_shells, parse_ps_aux, parse_ps_eo,
    ProcessCollector,
};

use crate::control::ContainerControl;
use crate::error::{MetricDomain, MonitorError};
use crate::models::{FilesystemStats, NetworkStats, ProcessStats, ResourceStats, Snapshot};
use crate::tables::ThreatTables;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Configuration for the snapshot collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub container_name: String,
    pub container_ip: Option<IpAddr>,
    pub workspace_path: Option<String>,
    pub allowlist: Vec<IpNetwork>,
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
}

impl CollectorConfig {
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            container_ip: None,
            workspace_path: None,
            allowlist: Vec::new(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

pub struct Collector {
    config: CollectorConfig,
    control: Arc<dyn ContainerControl>,
    network: NetworkCollector,
    processes: ProcessCollector,
    filesystem: FilesystemMonitor,
    cgroup: CgroupReader,
}

fn domain_error(domain: MetricDomain, err: anyhow::Error) -> String {
    MonitorError::Collection {
        domain,
        message: format!("{:#}", err),
    }
    .to_string()
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        control: Arc<dyn ContainerControl>,
        tables: Arc<ThreatTables>,
    ) -> Self {
        Self {
            network: NetworkCollector::new(
                config.proc_root.clone(),
                config.allowlist.clone(),
                tables.clone(),
            ),
            processes: ProcessCollector::new(tables),
            filesystem: FilesystemMonitor::new(),
            cgroup: CgroupReader::with_proc_path(config.cgroup_root.clone(), config.proc_root.clone()),
            config,
            control,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.config.container_name
    }

    pub fn container_ip(&self) -> Option<IpAddr> {
        self.config.container_ip
    }

    /// Gather a complete snapshot
    pub async fn collect(&self) -> Snapshot {
        let name = self.config.container_name.as_str();
        let control = self.control.as_ref();
        let timestamp = chrono::Utc::now();

        let (network, processes, filesystem, resources) = tokio::join!(
            self.network.collect(self.config.container_ip),
            self.processes.collect(name, control),
            self.filesystem.collect(name, &self.cgroup, control),
            self.cgroup.collect(name, control),
        );

        let mut errors = Vec::new();

        let network = network.unwrap_or_else(|e| {
            errors.push(domain_error(MetricDomain::Network, e));
            NetworkStats::default()
        });
        let processes = processes.unwrap_or_else(|e| {
            errors.push(domain_error(MetricDomain::Process, e));
            ProcessStats::default()
        });
        let filesystem = match filesystem {
            Ok(mut stats) => {
                stats.workspace_path = self.config.workspace_path.clone();
                stats
            }
            Err(e) => {
                errors.push(domain_error(MetricDomain::Filesystem, e));
                FilesystemStats::default()
            }
        };
        let resources = resources.unwrap_or_else(|e| {
            errors.push(domain_error(MetricDomain::Resources, e));
            ResourceStats::default()
        });

        debug!(
            container = %name,
            connections = network.active_connections,
            processes = processes.total_count,
            errors = errors.len(),
            "Snapshot collected"
        );

        Snapshot {
            timestamp,
            container_name: self.config.container_name.clone(),
            container_ip: self.config.container_ip,
            network,
            processes,
            filesystem,
            resources,
            threats: Vec::new(),
            errors,
        }
    }
}
