//! Agent configuration

use anyhow::{bail, Context, Result};
use monitor_lib::{
    detection::DetectorConfig, tables::parse_allowlist, DaemonConfig, NetMonitorConfig,
    ResponderConfig,
};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "CAGE_MONITOR";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name of the container to watch
    #[serde(default)]
    pub container_name: String,

    /// Host path of the container workspace, reported in snapshots
    #[serde(default)]
    pub workspace_path: Option<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,

    /// CIDRs exempt from network threat detection
    #[serde(default)]
    pub allowlist: Vec<String>,

    #[serde(default = "default_volume_threshold")]
    pub read_threshold_mb: f64,
    #[serde(default = "default_rate_threshold")]
    pub read_rate_mb_per_sec: f64,
    #[serde(default = "default_volume_threshold")]
    pub write_threshold_mb: f64,
    #[serde(default = "default_rate_threshold")]
    pub write_rate_mb_per_sec: f64,

    #[serde(default = "default_true")]
    pub auto_pause_on_high: bool,
    #[serde(default = "default_true")]
    pub auto_kill_on_critical: bool,
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_secs: u64,

    /// Run the packet-log event pipeline next to the poll pipeline
    #[serde(default = "default_true")]
    pub network_monitoring: bool,
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
    #[serde(default = "default_dns_query_threshold")]
    pub dns_query_threshold: u32,
    #[serde(default = "default_true")]
    pub log_dns_queries: bool,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_sec: u32,

    /// Port for health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

fn default_poll_interval() -> u64 {
    2
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/cage-monitor/audit.jsonl")
}

fn default_volume_threshold() -> f64 {
    50.0
}

fn default_rate_threshold() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_dedupe_window() -> u64 {
    30
}

fn default_dns_query_threshold() -> u32 {
    100
}

fn default_rate_limit() -> u32 {
    100
}

fn default_api_port() -> u16 {
    9464
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

impl AgentConfig {
    /// Load from the optional config file and `CAGE_MONITOR_*` variables
    ///
    /// The file path usually arrives through `CAGE_MONITOR_CONFIG`.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowlist"),
            )
            .build()
            .context("failed to read configuration")?;
        Self::from_config(config)
    }

    fn from_config(config: config::Config) -> Result<Self> {
        let agent: AgentConfig = config
            .try_deserialize()
            .context("invalid configuration")?;
        agent.validate()?;
        Ok(agent)
    }

    fn validate(&self) -> Result<()> {
        if self.container_name.trim().is_empty() {
            bail!("container_name is required");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be at least 1");
        }
        let parsed = parse_allowlist(&self.allowlist);
        if parsed.len() != self.allowlist.len() {
            bail!("allowlist contains invalid CIDR entries: {:?}", self.allowlist);
        }
        Ok(())
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            container_name: self.container_name.clone(),
            container_ip: None,
            workspace_path: self.workspace_path.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            allowlist: parse_allowlist(&self.allowlist),
            detector: DetectorConfig {
                read_threshold_mb: self.read_threshold_mb,
                read_rate_mb_per_sec: self.read_rate_mb_per_sec,
                write_threshold_mb: self.write_threshold_mb,
                write_rate_mb_per_sec: self.write_rate_mb_per_sec,
                ..Default::default()
            },
            cgroup_root: self.cgroup_root.clone(),
            proc_root: self.proc_root.clone(),
            ..Default::default()
        }
    }

    pub fn responder_config(&self) -> ResponderConfig {
        ResponderConfig {
            auto_pause_on_high: self.auto_pause_on_high,
            auto_kill_on_critical: self.auto_kill_on_critical,
            dedupe_window: Duration::from_secs(self.dedupe_window_secs),
            ..ResponderConfig::new(self.container_name.clone())
        }
    }

    pub fn net_monitor_config(&self, container_ip: IpAddr) -> NetMonitorConfig {
        NetMonitorConfig {
            allowlist: parse_allowlist(&self.allowlist),
            gateway_ip: self.gateway_ip,
            dns_query_threshold: self.dns_query_threshold,
            log_dns_queries: self.log_dns_queries,
            rate_limit_per_sec: self.rate_limit_per_sec,
            ..NetMonitorConfig::new(self.container_name.clone(), container_ip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    fn from_toml(toml: &str) -> Result<AgentConfig> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        AgentConfig::from_config(config)
    }

    #[test]
    fn test_defaults() {
        let config = from_toml(r#"container_name = "dev""#).unwrap();
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.api_port, 9464);
        assert!(config.auto_pause_on_high);
        assert!(config.network_monitoring);

        let daemon = config.daemon_config();
        assert_eq!(daemon.poll_interval, Duration::from_secs(2));
        assert_eq!(daemon.detector.write_threshold_mb, 50.0);
        assert!(daemon.container_ip.is_none());

        let responder = config.responder_config();
        assert_eq!(responder.container_name, "dev");
        assert_eq!(responder.dedupe_window, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_flow_into_library_configs() {
        let config = from_toml(
            r#"
            container_name = "build-7"
            poll_interval_secs = 5
            allowlist = ["10.0.0.0/8", "203.0.113.7/32"]
            write_threshold_mb = 200.0
            auto_kill_on_critical = false
            gateway_ip = "10.47.62.1"
            dns_query_threshold = 20
            "#,
        )
        .unwrap();

        let daemon = config.daemon_config();
        assert_eq!(daemon.allowlist.len(), 2);
        assert_eq!(daemon.detector.write_threshold_mb, 200.0);
        assert!(!config.responder_config().auto_kill_on_critical);

        let net = config.net_monitor_config("10.47.62.50".parse().unwrap());
        assert_eq!(net.gateway_ip, Some("10.47.62.1".parse().unwrap()));
        assert_eq!(net.dns_query_threshold, 20);
        assert_eq!(net.container_name, "build-7");
    }

    #[test]
    fn test_rejects_missing_name_and_bad_cidr() {
        assert!(from_toml("poll_interval_secs = 2").is_err());
        assert!(from_toml(
            r#"
            container_name = "dev"
            allowlist = ["not-a-cidr"]
            "#
        )
        .is_err());
    }
}
