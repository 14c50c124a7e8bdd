//! Core data models for the container monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Point-in-time view of one container, produced once per poll tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_ip: Option<IpAddr>,
    pub network: NetworkStats,
    pub processes: ProcessStats,
    pub filesystem: FilesystemStats,
    pub resources: ResourceStats,
    #[serde(default)]
    pub threats: Vec<ThreatEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Network connections seen for the container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub available: bool,
    pub active_connections: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
    pub suspicious_count: usize,
}

/// A TCP connection decoded from the kernel connection tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub protocol: String,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub state: String,
    #[serde(default)]
    pub uid: u32,
    pub suspicious: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspect_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessStats {
    pub available: bool,
    pub total_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<Process>,
}

/// A process running inside the container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u32,
    /// Not every `ps` flavour reports the parent pid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,
    pub user: String,
    pub command: String,
    pub env_access: bool,
}

/// Workspace I/O for the current poll interval plus temp-storage usage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemStats {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    pub total_read_mb: f64,
    pub read_rate_mb_per_sec: f64,
    pub total_write_mb: f64,
    pub write_rate_mb_per_sec: f64,
    #[serde(default)]
    pub tmp_used_mb: f64,
    #[serde(default)]
    pub tmp_total_mb: f64,
    #[serde(default)]
    pub tmp_used_percent: f64,
}

/// Resource usage read from the container's cgroup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    pub available: bool,
    pub cpu_time_seconds: f64,
    pub user_cpu_seconds: f64,
    pub sys_cpu_seconds: f64,
    pub memory_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<f64>,
    pub io_read_mb: f64,
    pub io_write_mb: f64,
}

/// Threat severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Info,
    Warning,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Info => "info",
            ThreatLevel::Warning => "warning",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatCategory {
    Network,
    Process,
    Environment,
    Filesystem,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::Network => "network",
            ThreatCategory::Process => "process",
            ThreatCategory::Environment => "environment",
            ThreatCategory::Filesystem => "filesystem",
        }
    }
}

impl std::fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded on a threat once the responder has handled it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatAction {
    Pending,
    Logged,
    Alerted,
    Paused,
    Killed,
    Deduplicated,
}

impl ThreatAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatAction::Pending => "pending",
            ThreatAction::Logged => "logged",
            ThreatAction::Alerted => "alerted",
            ThreatAction::Paused => "paused",
            ThreatAction::Killed => "killed",
            ThreatAction::Deduplicated => "deduplicated",
        }
    }
}

impl std::fmt::Display for ThreatAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A process that matched a reverse-shell or env-scanning rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMatch {
    pub pid: u32,
    pub command: String,
    pub user: String,
    pub pattern: String,
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    Read,
    Write,
}

impl std::fmt::Display for IoDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoDirection::Read => write!(f, "read"),
            IoDirection::Write => write!(f, "write"),
        }
    }
}

/// Which threshold a filesystem breach crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachWindow {
    /// Volume moved during the current poll interval
    Interval,
    /// Sustained rate in MB/s
    Sustained,
}

/// Filesystem volume or rate over its configured threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemBreach {
    pub direction: IoDirection,
    pub window: BreachWindow,
    pub volume_mb: f64,
    pub rate_mb_per_sec: f64,
    pub threshold: f64,
}

/// Evidence attached to a threat, one case per kind of source record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Evidence {
    Connection(Connection),
    Process(ProcessMatch),
    Filesystem(FilesystemBreach),
    Packet(NetworkEvent),
    Fields(BTreeMap<String, serde_json::Value>),
    Other(serde_json::Value),
}

impl Evidence {
    /// Short stable identity of the evidence, used to tell apart threats that
    /// share a category and title
    pub fn summary(&self) -> Option<String> {
        match self {
            Evidence::Connection(conn) => Some(conn.remote_addr.to_string()),
            Evidence::Process(proc_match) => {
                Some(format!("{}:{}", proc_match.pid, proc_match.pattern))
            }
            Evidence::Filesystem(breach) => Some(format!(
                "{}:{}",
                breach.direction,
                match breach.window {
                    BreachWindow::Interval => "interval",
                    BreachWindow::Sustained => "sustained",
                }
            )),
            Evidence::Packet(event) => Some(format!("{}:{}", event.dst_ip, event.dst_port)),
            Evidence::Fields(_) | Evidence::Other(_) => None,
        }
    }
}

/// A detected security event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: ThreatLevel,
    pub category: ThreatCategory,
    pub title: String,
    pub description: String,
    pub evidence: Evidence,
    pub action: ThreatAction,
}

impl ThreatEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        level: ThreatLevel,
        category: ThreatCategory,
        title: impl Into<String>,
        description: impl Into<String>,
        evidence: Evidence,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            level,
            category,
            title: title.into(),
            description: description.into(),
            evidence,
            action: ThreatAction::Pending,
        }
    }

    /// Deduplication key: category, title and evidence summary
    pub fn dedup_key(&self) -> String {
        match self.evidence.summary() {
            Some(summary) => format!("{}:{}:{}", self.category, self.title, summary),
            None => format!("{}:{}", self.category, self.title),
        }
    }
}

/// Packet metadata recovered from one packet-filter log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub timestamp: DateTime<Utc>,
    /// Address embedded in the rule tag
    pub container_ip: IpAddr,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default)]
    pub in_interface: String,
    #[serde(default)]
    pub out_interface: String,
}
