//! Snapshot-based threat detection

use crate::collector::{detect_env_scanning, detect_reverse_shells};
use crate::models::{
    BreachWindow, Evidence, FilesystemBreach, FilesystemStats, IoDirection, Snapshot,
    ThreatCategory, ThreatEvent, ThreatLevel,
};
use crate::tables::ThreatTables;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Thresholds for filesystem-based detection
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// MB read within one poll interval before alerting
    pub read_threshold_mb: f64,
    /// Sustained read rate in MB/s; zero disables
    pub read_rate_mb_per_sec: f64,
    pub write_threshold_mb: f64,
    pub write_rate_mb_per_sec: f64,
    /// `/tmp` usage percent above which a warning is raised
    pub tmp_warning_percent: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            read_threshold_mb: 50.0,
            read_rate_mb_per_sec: 10.0,
            write_threshold_mb: 50.0,
            write_rate_mb_per_sec: 10.0,
            tmp_warning_percent: 80.0,
        }
    }
}

/// Check one direction of workspace I/O against its volume and rate thresholds
fn check_volume(
    direction: IoDirection,
    volume_mb: f64,
    rate_mb_per_sec: f64,
    threshold_mb: f64,
    rate_threshold: f64,
) -> Option<FilesystemBreach> {
    if threshold_mb > 0.0 && volume_mb > threshold_mb {
        return Some(FilesystemBreach {
            direction,
            window: BreachWindow::Interval,
            volume_mb,
            rate_mb_per_sec,
            threshold: threshold_mb,
        });
    }
    if rate_threshold > 0.0 && rate_mb_per_sec > rate_threshold {
        return Some(FilesystemBreach {
            direction,
            window: BreachWindow::Sustained,
            volume_mb,
            rate_mb_per_sec,
            threshold: rate_threshold,
        });
    }
    None
}

/// Stateless analysis of a snapshot; only threat ids vary between runs
pub struct Detector {
    config: DetectorConfig,
    tables: Arc<ThreatTables>,
}

impl Detector {
    pub fn new(config: DetectorConfig, tables: Arc<ThreatTables>) -> Self {
        Self { config, tables }
    }

    pub fn analyze(&self, snapshot: &Snapshot) -> Vec<ThreatEvent> {
        let ts = snapshot.timestamp;
        let mut threats = Vec::new();

        if snapshot.processes.available {
            for shell in detect_reverse_shells(&snapshot.processes.processes, &self.tables) {
                threats.push(ThreatEvent::new(
                    ts,
                    ThreatLevel::Critical,
                    ThreatCategory::Process,
                    "Reverse shell detected",
                    format!(
                        "Process '{}' (PID {}) matches reverse shell pattern '{}'",
                        shell.command, shell.pid, shell.pattern
                    ),
                    Evidence::Process(shell),
                ));
            }

            for scan in detect_env_scanning(&snapshot.processes.processes) {
                threats.push(ThreatEvent::new(
                    ts,
                    ThreatLevel::Warning,
                    ThreatCategory::Environment,
                    "Environment variable scanning detected",
                    format!(
                        "Process '{}' (PID {}) is accessing environment variables",
                        scan.command, scan.pid
                    ),
                    Evidence::Process(scan),
                ));
            }
        }

        for conn in snapshot.network.connections.iter().filter(|c| c.suspicious) {
            let remote = conn.remote_addr;
            let level = if self.tables.is_critical_port(remote.port())
                || self.tables.is_metadata(&remote.ip())
            {
                ThreatLevel::Critical
            } else {
                ThreatLevel::High
            };
            threats.push(ThreatEvent::new(
                ts,
                level,
                ThreatCategory::Network,
                "Unexpected network connection",
                format!(
                    "Connection to {}: {}",
                    remote,
                    conn.suspect_reason.as_deref().unwrap_or("suspicious")
                ),
                Evidence::Connection(conn.clone()),
            ));
        }

        if snapshot.filesystem.available {
            threats.extend(self.filesystem_threats(&snapshot.filesystem, ts));
        }

        threats
    }

    fn filesystem_threats(
        &self,
        fs: &FilesystemStats,
        ts: chrono::DateTime<chrono::Utc>,
    ) -> Vec<ThreatEvent> {
        let mut threats = Vec::new();
        let cfg = &self.config;

        let checks = [
            (
                check_volume(
                    IoDirection::Read,
                    fs.total_read_mb,
                    fs.read_rate_mb_per_sec,
                    cfg.read_threshold_mb,
                    cfg.read_rate_mb_per_sec,
                ),
                "Large workspace read",
            ),
            (
                check_volume(
                    IoDirection::Write,
                    fs.total_write_mb,
                    fs.write_rate_mb_per_sec,
                    cfg.write_threshold_mb,
                    cfg.write_rate_mb_per_sec,
                ),
                "Large workspace write",
            ),
        ];

        for (breach, title) in checks {
            let Some(breach) = breach else { continue };
            let verb = match breach.direction {
                IoDirection::Read => "Read",
                IoDirection::Write => "Wrote",
            };
            let unit = match breach.window {
                BreachWindow::Interval => "MB",
                BreachWindow::Sustained => "MB/sec",
            };
            threats.push(ThreatEvent::new(
                ts,
                ThreatLevel::High,
                ThreatCategory::Filesystem,
                title,
                format!(
                    "{} {:.2} MB at {:.2} MB/sec (threshold: {:.2} {})",
                    verb, breach.volume_mb, breach.rate_mb_per_sec, breach.threshold, unit
                ),
                Evidence::Filesystem(breach),
            ));
        }

        if fs.tmp_total_mb > 0.0 && fs.tmp_used_percent > cfg.tmp_warning_percent {
            let mut fields = BTreeMap::new();
            fields.insert("tmp_used_mb".to_string(), serde_json::json!(fs.tmp_used_mb));
            fields.insert("tmp_total_mb".to_string(), serde_json::json!(fs.tmp_total_mb));
            fields.insert(
                "tmp_used_percent".to_string(),
                serde_json::json!(fs.tmp_used_percent),
            );
            threats.push(ThreatEvent::new(
                ts,
                ThreatLevel::Warning,
                ThreatCategory::Filesystem,
                "Low disk space on /tmp",
                format!(
                    "/tmp is {:.1}% full ({:.0}MB used of {:.0}MB total)",
                    fs.tmp_used_percent, fs.tmp_used_mb, fs.tmp_total_mb
                ),
                Evidence::Fields(fields),
            ));
        }

        threats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Connection, NetworkStats, Process, ProcessStats, ResourceStats, ThreatAction,
    };
    use chrono::Utc;

    fn process(pid: u32, command: &str, env_access: bool) -> Process {
        Process {
            pid,
            ppid: Some(1),
            user: "code".to_string(),
            command: command.to_string(),
            env_access,
        }
    }

    fn connection(remote: &str, reason: &str) -> Connection {
        Connection {
            protocol: "tcp".to_string(),
            local_addr: "10.47.62.50:40000".parse().unwrap(),
            remote_addr: remote.parse().unwrap(),
            state: "ESTABLISHED".to_string(),
            uid: 1000,
            suspicious: true,
            suspect_reason: Some(reason.to_string()),
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            timestamp: Utc::now(),
            container_name: "dev".to_string(),
            container_ip: "10.47.62.50".parse().ok(),
            network: NetworkStats {
                available: true,
                active_connections: 3,
                connections: vec![
                    connection("203.0.113.9:4444", "Suspicious port"),
                    connection("10.1.2.3:22", "RFC1918"),
                    Connection {
                        suspicious: false,
                        suspect_reason: None,
                        ..connection("8.8.8.8:443", "")
                    },
                ],
                suspicious_count: 2,
            },
            processes: ProcessStats {
                available: true,
                total_count: 3,
                processes: vec![
                    process(10, "bash -i", false),
                    process(11, "printenv", true),
                    process(12, "cargo build", false),
                ],
            },
            filesystem: FilesystemStats {
                available: true,
                total_read_mb: 120.0,
                read_rate_mb_per_sec: 60.0,
                tmp_total_mb: 1000.0,
                tmp_used_mb: 900.0,
                tmp_used_percent: 90.0,
                ..Default::default()
            },
            resources: ResourceStats::default(),
            threats: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn detector() -> Detector {
        Detector::new(DetectorConfig::default(), Arc::new(ThreatTables::default()))
    }

    #[test]
    fn test_detection_order_and_levels() {
        let threats = detector().analyze(&snapshot());
        let summary: Vec<(ThreatLevel, ThreatCategory, &str)> = threats
            .iter()
            .map(|t| (t.level, t.category, t.title.as_str()))
            .collect();

        assert_eq!(
            summary,
            vec![
                (ThreatLevel::Critical, ThreatCategory::Process, "Reverse shell detected"),
                (
                    ThreatLevel::Warning,
                    ThreatCategory::Environment,
                    "Environment variable scanning detected"
                ),
                (ThreatLevel::Critical, ThreatCategory::Network, "Unexpected network connection"),
                (ThreatLevel::High, ThreatCategory::Network, "Unexpected network connection"),
                (ThreatLevel::High, ThreatCategory::Filesystem, "Large workspace read"),
                (ThreatLevel::Warning, ThreatCategory::Filesystem, "Low disk space on /tmp"),
            ]
        );
        assert!(threats.iter().all(|t| t.action == ThreatAction::Pending));
    }

    #[test]
    fn test_detection_is_deterministic() {
        let detector = detector();
        let snap = snapshot();
        let strip = |threats: Vec<ThreatEvent>| -> Vec<String> {
            threats
                .into_iter()
                .map(|t| {
                    format!(
                        "{}|{}|{}|{}|{}",
                        t.level,
                        t.category,
                        t.title,
                        t.description,
                        serde_json::to_string(&t.evidence).unwrap()
                    )
                })
                .collect()
        };
        let first = detector.analyze(&snap);
        let second = detector.analyze(&snap);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(strip(first), strip(second));
    }

    #[test]
    fn test_sustained_write_rate() {
        let mut snap = snapshot();
        snap.processes.available = false;
        snap.network.connections.clear();
        snap.filesystem = FilesystemStats {
            available: true,
            total_write_mb: 20.0,
            write_rate_mb_per_sec: 15.0,
            ..Default::default()
        };

        let threats = detector().analyze(&snap);
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].title, "Large workspace write");
        match &threats[0].evidence {
            Evidence::Filesystem(breach) => {
                assert_eq!(breach.window, BreachWindow::Sustained);
                assert_eq!(breach.threshold, 10.0);
            }
            other => panic!("unexpected evidence {other:?}"),
        }
    }

    #[test]
    fn test_unavailable_domains_are_skipped() {
        let mut snap = snapshot();
        snap.processes.available = false;
        snap.filesystem.available = false;
        snap.network.connections.clear();
        assert!(detector().analyze(&snap).is_empty());
    }

    #[test]
    fn test_metadata_connection_is_critical() {
        let mut snap = snapshot();
        snap.processes.available = false;
        snap.filesystem.available = false;
        snap.network.connections = vec![connection(
            "169.254.169.254:80",
            "Cloud metadata endpoint access",
        )];
        let threats = detector().analyze(&snap);
        assert_eq!(threats[0].level, ThreatLevel::Critical);
    }
}
