//! Event pipeline: real-time network monitoring from packet-filter logs
//!
//! Installs tagged LOG rules for the container, follows the kernel log,
//! classifies each logged packet and routes threats into the shared
//! [`Responder`].

mod journal;
mod log_reader;
mod rules;

pub use journal::{CloseGuard, JournalctlSource, KernelLogSource, JOURNAL_OPEN_TIMEOUT};
pub use log_reader::{parse_log_line, LogReader};
pub use rules::{
    extract_handle, log_prefix, NftInvocation, RuleCleaner, RuleManager, RuleManagerConfig,
    TAG_DNS, TAG_GENERAL, TAG_SUSPICIOUS,
};

#[cfg(test)]
pub(crate) use journal::fake as journal_fake;
#[cfg(test)]
pub(crate) use rules::fake;

use crate::detection::{NetworkDetector, NetworkDetectorConfig};
use crate::error::{MonitorError, Result};
use crate::exec::CommandRunner;
use crate::health::{components, HealthRegistry};
use crate::models::{NetworkEvent, ThreatAction};
use crate::observability::StructuredLogger;
use crate::response::Responder;
use crate::tables::ThreatTables;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PIPELINE: &str = "event";

#[derive(Debug, Clone)]
pub struct NetMonitorConfig {
    pub container_name: String,
    pub container_ip: IpAddr,
    pub allowlist: Vec<IpNetwork>,
    pub gateway_ip: Option<IpAddr>,
    pub dns_query_threshold: u32,
    pub log_dns_queries: bool,
    pub rate_limit_per_sec: u32,
    pub nft: NftInvocation,
    /// Parsed events buffered between the log reader and the detector
    pub event_buffer: usize,
    pub stop_timeout: Duration,
}

impl NetMonitorConfig {
    pub fn new(container_name: impl Into<String>, container_ip: IpAddr) -> Self {
        Self {
            container_name: container_name.into(),
            container_ip,
            allowlist: Vec::new(),
            gateway_ip: None,
            dns_query_threshold: 100,
            log_dns_queries: true,
            rate_limit_per_sec: 100,
            nft: NftInvocation::default(),
            event_buffer: 100,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

pub struct NetMonitor {
    config: NetMonitorConfig,
    runner: Arc<dyn CommandRunner>,
    source: Arc<dyn KernelLogSource>,
    responder: Arc<Responder>,
    tables: Arc<ThreatTables>,
    health: Option<HealthRegistry>,
}

impl NetMonitor {
    pub fn new(
        config: NetMonitorConfig,
        runner: Arc<dyn CommandRunner>,
        source: Arc<dyn KernelLogSource>,
        responder: Arc<Responder>,
    ) -> Self {
        Self {
            config,
            runner,
            source,
            responder,
            tables: Arc::new(ThreatTables::default()),
            health: None,
        }
    }

    pub fn with_tables(mut self, tables: Arc<ThreatTables>) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Open the kernel log, install the rules and spawn the pipeline tasks
    pub async fn start(self) -> Result<NetMonitorHandle> {
        let config = self.config;
        let logger = StructuredLogger::new(config.container_name.clone());

        let lines = self.source.open().await?;

        let rules = RuleManager::new(
            RuleManagerConfig {
                container_ip: config.container_ip,
                log_dns_queries: config.log_dns_queries,
                rate_limit_per_sec: config.rate_limit_per_sec,
                invocation: config.nft.clone(),
            },
            self.runner,
            self.tables.clone(),
        );
        if let Err(e) = rules.add_rules().await {
            self.source.close().await;
            return Err(e);
        }

        let detector = NetworkDetector::new(
            NetworkDetectorConfig {
                allowlist: config.allowlist.clone(),
                gateway_ip: config.gateway_ip,
                dns_query_threshold: config.dns_query_threshold,
                ..Default::default()
            },
            self.tables,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        if let Some(health) = &self.health {
            health.set_healthy(components::LOG_READER).await;
        }

        let reader = LogReader::new(config.container_ip);
        let reader_shutdown = shutdown_tx.subscribe();
        let reader_health = self.health.clone();
        let reader_task = tokio::spawn(async move {
            if reader.run(lines, event_tx, reader_shutdown).await {
                warn!("Kernel log stream ended unexpectedly");
                if let Some(health) = reader_health {
                    health
                        .set_unhealthy(components::LOG_READER, "kernel log stream ended")
                        .await;
                }
            }
        });

        let processor_task = tokio::spawn(process_events(
            detector,
            self.responder,
            event_rx,
            shutdown_tx.subscribe(),
        ));

        logger.log_startup(PIPELINE, env!("CARGO_PKG_VERSION"));

        Ok(NetMonitorHandle {
            shutdown_tx,
            tasks: vec![reader_task, processor_task],
            source: self.source,
            rules,
            stop_timeout: config.stop_timeout,
            logger,
        })
    }
}

async fn process_events(
    detector: NetworkDetector,
    responder: Arc<Responder>,
    mut events: mpsc::Receiver<NetworkEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(threat) = detector.analyze(&event) else {
                    debug!(dst = %event.dst_ip, dport = event.dst_port, "No threat for event");
                    continue;
                };
                match responder.handle(threat).await {
                    Ok(ThreatAction::Killed) => {
                        debug!("Container killed, remaining events are ignored");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to handle network threat");
                        responder.report_error(&e);
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Running event pipeline
pub struct NetMonitorHandle {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    source: Arc<dyn KernelLogSource>,
    rules: RuleManager,
    stop_timeout: Duration,
    logger: StructuredLogger,
}

impl NetMonitorHandle {
    /// Cancel the tasks, close the log source and remove the rules
    ///
    /// Rules already removed (for instance by a kill) are not an error.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.source.close().await;

        let tasks = self.tasks;
        let joined = tokio::time::timeout(self.stop_timeout, async move {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Event pipeline task panicked");
                }
            }
        })
        .await;

        let removal = match self.rules.remove_rules().await {
            Ok(removed) => {
                info!(removed, "Removed packet-filter rules");
                Ok(())
            }
            Err(e) if e.is_rule_not_found() => {
                warn!(error = %e, "No packet-filter rules left to remove");
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.logger.log_shutdown(PIPELINE, "stop requested");

        if joined.is_err() {
            return Err(MonitorError::ShutdownTimeout(self.stop_timeout));
        }
        removal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::fake::FakeContainer;
    use crate::exec::{fake::ScriptedRunner, CommandOutput};
    use crate::response::{MonitorCallbacks, ResponderConfig};
    use super::fake::FakeNft;
    use super::journal_fake::ScriptedSource;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    const IP: &str = "10.47.62.50";

    fn line(dst: &str, dport: u16) -> String {
        format!(
            "NFT_SUSPICIOUS[{IP}]: IN=incusbr0 OUT=eth0 SRC={IP} DST={dst} PROTO=TCP SPT=40000 DPT={dport} SYN"
        )
    }

    #[tokio::test]
    async fn test_metadata_access_kills_container() {
        let metadata = line("169.254.169.254", 80);
        let source = Arc::new(ScriptedSource::new(&[metadata.as_str()]));
        let nft = Arc::new(FakeNft::with_chain());
        let control = Arc::new(FakeContainer::with_network(IP, "veth1"));
        let threats = Arc::new(Mutex::new(Vec::new()));
        let seen = threats.clone();

        let responder = Arc::new(
            Responder::new(ResponderConfig::new("dev"), control.clone())
                .with_rule_cleaner(Arc::new(RuleCleaner::new(
                    nft.clone(),
                    NftInvocation::default(),
                )))
                .with_callbacks(MonitorCallbacks::new().on_threat(move |t| {
                    seen.lock().unwrap().push(t.title.clone());
                })),
        );

        let handle = NetMonitor::new(
            NetMonitorConfig::new("dev", IP.parse().unwrap()),
            nft.clone(),
            source.clone(),
            responder.clone(),
        )
        .start()
        .await
        .unwrap();
        assert_eq!(nft.rules().len(), 4);

        for _ in 0..50 {
            if responder.is_killed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(responder.is_killed());
        assert_eq!(
            *threats.lock().unwrap(),
            vec!["Cloud metadata endpoint access".to_string()]
        );
        // the kill already swept the rules
        assert!(nft.rules().is_empty());

        handle.stop().await.unwrap();
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_removes_rules() {
        let source = Arc::new(ScriptedSource::new(&[]));
        let nft = Arc::new(FakeNft::with_chain());
        nft.push_foreign("ct state established accept");
        let responder = Arc::new(Responder::new(
            ResponderConfig::new("dev"),
            Arc::new(FakeContainer::default()),
        ));
        let health = HealthRegistry::new();

        let handle = NetMonitor::new(
            NetMonitorConfig::new("dev", IP.parse().unwrap()),
            nft.clone(),
            source.clone(),
            responder,
        )
        .with_health(health.clone())
        .start()
        .await
        .unwrap();
        assert_eq!(nft.rules().len(), 5);

        handle.stop().await.unwrap();
        assert_eq!(nft.rules(), vec!["ct state established accept".to_string()]);
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rule_failure_closes_source() {
        let source = Arc::new(ScriptedSource::new(&[]));
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            Ok(CommandOutput::failed(1, "Operation not permitted"))
        }));
        let responder = Arc::new(Responder::new(
            ResponderConfig::new("dev"),
            Arc::new(FakeContainer::default()),
        ));

        let result = NetMonitor::new(
            NetMonitorConfig::new("dev", IP.parse().unwrap()),
            runner,
            source.clone(),
            responder,
        )
        .start()
        .await;
        assert!(result.is_err());
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }
}
