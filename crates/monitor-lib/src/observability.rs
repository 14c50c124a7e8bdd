//! Observability infrastructure for the container monitor
//!
//! Provides:
//! - Prometheus metrics (collection latency, snapshots, threats, actions, packet events)
//! - Structured JSON logging with tracing

use crate::models::{Snapshot, ThreatAction, ThreatEvent, ThreatLevel};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    collection_latency_seconds: Histogram,
    snapshots_collected: IntCounter,
    collection_errors: IntCounter,
    threats_detected: IntCounterVec,
    actions_taken: IntCounterVec,
    network_events_parsed: IntCounter,
    network_events_dropped: IntCounter,
    kernel_log_lines_dropped: IntCounter,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            collection_latency_seconds: register_histogram!(
                "cage_monitor_collection_latency_seconds",
                "Time spent collecting one container snapshot",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            snapshots_collected: register_int_counter!(
                "cage_monitor_snapshots_collected_total",
                "Total number of snapshots collected"
            )
            .expect("Failed to register snapshots_collected"),

            collection_errors: register_int_counter!(
                "cage_monitor_collection_errors_total",
                "Total number of per-domain collection errors"
            )
            .expect("Failed to register collection_errors"),

            threats_detected: register_int_counter_vec!(
                "cage_monitor_threats_detected_total",
                "Threats detected by level",
                &["level"]
            )
            .expect("Failed to register threats_detected"),

            actions_taken: register_int_counter_vec!(
                "cage_monitor_actions_total",
                "Responder actions by kind",
                &["action"]
            )
            .expect("Failed to register actions_taken"),

            network_events_parsed: register_int_counter!(
                "cage_monitor_network_events_parsed_total",
                "Packet log lines parsed into network events"
            )
            .expect("Failed to register network_events_parsed"),

            network_events_dropped: register_int_counter!(
                "cage_monitor_network_events_dropped_total",
                "Network events dropped because the channel was full"
            )
            .expect("Failed to register network_events_dropped"),

            kernel_log_lines_dropped: register_int_counter!(
                "cage_monitor_kernel_log_lines_dropped_total",
                "Raw kernel log lines dropped because the line buffer was full"
            )
            .expect("Failed to register kernel_log_lines_dropped"),
        }
    }
}

/// Monitor metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct MonitorMetrics {
    _private: (),
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MonitorMetricsInner {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new)
    }

    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.inner().collection_latency_seconds.observe(duration_secs);
    }

    pub fn inc_snapshots_collected(&self) {
        self.inner().snapshots_collected.inc();
    }

    pub fn add_collection_errors(&self, count: usize) {
        self.inner().collection_errors.inc_by(count as u64);
    }

    pub fn inc_threat(&self, level: ThreatLevel) {
        self.inner()
            .threats_detected
            .with_label_values(&[level.as_str()])
            .inc();
    }

    pub fn inc_action(&self, action: ThreatAction) {
        self.inner()
            .actions_taken
            .with_label_values(&[action.as_str()])
            .inc();
    }

    pub fn inc_network_events_parsed(&self) {
        self.inner().network_events_parsed.inc();
    }

    pub fn inc_network_events_dropped(&self) {
        self.inner().network_events_dropped.inc();
    }

    pub fn inc_kernel_log_lines_dropped(&self) {
        self.inner().kernel_log_lines_dropped.inc();
    }

    pub fn kernel_log_lines_dropped(&self) -> u64 {
        self.inner().kernel_log_lines_dropped.get()
    }
}

/// Structured logger for monitor events
///
/// Provides consistent JSON-formatted logging for snapshots, threats
/// and container actions.
#[derive(Clone)]
pub struct StructuredLogger {
    container: String,
}

impl StructuredLogger {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }

    /// Log monitor startup
    pub fn log_startup(&self, pipeline: &str, version: &str) {
        info!(
            event = "monitor_started",
            container = %self.container,
            pipeline = %pipeline,
            version = %version,
            "Monitor started"
        );
    }

    pub fn log_shutdown(&self, pipeline: &str, reason: &str) {
        info!(
            event = "monitor_stopped",
            container = %self.container,
            pipeline = %pipeline,
            reason = %reason,
            "Monitor stopped"
        );
    }

    pub fn log_snapshot(&self, snapshot: &Snapshot, elapsed_ms: u128) {
        debug!(
            event = "snapshot_collected",
            container = %self.container,
            connections = snapshot.network.active_connections,
            suspicious = snapshot.network.suspicious_count,
            processes = snapshot.processes.total_count,
            threats = snapshot.threats.len(),
            errors = snapshot.errors.len(),
            elapsed_ms = elapsed_ms as u64,
            "Snapshot collected"
        );
    }

    /// Log a threat once the responder has decided its action
    pub fn log_threat(&self, threat: &ThreatEvent) {
        match threat.level {
            ThreatLevel::High | ThreatLevel::Critical => {
                warn!(
                    event = "threat_detected",
                    container = %self.container,
                    threat_id = %threat.id,
                    level = %threat.level,
                    category = %threat.category,
                    title = %threat.title,
                    action = %threat.action,
                    "{}",
                    threat.description
                );
            }
            _ => {
                info!(
                    event = "threat_detected",
                    container = %self.container,
                    threat_id = %threat.id,
                    level = %threat.level,
                    category = %threat.category,
                    title = %threat.title,
                    action = %threat.action,
                    "{}",
                    threat.description
                );
            }
        }
    }

    pub fn log_action(&self, action: ThreatAction, message: &str) {
        warn!(
            event = "container_action",
            container = %self.container,
            action = %action,
            "{}",
            message
        );
    }

    /// A non-fatal failure in one step of a response
    pub fn log_step_failure(&self, step: &str, error: &dyn std::fmt::Display) {
        warn!(
            event = "container_action",
            container = %self.container,
            step = %step,
            error = %error,
            "Response step failed, continuing"
        );
    }
}
