//! Severity-driven response: log, alert, pause or kill

use super::{DedupCache, MonitorCallbacks};
use crate::audit::AuditLog;
use crate::control::{ContainerControl, FirewallControl};
use crate::error::{MonitorError, Result};
use crate::models::{ThreatAction, ThreatEvent, ThreatLevel};
use crate::netmon::RuleCleaner;
use crate::observability::{MonitorMetrics, StructuredLogger};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub container_name: String,
    /// Pause the container on high-severity threats
    pub auto_pause_on_high: bool,
    /// Stop and delete the container on critical threats
    pub auto_kill_on_critical: bool,
    pub dedupe_window: Duration,
}

impl ResponderConfig {
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            auto_pause_on_high: true,
            auto_kill_on_critical: true,
            dedupe_window: Duration::from_secs(30),
        }
    }
}

struct ResponderState {
    paused: bool,
    killed: bool,
    dedup: DedupCache,
}

/// Shared sink for threats from both pipelines
pub struct Responder {
    config: ResponderConfig,
    control: Arc<dyn ContainerControl>,
    firewall: Option<Arc<dyn FirewallControl>>,
    rule_cleaner: Option<Arc<RuleCleaner>>,
    audit_log: Option<Arc<AuditLog>>,
    callbacks: MonitorCallbacks,
    state: Mutex<ResponderState>,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
}

impl Responder {
    pub fn new(config: ResponderConfig, control: Arc<dyn ContainerControl>) -> Self {
        let state = ResponderState {
            paused: false,
            killed: false,
            dedup: DedupCache::new(config.dedupe_window),
        };
        let logger = StructuredLogger::new(config.container_name.clone());
        Self {
            config,
            control,
            firewall: None,
            rule_cleaner: None,
            audit_log: None,
            callbacks: MonitorCallbacks::default(),
            state: Mutex::new(state),
            metrics: MonitorMetrics::new(),
            logger,
        }
    }

    pub fn with_audit_log(mut self, audit_log: Arc<AuditLog>) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn FirewallControl>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    pub fn with_rule_cleaner(mut self, cleaner: Arc<RuleCleaner>) -> Self {
        self.rule_cleaner = Some(cleaner);
        self
    }

    pub fn with_callbacks(mut self, callbacks: MonitorCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn container_name(&self) -> &str {
        &self.config.container_name
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn is_killed(&self) -> bool {
        self.state().killed
    }

    /// Clear the paused flag after the operator resumed the container
    pub fn mark_resumed(&self) {
        let mut state = self.state();
        if state.paused {
            debug!(container = %self.config.container_name, "Container resumed");
        }
        state.paused = false;
    }

    /// Forward an error to the `on_error` hook
    pub fn report_error(&self, error: &MonitorError) {
        self.callbacks.error(error);
    }

    /// Decide and carry out the response to one threat
    ///
    /// Only a failed pause is returned as an error. Once the container has
    /// been killed every call is a no-op returning [`ThreatAction::Killed`].
    pub async fn handle(&self, mut threat: ThreatEvent) -> Result<ThreatAction> {
        let already_paused = {
            let mut state = self.state();
            if state.killed {
                return Ok(ThreatAction::Killed);
            }
            if state
                .dedup
                .check_and_record(&threat.dedup_key(), Instant::now())
            {
                drop(state);
                threat.action = ThreatAction::Deduplicated;
                self.metrics.inc_action(ThreatAction::Deduplicated);
                self.persist(&threat);
                return Ok(ThreatAction::Deduplicated);
            }
            state.paused
        };

        self.metrics.inc_threat(threat.level);

        let action = match threat.level {
            ThreatLevel::Info => {
                threat.action = ThreatAction::Logged;
                self.persist(&threat);
                ThreatAction::Logged
            }
            ThreatLevel::Warning => self.alert_and_persist(&mut threat, ThreatAction::Alerted),
            ThreatLevel::High if self.config.auto_pause_on_high => {
                if already_paused {
                    threat.action = ThreatAction::Logged;
                    self.persist(&threat);
                    ThreatAction::Logged
                } else if let Err(e) = self.pause().await {
                    // the container is still running, record what actually happened
                    self.alert_and_persist(&mut threat, ThreatAction::Alerted);
                    self.metrics.inc_action(ThreatAction::Alerted);
                    return Err(e);
                } else {
                    self.alert_and_persist(&mut threat, ThreatAction::Paused)
                }
            }
            ThreatLevel::Critical if self.config.auto_kill_on_critical => {
                if !self.claim_kill() {
                    return Ok(ThreatAction::Killed);
                }
                self.alert_and_persist(&mut threat, ThreatAction::Killed);
                self.kill().await;
                ThreatAction::Killed
            }
            ThreatLevel::High | ThreatLevel::Critical => {
                self.alert_and_persist(&mut threat, ThreatAction::Alerted)
            }
        };

        self.metrics.inc_action(action);
        Ok(action)
    }

    fn state(&self) -> MutexGuard<'_, ResponderState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn alert_and_persist(&self, threat: &mut ThreatEvent, action: ThreatAction) -> ThreatAction {
        threat.action = action;
        self.logger.log_threat(threat);
        self.callbacks.threat(threat);
        self.persist(threat);
        action
    }

    /// Audit failures never abort the response
    fn persist(&self, threat: &ThreatEvent) {
        let Some(audit) = &self.audit_log else { return };
        if let Err(e) = audit.write_threat(threat) {
            warn!(
                container = %self.config.container_name,
                threat_id = %threat.id,
                error = %e,
                "Failed to write threat to audit log"
            );
            self.callbacks.error(&e);
        }
    }

    async fn pause(&self) -> Result<()> {
        let name = &self.config.container_name;
        match self.control.pause(name).await {
            Ok(()) => {}
            Err(e) if e.is_already_in_state() => {
                debug!(container = %name, "Container already frozen");
            }
            Err(e) => {
                return Err(MonitorError::ActionFailed {
                    action: "pause".to_string(),
                    message: e.to_string(),
                })
            }
        }

        let newly_paused = {
            let mut state = self.state();
            let was_paused = state.paused;
            state.paused = true;
            !was_paused
        };

        if newly_paused {
            let message = format!(
                "Container {name} PAUSED due to security threat. Resume with: incus start {name}"
            );
            self.logger.log_action(ThreatAction::Paused, &message);
            self.callbacks.action(ThreatAction::Paused, &message);
        }
        Ok(())
    }

    /// Take the kill slot; false when another task already has it
    fn claim_kill(&self) -> bool {
        let mut state = self.state();
        if state.killed {
            false
        } else {
            state.killed = true;
            true
        }
    }

    /// Notify, stop, clean up host rules, delete. Every step is attempted.
    async fn kill(&self) {
        let name = &self.config.container_name;

        let message = format!("Container {name} KILLED due to critical security threat");
        self.logger.log_action(ThreatAction::Killed, &message);
        self.callbacks.action(ThreatAction::Killed, &message);

        // address and host interface are gone once the container is deleted
        let ip = match self.control.ip(name).await {
            Ok(ip) => ip,
            Err(e) => {
                self.logger.log_step_failure("resolve ip", &e);
                None
            }
        };
        let interface = match self.control.interface_name(name).await {
            Ok(iface) => iface,
            Err(e) => {
                self.logger.log_step_failure("resolve interface", &e);
                None
            }
        };

        if let Err(e) = self.control.stop(name, true).await {
            self.logger.log_step_failure("stop", &e);
        }

        if let Some(ip) = ip {
            if let Some(firewall) = &self.firewall {
                if let Err(e) = firewall.remove_rules(ip).await {
                    self.logger.log_step_failure("remove firewall rules", &e);
                }
            }
            if let Some(cleaner) = &self.rule_cleaner {
                if let Err(e) = cleaner.sweep(ip).await {
                    self.logger.log_step_failure("remove monitoring rules", &e);
                }
            }
        }

        if let Err(e) = self.control.delete(name).await {
            self.logger.log_step_failure("delete", &e);
        }

        if let (Some(iface), Some(firewall)) = (interface, &self.firewall) {
            if let Err(e) = firewall.remove_zone_binding(&iface).await {
                self.logger.log_step_failure("remove zone binding", &e);
            }
        }
    }
}
