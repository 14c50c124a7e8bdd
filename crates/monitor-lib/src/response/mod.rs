//! Automated response to detected threats
//!
//! Both pipelines feed one shared [`Responder`]. It deduplicates repeated
//! threats, persists every threat to the audit log, notifies the embedding
//! application and pauses or kills the container depending on severity.

mod dedup;
mod responder;

pub use dedup::DedupCache;
pub use responder::{Responder, ResponderConfig};

use crate::error::MonitorError;
use crate::models::{ThreatAction, ThreatEvent, ThreatLevel};
use std::sync::Arc;

pub type ThreatCallback = Arc<dyn Fn(&ThreatEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&MonitorError) + Send + Sync>;
/// Receives the action taken and a human-readable message
pub type ActionCallback = Arc<dyn Fn(ThreatAction, &str) + Send + Sync>;

/// Hooks into the embedding application
///
/// Informational threats are persisted but never reach `on_threat`.
#[derive(Clone, Default)]
pub struct MonitorCallbacks {
    pub on_threat: Option<ThreatCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_action: Option<ActionCallback>,
}

impl MonitorCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_threat<F>(mut self, f: F) -> Self
    where
        F: Fn(&ThreatEvent) + Send + Sync + 'static,
    {
        self.on_threat = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&MonitorError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_action<F>(mut self, f: F) -> Self
    where
        F: Fn(ThreatAction, &str) + Send + Sync + 'static,
    {
        self.on_action = Some(Arc::new(f));
        self
    }

    pub(crate) fn threat(&self, threat: &ThreatEvent) {
        if threat.level == ThreatLevel::Info {
            return;
        }
        if let Some(cb) = &self.on_threat {
            cb(threat);
        }
    }

    pub(crate) fn error(&self, error: &MonitorError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn action(&self, action: ThreatAction, message: &str) {
        if let Some(cb) = &self.on_action {
            cb(action, message);
        }
    }
}

impl std::fmt::Debug for MonitorCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorCallbacks")
            .field("on_threat", &self.on_threat.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_action", &self.on_action.is_some())
            .finish()
    }
}
