//! Error taxonomy for the monitoring core

use std::time::Duration;
use thiserror::Error;

/// Metric domain a collection error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricDomain {
    Network,
    Process,
    Filesystem,
    Resources,
}

impl std::fmt::Display for MetricDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricDomain::Network => write!(f, "network"),
            MetricDomain::Process => write!(f, "process"),
            MetricDomain::Filesystem => write!(f, "filesystem"),
            MetricDomain::Resources => write!(f, "resources"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    /// One metric domain failed; the rest of the snapshot is still usable
    #[error("{domain}: {message}")]
    Collection { domain: MetricDomain, message: String },

    #[error("command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The underlying system reported the requested state was already reached
    #[error("container is already {state}")]
    AlreadyInState { state: String },

    /// Cleanup found no tagged rules; either never installed or already removed
    #[error("no monitoring rules found for {ip} (rules may not have been created or the IP changed)")]
    RuleNotFound { ip: String },

    #[error("daemon did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("{action} failed: {message}")]
    ActionFailed { action: String, message: String },

    #[error("kernel log source: {0}")]
    LogSource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MonitorError {
    /// True when the error means "the container is already paused/frozen/stopped"
    ///
    /// Container tooling reports this condition as plain text on stderr, so the
    /// message of a failed command is inspected as well.
    pub fn is_already_in_state(&self) -> bool {
        match self {
            MonitorError::AlreadyInState { .. } => true,
            MonitorError::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("already frozen") || lower.contains("already paused")
            }
            _ => false,
        }
    }

    pub fn is_rule_not_found(&self) -> bool {
        matches!(self, MonitorError::RuleNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
