//! Security monitoring and automated response for a single container
//!
//! Two pipelines watch the container:
//! - the poll pipeline ([`Daemon`]) snapshots cgroup, network, process and
//!   filesystem state on an interval and runs the [`detection::Detector`]
//! - the event pipeline ([`NetMonitor`]) installs tagged packet-filter
//!   rules, follows the kernel log and classifies each logged packet
//!
//! Both feed one shared [`Responder`], which deduplicates threats, writes
//! them to the [`AuditLog`] and pauses or kills the container.

pub mod audit;
pub mod collector;
pub mod control;
pub mod daemon;
pub mod detection;
pub mod error;
pub mod exec;
pub mod format;
pub mod health;
pub mod models;
pub mod netmon;
pub mod observability;
pub mod response;
pub mod tables;

pub use audit::{read_audit_log, AuditEntry, AuditLog};
pub use daemon::{Daemon, DaemonBuilder, DaemonConfig, DaemonHandle, DaemonState};
pub use error::{MonitorError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use netmon::{NetMonitor, NetMonitorConfig, NetMonitorHandle};
pub use observability::{MonitorMetrics, StructuredLogger};
pub use response::{MonitorCallbacks, Responder, ResponderConfig};
