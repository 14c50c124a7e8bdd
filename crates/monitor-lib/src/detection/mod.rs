//! Threat detection for both data sources
//!
//! - `Detector` turns a poll snapshot into threats
//! - `NetworkDetector` classifies individual packet-log events

mod detector;
mod network_detector;

pub use detector::{Detector, DetectorConfig};
pub use network_detector::{NetworkDetector, NetworkDetectorConfig};
