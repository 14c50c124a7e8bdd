//! Parsing of tagged packet-filter kernel log lines
//!
//! Example line:
//! `NFT_COI[10.47.62.50]: IN=incusbr0 OUT=eth0 SRC=10.47.62.50 DST=8.8.8.8 PROTO=TCP SPT=54321 DPT=53 SYN`

use super::rules::{TAG_DNS, TAG_GENERAL, TAG_SUSPICIOUS};
use crate::models::NetworkEvent;
use crate::observability::MonitorMetrics;
use chrono::Utc;
use std::net::IpAddr;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};

const TCP_FLAGS: [&str; 5] = ["SYN", "ACK", "FIN", "RST", "PSH"];

/// Container address carried in the first recognised tag, e.g. `NFT_DNS[10.0.0.5]`
fn tagged_ip(line: &str) -> Option<IpAddr> {
    [TAG_GENERAL, TAG_DNS, TAG_SUSPICIOUS]
        .iter()
        .find_map(|tag| {
            let start = line.find(&format!("{tag}["))? + tag.len() + 1;
            let end = line[start..].find(']')?;
            Some(line[start..start + end].parse::<IpAddr>())
        })?
        .ok()
}

/// Turn one kernel log line into an event; `None` for untagged or malformed lines
pub fn parse_log_line(line: &str) -> Option<NetworkEvent> {
    let container_ip = tagged_ip(line)?;

    let mut src_ip = None;
    let mut dst_ip = None;
    let mut src_port = 0u16;
    let mut dst_port = 0u16;
    let mut protocol = String::new();
    let mut in_interface = String::new();
    let mut out_interface = String::new();
    let mut seen_flags = [false; TCP_FLAGS.len()];

    for token in line.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            if let Some(i) = TCP_FLAGS.iter().position(|f| *f == token) {
                seen_flags[i] = true;
            }
            continue;
        };
        match key {
            "SRC" => src_ip = value.parse().ok(),
            "DST" => dst_ip = value.parse().ok(),
            "SPT" => src_port = value.parse().unwrap_or(0),
            "DPT" => dst_port = value.parse().unwrap_or(0),
            "PROTO" => protocol = value.to_string(),
            "IN" => in_interface = value.to_string(),
            "OUT" => out_interface = value.to_string(),
            _ => {}
        }
    }

    let flags = TCP_FLAGS
        .iter()
        .zip(seen_flags)
        .filter(|(_, seen)| *seen)
        .map(|(flag, _)| flag.to_string())
        .collect();

    Some(NetworkEvent {
        timestamp: Utc::now(),
        container_ip,
        src_ip: src_ip?,
        dst_ip: dst_ip?,
        src_port,
        dst_port,
        protocol,
        flags,
        in_interface,
        out_interface,
    })
}

/// Filters the kernel log down to one container's traffic
pub struct LogReader {
    container_ip: IpAddr,
    metrics: MonitorMetrics,
}

impl LogReader {
    pub fn new(container_ip: IpAddr) -> Self {
        Self {
            container_ip,
            metrics: MonitorMetrics::new(),
        }
    }

    /// Parse and keep an event only when both the tag and `SRC` are this container
    pub fn accept(&self, line: &str) -> Option<NetworkEvent> {
        let event = parse_log_line(line)?;
        if event.container_ip == self.container_ip && event.src_ip == self.container_ip {
            self.metrics.inc_network_events_parsed();
            Some(event)
        } else {
            trace!(
                tag_ip = %event.container_ip,
                src = %event.src_ip,
                "Ignoring event for another address"
            );
            None
        }
    }

    /// Forward matching events until shutdown or the line stream ends.
    ///
    /// Events are dropped, not queued, when `events` is full. Returns true
    /// when the line stream ended on its own.
    pub async fn run(
        &self,
        mut lines: mpsc::Receiver<String>,
        events: mpsc::Sender<NetworkEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> bool {
        info!(container_ip = %self.container_ip, "Log reader started");
        loop {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else {
                        info!("Kernel log stream ended");
                        return true;
                    };
                    let Some(event) = self.accept(&line) else { continue };
                    match events.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.metrics.inc_network_events_dropped();
                            debug!("Event channel full, dropping event");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return false,
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Log reader shutting down");
                    return false;
                }
            }
        }
    }
}
