//! Real-time classification of packet-filter log events

use crate::models::{Evidence, NetworkEvent, ThreatCategory, ThreatEvent, ThreatLevel};
use crate::tables::{in_allowlist, ThreatTables};
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DNS_PORT: u16 = 53;

#[derive(Debug, Clone)]
pub struct NetworkDetectorConfig {
    pub allowlist: Vec<IpNetwork>,
    /// Expected DNS resolver for the container
    pub gateway_ip: Option<IpAddr>,
    /// Queries per window above which volume is flagged; zero disables
    pub dns_query_threshold: u32,
    pub dns_window: Duration,
}

impl Default for NetworkDetectorConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            gateway_ip: None,
            dns_query_threshold: 100,
            dns_window: Duration::from_secs(60),
        }
    }
}

pub struct NetworkDetector {
    config: NetworkDetectorConfig,
    tables: Arc<ThreatTables>,
    dns_counts: DashMap<IpAddr, u32>,
    window_start: Mutex<Instant>,
}

impl NetworkDetector {
    pub fn new(config: NetworkDetectorConfig, tables: Arc<ThreatTables>) -> Self {
        Self {
            config,
            tables,
            dns_counts: DashMap::new(),
            window_start: Mutex::new(Instant::now()),
        }
    }

    pub fn analyze(&self, event: &NetworkEvent) -> Option<ThreatEvent> {
        self.analyze_at(event, Instant::now())
    }

    /// Classify `event` as observed at `now`; the first matching rule wins
    pub fn analyze_at(&self, event: &NetworkEvent, now: Instant) -> Option<ThreatEvent> {
        self.roll_window(now);

        let dst = event.dst_ip;
        let threat = |level, title: &str, description: String| {
            Some(ThreatEvent::new(
                event.timestamp,
                level,
                ThreatCategory::Network,
                title,
                description,
                Evidence::Packet(event.clone()),
            ))
        };

        // queries to the container's own resolver are expected
        let gateway_dns = event.dst_port == DNS_PORT && self.config.gateway_ip == Some(dst);

        if !gateway_dns && self.tables.is_private(&dst) {
            return threat(
                ThreatLevel::High,
                "Connection to private network",
                format!(
                    "RFC1918 address: {}:{} (should be blocked by firewall)",
                    dst, event.dst_port
                ),
            );
        }

        if self.tables.is_metadata(&dst) {
            return threat(
                ThreatLevel::Critical,
                "Cloud metadata endpoint access",
                "Attempted connection to cloud metadata endpoint".to_string(),
            );
        }

        if self.tables.is_suspicious_port(event.dst_port) {
            return threat(
                ThreatLevel::Critical,
                "Connection to suspicious port",
                format!("C2/backdoor port {} to {}", event.dst_port, dst),
            );
        }

        if !gateway_dns
            && !self.config.allowlist.is_empty()
            && !in_allowlist(&dst, &self.config.allowlist)
        {
            return threat(
                ThreatLevel::High,
                "Unauthorized connection attempt",
                format!("IP not in allowlist: {}:{}", dst, event.dst_port),
            );
        }

        if event.dst_port == DNS_PORT {
            return self.analyze_dns(event);
        }

        None
    }

    fn roll_window(&self, now: Instant) {
        let mut start = match self.window_start.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if now.saturating_duration_since(*start) > self.config.dns_window {
            self.dns_counts.clear();
            *start = now;
        }
    }

    fn analyze_dns(&self, event: &NetworkEvent) -> Option<ThreatEvent> {
        let count = {
            let mut entry = self.dns_counts.entry(event.container_ip).or_insert(0);
            *entry += 1;
            *entry
        };

        let threshold = self.config.dns_query_threshold;
        if threshold > 0 && count > threshold {
            return Some(ThreatEvent::new(
                event.timestamp,
                ThreatLevel::Warning,
                ThreatCategory::Network,
                "High DNS query volume",
                format!(
                    "{} queries in last minute (threshold: {}) - potential DNS tunneling",
                    count, threshold
                ),
                Evidence::Packet(event.clone()),
            ));
        }

        if let Some(gateway) = self.config.gateway_ip {
            if event.dst_ip != gateway && !in_allowlist(&event.dst_ip, &self.config.allowlist) {
                return Some(ThreatEvent::new(
                    event.timestamp,
                    ThreatLevel::Warning,
                    ThreatCategory::Network,
                    "DNS query to non-standard server",
                    format!(
                        "Query to {} (expected: {} or allowlist)",
                        event.dst_ip, gateway
                    ),
                    Evidence::Packet(event.clone()),
                ));
            }
        }

        None
    }
}
