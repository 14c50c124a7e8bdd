//! TCP connection collection from the kernel connection tables

use crate::models::{Connection, NetworkStats};
use crate::tables::{in_allowlist, ThreatTables};
use anyhow::Result;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

const TCP_STATES: &[&str] = &[
    "",
    "ESTABLISHED",
    "SYN_SENT",
    "SYN_RECV",
    "FIN_WAIT1",
    "FIN_WAIT2",
    "TIME_WAIT",
    "CLOSE",
    "CLOSE_WAIT",
    "LAST_ACK",
    "LISTEN",
    "CLOSING",
];

/// Map a hex state code from the connection table to its name
pub fn tcp_state_name(hex: &str) -> &'static str {
    match usize::from_str_radix(hex, 16) {
        Ok(code) if code > 0 && code < TCP_STATES.len() => TCP_STATES[code],
        _ => "UNKNOWN",
    }
}

/// Decode a hex IP address as printed in the connection tables
///
/// IPv4 is one little-endian u32; IPv6 is four 32-bit groups, each little-endian.
pub fn parse_hex_ip(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let raw = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(raw.to_le_bytes())))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (group, chunk) in octets.chunks_mut(4).enumerate() {
                let start = group * 8;
                let raw = u32::from_str_radix(&hex[start..start + 8], 16).ok()?;
                chunk.copy_from_slice(&raw.to_le_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Decode an `ADDR:PORT` hex pair
pub fn parse_hex_addr(hex: &str) -> Option<SocketAddr> {
    let (ip, port) = hex.split_once(':')?;
    let ip = parse_hex_ip(ip)?;
    let port = u16::from_str_radix(port, 16).ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Parse the contents of a `net/tcp` or `net/tcp6` table
pub fn parse_proc_net_tcp(content: &str, protocol: &str) -> Vec<Connection> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            Some(Connection {
                protocol: protocol.to_string(),
                local_addr: parse_hex_addr(fields[1])?,
                remote_addr: parse_hex_addr(fields[2])?,
                state: tcp_state_name(fields[3]).to_string(),
                uid: fields[7].parse().unwrap_or(0),
                suspicious: false,
                suspect_reason: None,
            })
        })
        .collect()
}

/// First matching reason a connection is suspicious, if any
pub fn check_suspicious(
    conn: &Connection,
    tables: &ThreatTables,
    allowlist: &[IpNetwork],
) -> Option<String> {
    if conn.state == "LISTEN" {
        return None;
    }

    let remote = conn.remote_addr.ip();
    if remote.is_loopback() || remote.is_unspecified() {
        return None;
    }

    if tables.is_private(&remote) {
        return Some("RFC1918 private address (should be blocked by firewall)".to_string());
    }
    if tables.is_metadata(&remote) {
        return Some("Cloud metadata endpoint access".to_string());
    }
    if !allowlist.is_empty() && !in_allowlist(&remote, allowlist) {
        return Some("IP not in network allowlist".to_string());
    }
    let port = conn.remote_addr.port();
    if tables.is_suspicious_port(port) {
        return Some(format!("Suspicious port: {} (common C2/backdoor port)", port));
    }

    None
}

pub struct NetworkCollector {
    proc_path: PathBuf,
    allowlist: Vec<IpNetwork>,
    tables: Arc<ThreatTables>,
}

impl NetworkCollector {
    pub fn new(
        proc_path: impl Into<PathBuf>,
        allowlist: Vec<IpNetwork>,
        tables: Arc<ThreatTables>,
    ) -> Self {
        Self {
            proc_path: proc_path.into(),
            allowlist,
            tables,
        }
    }

    /// Read both tables, keep the container's connections and flag suspicious ones
    ///
    /// Without a container IP no filtering is applied.
    pub async fn collect(&self, container_ip: Option<IpAddr>) -> Result<NetworkStats> {
        let tcp4 = fs::read_to_string(self.proc_path.join("net/tcp")).await;
        let tcp6 = fs::read_to_string(self.proc_path.join("net/tcp6")).await;

        let mut connections = Vec::new();
        match (tcp4, tcp6) {
            (Err(e), Err(_)) => {
                return Err(anyhow::Error::new(e).context("Failed to read TCP connection tables"))
            }
            (v4, v6) => {
                if let Ok(content) = v4 {
                    connections.extend(parse_proc_net_tcp(&content, "tcp"));
                }
                if let Ok(content) = v6 {
                    connections.extend(parse_proc_net_tcp(&content, "tcp6"));
                }
            }
        }

        if let Some(ip) = container_ip {
            connections.retain(|conn| conn.local_addr.ip() == ip);
        }

        let mut suspicious_count = 0;
        for conn in &mut connections {
            if let Some(reason) = check_suspicious(conn, &self.tables, &self.allowlist) {
                conn.suspicious = true;
                conn.suspect_reason = Some(reason);
                suspicious_count += 1;
            }
        }

        Ok(NetworkStats {
            available: true,
            active_connections: connections.len(),
            connections,
            suspicious_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(remote: &str, state: &str) -> Connection {
        Connection {
            protocol: "tcp".to_string(),
            local_addr: "10.47.62.50:40000".parse().unwrap(),
            remote_addr: remote.parse().unwrap(),
            state: state.to_string(),
            uid: 0,
            suspicious: false,
            suspect_reason: None,
        }
    }

    #[test]
    fn test_parse_hex_ipv4() {
        // 0100007F:0050 is 127.0.0.1:80
        assert_eq!(
            parse_hex_addr("0100007F:0050"),
            Some("127.0.0.1:80".parse().unwrap())
        );
        // 323E2F0A is 10.47.62.50
        assert_eq!(
            parse_hex_ip("323E2F0A"),
            Some("10.47.62.50".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_hex_ipv6() {
        assert_eq!(
            parse_hex_ip("00000000000000000000000001000000"),
            Some("::1".parse().unwrap())
        );
        assert_eq!(parse_hex_ip("zz"), None);
    }

    #[test]
    fn test_tcp_state_name() {
        assert_eq!(tcp_state_name("01"), "ESTABLISHED");
        assert_eq!(tcp_state_name("0A"), "LISTEN");
        assert_eq!(tcp_state_name("FF"), "UNKNOWN");
        assert_eq!(tcp_state_name("00"), "UNKNOWN");
    }

    #[test]
    fn test_parse_proc_net_tcp() {
        let content = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 323E2F0A:9C40 0900710B:115C 01 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 20 4 30 10 -1\n\
   1: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 2345 1 0000000000000000 100 0 0 10 0\n";
        let conns = parse_proc_net_tcp(content, "tcp");
        assert_eq!(conns.len(), 2);
        assert_eq!(conns[0].local_addr, "10.47.62.50:40000".parse().unwrap());
        assert_eq!(conns[0].remote_addr, "11.113.0.9:4444".parse().unwrap());
        assert_eq!(conns[0].state, "ESTABLISHED");
        assert_eq!(conns[0].uid, 1000);
        assert_eq!(conns[1].state, "LISTEN");
    }

    #[test]
    fn test_check_suspicious_reason_order() {
        let tables = ThreatTables::default();

        // private beats suspicious port
        let reason = check_suspicious(&conn("10.1.2.3:4444", "ESTABLISHED"), &tables, &[]);
        assert!(reason.unwrap().starts_with("RFC1918"));

        let reason = check_suspicious(&conn("169.254.169.254:80", "ESTABLISHED"), &tables, &[]);
        assert_eq!(reason.as_deref(), Some("Cloud metadata endpoint access"));

        let allow = vec!["1.1.1.0/24".parse().unwrap()];
        let reason = check_suspicious(&conn("8.8.8.8:443", "ESTABLISHED"), &tables, &allow);
        assert_eq!(reason.as_deref(), Some("IP not in network allowlist"));

        let reason = check_suspicious(&conn("8.8.8.8:31337", "ESTABLISHED"), &tables, &[]);
        assert!(reason.unwrap().contains("31337"));

        assert!(check_suspicious(&conn("8.8.8.8:443", "ESTABLISHED"), &tables, &[]).is_none());
    }

    #[test]
    fn test_listen_and_loopback_never_suspicious() {
        let tables = ThreatTables::default();
        assert!(check_suspicious(&conn("10.1.2.3:4444", "LISTEN"), &tables, &[]).is_none());
        assert!(check_suspicious(&conn("127.0.0.1:4444", "ESTABLISHED"), &tables, &[]).is_none());
        assert!(check_suspicious(&conn("0.0.0.0:0", "CLOSE"), &tables, &[]).is_none());
    }
}
