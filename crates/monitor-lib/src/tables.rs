//! Constant lookup tables shared by the detectors and the rule installer

use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr};

/// A reverse-shell command fragment and what it indicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellPattern {
    pub pattern: String,
    pub indicators: Vec<String>,
    /// Counts even when the command shows no network indicator
    pub standalone: bool,
}

impl ShellPattern {
    fn new(pattern: &str, indicator: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            indicators: vec![indicator.to_string()],
            standalone: false,
        }
    }

    fn standalone(pattern: &str, indicator: &str) -> Self {
        Self {
            standalone: true,
            ..Self::new(pattern, indicator)
        }
    }
}

/// Address ranges, ports and command patterns the heuristics key on
#[derive(Debug, Clone)]
pub struct ThreatTables {
    pub private_ranges: Vec<IpNetwork>,
    pub metadata_ip: IpAddr,
    pub suspicious_ports: Vec<u16>,
    /// Subset of `suspicious_ports` escalated straight to critical
    pub critical_ports: Vec<u16>,
    pub reverse_shell_patterns: Vec<ShellPattern>,
    pub env_commands: Vec<String>,
    pub secret_keywords: Vec<String>,
}

impl Default for ThreatTables {
    fn default() -> Self {
        let private_ranges = [
            (Ipv4Addr::new(10, 0, 0, 0), 8),
            (Ipv4Addr::new(172, 16, 0, 0), 12),
            (Ipv4Addr::new(192, 168, 0, 0), 16),
        ]
        .into_iter()
        .filter_map(|(addr, prefix)| IpNetwork::new(IpAddr::V4(addr), prefix).ok())
        .collect();

        Self {
            private_ranges,
            metadata_ip: IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)),
            // metasploit, backdoors, netbus, irc, http-alt
            suspicious_ports: vec![4444, 5555, 1234, 31337, 12345, 6666, 6667, 6697, 8080],
            critical_ports: vec![4444, 5555],
            reverse_shell_patterns: vec![
                ShellPattern::new("nc -e", "netcat with exec"),
                ShellPattern::new("nc.traditional -e", "netcat with exec"),
                ShellPattern::new("ncat -e", "ncat with exec"),
                ShellPattern::new("nc.openbsd -e", "netcat with exec"),
                ShellPattern::standalone("bash -i", "interactive bash"),
                ShellPattern::standalone("sh -i", "interactive shell"),
                ShellPattern::new("/dev/tcp/", "bash tcp redirect"),
                ShellPattern::new("/dev/udp/", "bash udp redirect"),
                ShellPattern::new("python -c", "python one-liner"),
                ShellPattern::new("python3 -c", "python one-liner"),
                ShellPattern::new("socket.socket", "python socket"),
                ShellPattern::new("perl -e", "perl one-liner"),
                ShellPattern::new("perl -MIO", "perl IO module"),
                ShellPattern::new("php -r", "php one-liner"),
                ShellPattern::new("fsockopen", "php socket"),
                ShellPattern::new("ruby -rsocket", "ruby socket"),
                ShellPattern::new("ruby -e", "ruby one-liner"),
                ShellPattern::new("socat", "socat"),
                ShellPattern::new("EXEC:", "socat exec"),
                ShellPattern::new("powershell", "powershell"),
                ShellPattern::new("System.Net.Sockets", "dotnet sockets"),
            ],
            env_commands: ["env", "printenv", "set", "export"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            secret_keywords: ["api", "key", "password", "secret", "token"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ThreatTables {
    pub fn is_private(&self, ip: &IpAddr) -> bool {
        self.private_ranges.iter().any(|net| net.contains(*ip))
    }

    pub fn is_metadata(&self, ip: &IpAddr) -> bool {
        *ip == self.metadata_ip
    }

    pub fn is_suspicious_port(&self, port: u16) -> bool {
        self.suspicious_ports.contains(&port)
    }

    pub fn is_critical_port(&self, port: u16) -> bool {
        self.critical_ports.contains(&port)
    }
}

/// True when `ip` falls inside any of the allowlisted networks
pub fn in_allowlist(ip: &IpAddr, allowlist: &[IpNetwork]) -> bool {
    allowlist.iter().any(|net| net.contains(*ip))
}

/// Parse CIDR strings, skipping entries that do not parse
///
/// Bare addresses are accepted as single-host networks.
pub fn parse_allowlist<S: AsRef<str>>(entries: &[S]) -> Vec<IpNetwork> {
    entries
        .iter()
        .filter_map(|entry| {
            let entry = entry.as_ref().trim();
            match entry.parse::<IpNetwork>() {
                Ok(net) => Some(net),
                Err(_) => {
                    tracing::warn!(entry = %entry, "Ignoring invalid allowlist entry");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ranges() {
        let tables = ThreatTables::default();
        assert!(tables.is_private(&"10.1.2.3".parse().unwrap()));
        assert!(tables.is_private(&"172.31.255.1".parse().unwrap()));
        assert!(tables.is_private(&"192.168.1.1".parse().unwrap()));
        assert!(!tables.is_private(&"172.32.0.1".parse().unwrap()));
        assert!(!tables.is_private(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_ports() {
        let tables = ThreatTables::default();
        assert!(tables.is_suspicious_port(31337));
        assert!(tables.is_critical_port(4444));
        assert!(!tables.is_critical_port(8080));
        assert!(!tables.is_suspicious_port(443));
    }

    #[test]
    fn test_parse_allowlist_skips_invalid() {
        let nets = parse_allowlist(&["8.8.8.0/24", "not-a-cidr", "1.1.1.1"]);
        assert_eq!(nets.len(), 2);
        assert!(in_allowlist(&"8.8.8.8".parse().unwrap(), &nets));
        assert!(in_allowlist(&"1.1.1.1".parse().unwrap(), &nets));
        assert!(!in_allowlist(&"9.9.9.9".parse().unwrap(), &nets));
    }
}
