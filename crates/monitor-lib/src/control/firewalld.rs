use super::FirewallControl;
use crate::error::Result;
use crate::exec::{CommandRunner, SystemRunner, DEFAULT_COMMAND_TIMEOUT};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Host firewall cleanup through `firewall-cmd`, run with `sudo -n`
pub struct FirewalldControl {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Default for FirewalldControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewalldControl {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    async fn firewall_cmd(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-n", "firewall-cmd"];
        full.extend_from_slice(args);
        self.runner.output("sudo", &full, self.timeout).await
    }
}

/// True when a direct rule names `ip` as a whole address or network
fn rule_references(rule: &str, ip: &IpAddr) -> bool {
    let ip = ip.to_string();
    rule.split_whitespace()
        .any(|token| token == ip || token.strip_prefix(ip.as_str()).is_some_and(|rest| rest.starts_with('/')))
}

#[async_trait]
impl FirewallControl for FirewalldControl {
    async fn remove_rules(&self, ip: IpAddr) -> Result<usize> {
        let listing = self.firewall_cmd(&["--direct", "--get-all-rules"]).await?;

        let mut removed = 0;
        for rule in listing.lines().map(str::trim) {
            if rule.is_empty() || !rule_references(rule, &ip) {
                continue;
            }
            let mut args = vec!["--direct", "--remove-rule"];
            args.extend(rule.split_whitespace());
            match self.firewall_cmd(&args).await {
                Ok(_) => removed += 1,
                Err(e) => warn!(rule = %rule, error = %e, "Failed to remove firewall rule"),
            }
        }

        debug!(ip = %ip, removed, "Removed firewall rules");
        Ok(removed)
    }

    async fn remove_zone_binding(&self, interface: &str) -> Result<()> {
        let query = format!("--get-zone-of-interface={}", interface);
        let zone = match self.firewall_cmd(&[&query]).await {
            Ok(zone) => zone.trim().to_string(),
            // not bound to any zone
            Err(_) => return Ok(()),
        };
        if zone.is_empty() {
            return Ok(());
        }

        let zone_arg = format!("--zone={}", zone);
        let remove_arg = format!("--remove-interface={}", interface);
        self.firewall_cmd(&[&zone_arg, &remove_arg]).await?;
        debug!(interface = %interface, zone = %zone, "Removed zone binding");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::ScriptedRunner;
    use crate::exec::CommandOutput;

    const RULES: &str = "ipv4 filter FORWARD 0 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT\n\
ipv4 filter FORWARD 1 -s 10.47.62.50 -d 8.8.8.8 -j ACCEPT\n\
ipv4 filter FORWARD 2 -s 10.47.62.5 -j REJECT\n\
ipv4 filter FORWARD 3 -s 10.47.62.50/32 -j REJECT\n";

    #[test]
    fn test_rule_references_whole_address() {
        let ip: IpAddr = "10.47.62.5".parse().unwrap();
        assert!(rule_references("ipv4 filter FORWARD 2 -s 10.47.62.5 -j REJECT", &ip));
        assert!(!rule_references("ipv4 filter FORWARD 1 -s 10.47.62.50 -j ACCEPT", &ip));
    }

    #[tokio::test]
    async fn test_remove_rules_only_touches_matching_ip() {
        let runner = Arc::new(ScriptedRunner::new(|_, args| {
            if args.contains(&"--get-all-rules") {
                Ok(CommandOutput::ok(RULES))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }));
        let firewall = FirewalldControl::with_runner(runner.clone());

        let removed = firewall
            .remove_rules("10.47.62.50".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].contains("--remove-rule ipv4 filter FORWARD 1 -s 10.47.62.50"));
        assert!(calls[2].contains("10.47.62.50/32"));
    }

    #[tokio::test]
    async fn test_remove_zone_binding_unbound_interface() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            Ok(CommandOutput::failed(2, "no zone"))
        }));
        let firewall = FirewalldControl::with_runner(runner.clone());
        firewall.remove_zone_binding("veth0").await.unwrap();
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_zone_binding() {
        let runner = Arc::new(ScriptedRunner::new(|_, args| {
            if args.iter().any(|a| a.starts_with("--get-zone-of-interface")) {
                Ok(CommandOutput::ok("trusted\n"))
            } else {
                Ok(CommandOutput::ok("success"))
            }
        }));
        let firewall = FirewalldControl::with_runner(runner.clone());
        firewall.remove_zone_binding("veth0").await.unwrap();
        assert_eq!(
            runner.calls()[1],
            "sudo -n firewall-cmd --zone=trusted --remove-interface=veth0"
        );
    }
}
