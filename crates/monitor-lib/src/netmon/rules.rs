//! Packet-filter LOG rules tagging one container's forwarded traffic
//!
//! Every rule carries a log prefix of the form `<TAG>[<ip>]: ` so the kernel
//! log lines can be traced back to a container and the rules can later be
//! found again by text.

use crate::error::{MonitorError, Result};
use crate::exec::{CommandRunner, DEFAULT_COMMAND_TIMEOUT};
use crate::tables::ThreatTables;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rate-limited catch-all
pub const TAG_GENERAL: &str = "NFT_COI";
pub const TAG_DNS: &str = "NFT_DNS";
/// Private ranges, metadata endpoint and C2 ports; never rate limited
pub const TAG_SUSPICIOUS: &str = "NFT_SUSPICIOUS";

const ALL_TAGS: [&str; 3] = [TAG_GENERAL, TAG_DNS, TAG_SUSPICIOUS];

const TABLE: [&str; 2] = ["ip", "filter"];
const CHAIN: &str = "FORWARD";

/// Log prefix for `tag` and `ip`, including the trailing `": "`
pub fn log_prefix(tag: &str, ip: IpAddr) -> String {
    format!("{tag}[{ip}]: ")
}

/// Extract the rule handle from a `nft -a` listing line (`... # handle 123`)
pub fn extract_handle(line: &str) -> Option<u64> {
    let (_, rest) = line.split_once("# handle ")?;
    rest.split_whitespace().next()?.parse().ok()
}

fn line_has_tag(line: &str, ip: IpAddr) -> bool {
    ALL_TAGS
        .iter()
        .any(|tag| line.contains(&format!("{tag}[{ip}]")))
}

/// How `nft` is invoked
#[derive(Debug, Clone)]
pub struct NftInvocation {
    /// Prefix with `sudo -n`
    pub use_sudo: bool,
    pub timeout: Duration,
}

impl Default for NftInvocation {
    fn default() -> Self {
        Self {
            use_sudo: true,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Thin wrapper running `nft` through a [`CommandRunner`]
#[derive(Clone)]
struct Nft {
    runner: Arc<dyn CommandRunner>,
    invocation: NftInvocation,
}

impl Nft {
    async fn run(&self, args: &[&str]) -> Result<String> {
        if self.invocation.use_sudo {
            let mut full = Vec::with_capacity(args.len() + 2);
            full.extend_from_slice(&["-n", "nft"]);
            full.extend_from_slice(args);
            self.runner
                .output("sudo", &full, self.invocation.timeout)
                .await
        } else {
            self.runner
                .output("nft", args, self.invocation.timeout)
                .await
        }
    }

    /// Delete every rule in the chain tagged for `ip`
    async fn remove_tagged(&self, ip: IpAddr) -> Result<usize> {
        let listing = self
            .run(&["-a", "list", "chain", TABLE[0], TABLE[1], CHAIN])
            .await?;

        let handles: Vec<u64> = listing
            .lines()
            .filter(|line| line_has_tag(line, ip))
            .filter_map(extract_handle)
            .collect();

        if handles.is_empty() {
            return Err(MonitorError::RuleNotFound { ip: ip.to_string() });
        }

        for handle in &handles {
            let handle = handle.to_string();
            self.run(&["delete", "rule", TABLE[0], TABLE[1], CHAIN, "handle", handle.as_str()])
                .await?;
        }
        debug!(ip = %ip, removed = handles.len(), "Removed tagged packet-filter rules");
        Ok(handles.len())
    }
}

#[derive(Debug, Clone)]
pub struct RuleManagerConfig {
    pub container_ip: IpAddr,
    /// Log DNS queries through a dedicated unlimited rule
    pub log_dns_queries: bool,
    /// Packets per second for the catch-all rule; zero falls back to 100
    pub rate_limit_per_sec: u32,
    pub invocation: NftInvocation,
}

impl RuleManagerConfig {
    pub fn new(container_ip: IpAddr) -> Self {
        Self {
            container_ip,
            log_dns_queries: true,
            rate_limit_per_sec: 100,
            invocation: NftInvocation::default(),
        }
    }
}

/// Installs and removes the LOG rules for one container
pub struct RuleManager {
    config: RuleManagerConfig,
    tables: Arc<ThreatTables>,
    nft: Nft,
}

impl RuleManager {
    pub fn new(
        config: RuleManagerConfig,
        runner: Arc<dyn CommandRunner>,
        tables: Arc<ThreatTables>,
    ) -> Self {
        let nft = Nft {
            runner,
            invocation: config.invocation.clone(),
        };
        Self {
            config,
            tables,
            nft,
        }
    }

    pub fn container_ip(&self) -> IpAddr {
        self.config.container_ip
    }

    /// Install the rules at the head of the FORWARD chain
    ///
    /// Rules are inserted catch-all first so that after the last insert the
    /// suspicious-traffic rules sit in front and match before anything else.
    pub async fn add_rules(&self) -> Result<()> {
        self.ensure_chain().await?;

        self.add_general_rule().await?;
        if self.config.log_dns_queries {
            self.add_dns_rule().await?;
        }
        self.add_suspicious_rules().await?;

        info!(
            container_ip = %self.config.container_ip,
            log_dns = self.config.log_dns_queries,
            rate_limit = self.rate_limit(),
            "Installed packet-filter LOG rules"
        );
        Ok(())
    }

    /// Delete every rule tagged for this container
    ///
    /// Returns [`MonitorError::RuleNotFound`] when none matched.
    pub async fn remove_rules(&self) -> Result<usize> {
        self.nft.remove_tagged(self.config.container_ip).await
    }

    fn rate_limit(&self) -> u32 {
        if self.config.rate_limit_per_sec == 0 {
            100
        } else {
            self.config.rate_limit_per_sec
        }
    }

    async fn ensure_chain(&self) -> Result<()> {
        if self
            .nft
            .run(&["list", "chain", TABLE[0], TABLE[1], CHAIN])
            .await
            .is_ok()
        {
            return Ok(());
        }

        // fails harmlessly when the table already exists
        if let Err(e) = self.nft.run(&["add", "table", TABLE[0], TABLE[1]]).await {
            debug!(error = %e, "add table failed");
        }

        self.nft
            .run(&[
                "add", "chain", TABLE[0], TABLE[1], CHAIN, "{", "type", "filter", "hook",
                "forward", "priority", "0", ";", "}",
            ])
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to create FORWARD chain");
                e
            })?;
        Ok(())
    }

    async fn insert_logged(&self, matcher: &[&str], tag: &str) -> Result<()> {
        let ip = self.config.container_ip.to_string();
        let prefix = format!("\"{}\"", log_prefix(tag, self.config.container_ip));

        let mut args: Vec<&str> = vec!["insert", "rule", TABLE[0], TABLE[1], CHAIN, "ip", "saddr", ip.as_str()];
        args.extend_from_slice(matcher);
        args.extend_from_slice(&["log", "prefix", prefix.as_str(), "level", "info", "counter"]);
        self.nft.run(&args).await.map(|_| ())
    }

    async fn add_general_rule(&self) -> Result<()> {
        let rate = format!("{}/second", self.rate_limit());
        self.insert_logged(&["limit", "rate", rate.as_str()], TAG_GENERAL).await
    }

    async fn add_dns_rule(&self) -> Result<()> {
        self.insert_logged(&["udp", "dport", "53"], TAG_DNS).await
    }

    async fn add_suspicious_rules(&self) -> Result<()> {
        let mut destinations: Vec<String> = Vec::new();
        if let IpAddr::V4(metadata) = self.tables.metadata_ip {
            destinations.push(metadata.to_string());
        }
        destinations.extend(
            self.tables
                .private_ranges
                .iter()
                .filter(|net| net.is_ipv4())
                .map(|net| net.to_string()),
        );
        let destinations = destinations.join(", ");
        self.insert_logged(&["ip", "daddr", "{", destinations.as_str(), "}"], TAG_SUSPICIOUS)
            .await?;

        let ports = self
            .tables
            .suspicious_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        self.insert_logged(&["tcp", "dport", "{", ports.as_str(), "}"], TAG_SUSPICIOUS)
            .await
    }
}

/// Best-effort removal of a container's LOG rules by IP alone
///
/// Used by the kill sequence, which only knows the container's address.
/// Finding nothing to remove is not an error here.
pub struct RuleCleaner {
    nft: Nft,
}

impl RuleCleaner {
    pub fn new(runner: Arc<dyn CommandRunner>, invocation: NftInvocation) -> Self {
        Self {
            nft: Nft { runner, invocation },
        }
    }

    pub async fn sweep(&self, ip: IpAddr) -> Result<usize> {
        match self.nft.remove_tagged(ip).await {
            Err(e) if e.is_rule_not_found() => {
                debug!(ip = %ip, "No packet-filter rules to sweep");
                Ok(0)
            }
            other => other,
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory `nft` keeping one FORWARD chain with numbered handles

    use crate::error::Result;
    use crate::exec::{CommandOutput, CommandRunner};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Chain {
        exists: bool,
        next_handle: u64,
        rules: Vec<(u64, String)>,
    }

    #[derive(Default)]
    pub struct FakeNft {
        chain: Mutex<Chain>,
        pub commands: Mutex<Vec<String>>,
    }

    impl FakeNft {
        pub fn with_chain() -> Self {
            let nft = Self::default();
            nft.chain.lock().unwrap().exists = true;
            nft
        }

        pub fn rules(&self) -> Vec<String> {
            self.chain
                .lock()
                .unwrap()
                .rules
                .iter()
                .map(|(_, r)| r.clone())
                .collect()
        }

        /// Add an unrelated rule, as another tool would
        pub fn push_foreign(&self, rule: &str) {
            let mut chain = self.chain.lock().unwrap();
            chain.next_handle += 1;
            let handle = chain.next_handle;
            chain.rules.push((handle, rule.to_string()));
        }

        fn listing(chain: &Chain, with_handles: bool) -> String {
            let mut out = String::from("table ip filter {\n\tchain FORWARD {\n");
            out.push_str("\t\ttype filter hook forward priority filter; policy accept;\n");
            for (handle, rule) in &chain.rules {
                if with_handles {
                    out.push_str(&format!("\t\t{rule} # handle {handle}\n"));
                } else {
                    out.push_str(&format!("\t\t{rule}\n"));
                }
            }
            out.push_str("\t}\n}\n");
            out
        }

        fn apply(&self, args: &[&str]) -> CommandOutput {
            let mut chain = self.chain.lock().unwrap();
            match args {
                ["-a", "list", "chain", "ip", "filter", "FORWARD"]
                | ["list", "chain", "ip", "filter", "FORWARD"] => {
                    if chain.exists {
                        CommandOutput::ok(Self::listing(&chain, args[0] == "-a"))
                    } else {
                        CommandOutput::failed(1, "Error: No such file or directory")
                    }
                }
                ["add", "table", "ip", "filter"] => CommandOutput::ok(""),
                ["add", "chain", "ip", "filter", "FORWARD", ..] => {
                    chain.exists = true;
                    CommandOutput::ok("")
                }
                ["insert", "rule", "ip", "filter", "FORWARD", rest @ ..] => {
                    if !chain.exists {
                        return CommandOutput::failed(1, "Error: No such file or directory");
                    }
                    chain.next_handle += 1;
                    let handle = chain.next_handle;
                    chain.rules.insert(0, (handle, rest.join(" ")));
                    CommandOutput::ok("")
                }
                ["delete", "rule", "ip", "filter", "FORWARD", "handle", h] => {
                    let handle: u64 = h.parse().unwrap_or_default();
                    let before = chain.rules.len();
                    chain.rules.retain(|(id, _)| *id != handle);
                    if chain.rules.len() == before {
                        CommandOutput::failed(1, "Error: Could not process rule")
                    } else {
                        CommandOutput::ok("")
                    }
                }
                _ => CommandOutput::failed(1, "Error: syntax error"),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for FakeNft {
        async fn run(
            &self,
            program: &str,
            args: &[&str],
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.commands
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            let args = match (program, args) {
                ("sudo", ["-n", "nft", rest @ ..]) => rest,
                ("nft", rest) => rest,
                _ => return Ok(CommandOutput::failed(127, "command not found")),
            };
            Ok(self.apply(args))
        }
    }
}
