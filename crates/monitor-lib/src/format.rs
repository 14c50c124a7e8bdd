//! Human-readable rendering of snapshots and alerts

use crate::models::{Snapshot, ThreatAction, ThreatEvent, ThreatLevel};
use colored::Colorize;
use std::fmt::Write;
use tabled::{settings::Style, Table, Tabled};

const RULE_WIDTH: usize = 70;
const COMMAND_WIDTH: usize = 40;

#[derive(Tabled)]
struct ConnectionRow {
    #[tabled(rename = "Protocol")]
    protocol: String,
    #[tabled(rename = "Local Address")]
    local: String,
    #[tabled(rename = "Remote Address")]
    remote: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled)]
struct ProcessRow {
    #[tabled(rename = "PID")]
    pid: u32,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Command")]
    command: String,
    #[tabled(rename = "Flags")]
    flags: String,
}

fn level_label(level: ThreatLevel) -> String {
    let label = format!("{:<8}", level.as_str().to_uppercase());
    match level {
        ThreatLevel::Critical | ThreatLevel::High => label.red().bold().to_string(),
        ThreatLevel::Warning => label.yellow().to_string(),
        ThreatLevel::Info => label,
    }
}

fn truncate(command: &str) -> String {
    if command.chars().count() > COMMAND_WIDTH {
        let head: String = command.chars().take(COMMAND_WIDTH - 3).collect();
        format!("{head}...")
    } else {
        command.to_string()
    }
}

/// Multi-section report of one snapshot
pub fn format_snapshot(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    let _ = write!(out, "Container: {}", snapshot.container_name);
    if let Some(ip) = snapshot.container_ip {
        let _ = write!(out, " ({ip})");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Timestamp: {}", snapshot.timestamp.to_rfc3339());
    let _ = writeln!(out, "{}\n", "━".repeat(RULE_WIDTH));

    if !snapshot.threats.is_empty() {
        let counts: Vec<String> = [
            ThreatLevel::Critical,
            ThreatLevel::High,
            ThreatLevel::Warning,
            ThreatLevel::Info,
        ]
        .into_iter()
        .filter_map(|level| {
            let n = snapshot.threats.iter().filter(|t| t.level == level).count();
            (n > 0).then(|| format!("{n} {level}"))
        })
        .collect();
        let _ = writeln!(out, "⚠ THREATS DETECTED: {}\n", counts.join(", "));

        let _ = writeln!(out, "RECENT THREATS");
        for threat in &snapshot.threats {
            let _ = writeln!(
                out,
                "  [{}] {}  {}",
                threat.timestamp.format("%H:%M:%S"),
                level_label(threat.level),
                threat.title
            );
            let _ = writeln!(out, "{:22}{}", "", threat.description);
            if !matches!(threat.action, ThreatAction::Pending | ThreatAction::Logged) {
                let _ = writeln!(out, "{:22}→ Action: {}", "", threat.action);
            }
            let _ = writeln!(out);
        }
    }

    let network = &snapshot.network;
    let _ = write!(out, "NETWORK ({} active connections", network.active_connections);
    if network.suspicious_count > 0 {
        let _ = write!(out, ", {} suspicious", network.suspicious_count);
    }
    let _ = writeln!(out, ")");
    if !network.available {
        let _ = writeln!(out, "  Not available");
    } else if network.connections.is_empty() {
        let _ = writeln!(out, "  No active connections");
    } else {
        let rows = network.connections.iter().map(|c| ConnectionRow {
            protocol: c.protocol.clone(),
            local: c.local_addr.to_string(),
            remote: c.remote_addr.to_string(),
            state: c.state.clone(),
            status: if c.suspicious {
                "⚠ SUSPICIOUS".red().to_string()
            } else {
                "✓ Normal".green().to_string()
            },
        });
        let _ = writeln!(out, "{}", Table::new(rows).with(Style::psql()));
    }
    let _ = writeln!(out);

    let processes = &snapshot.processes;
    if processes.available {
        let _ = writeln!(out, "PROCESSES ({} running)", processes.total_count);
        if !processes.processes.is_empty() {
            let rows = processes.processes.iter().map(|p| ProcessRow {
                pid: p.pid,
                user: p.user.clone(),
                command: truncate(&p.command),
                flags: if p.env_access {
                    "⚠ ENV SCAN".yellow().to_string()
                } else {
                    String::new()
                },
            });
            let _ = writeln!(out, "{}", Table::new(rows).with(Style::psql()));
        }
    } else {
        let _ = writeln!(out, "PROCESSES\n  Not available");
    }
    let _ = writeln!(out);

    let fs = &snapshot.filesystem;
    let _ = writeln!(out, "FILESYSTEM");
    if fs.available {
        if let Some(path) = &fs.workspace_path {
            let _ = writeln!(out, "  Workspace:        {path}");
        }
        let _ = writeln!(
            out,
            "  Workspace Reads:  {:.2} MB ({:.2} MB/sec)",
            fs.total_read_mb, fs.read_rate_mb_per_sec
        );
        let _ = writeln!(
            out,
            "  Workspace Writes: {:.2} MB ({:.2} MB/sec)",
            fs.total_write_mb, fs.write_rate_mb_per_sec
        );
        if fs.tmp_total_mb > 0.0 {
            let _ = writeln!(
                out,
                "  /tmp:             {:.0} MB / {:.0} MB ({:.1}%)",
                fs.tmp_used_mb, fs.tmp_total_mb, fs.tmp_used_percent
            );
        }
    } else {
        let _ = writeln!(out, "  Not available");
    }
    let _ = writeln!(out);

    let res = &snapshot.resources;
    let _ = writeln!(out, "RESOURCES");
    if res.available {
        let _ = writeln!(
            out,
            "  CPU:     {:.1}s total ({:.1}s user, {:.1}s system)",
            res.cpu_time_seconds, res.user_cpu_seconds, res.sys_cpu_seconds
        );
        match res.memory_limit_mb.filter(|limit| *limit > 0.0) {
            Some(limit) => {
                let _ = writeln!(
                    out,
                    "  Memory:  {:.0} MB / {:.0} MB ({:.1}%)",
                    res.memory_mb,
                    limit,
                    res.memory_mb / limit * 100.0
                );
            }
            None => {
                let _ = writeln!(out, "  Memory:  {:.0} MB", res.memory_mb);
            }
        }
        let _ = writeln!(
            out,
            "  I/O:     {:.0} MB read, {:.0} MB write",
            res.io_read_mb, res.io_write_mb
        );
    } else {
        let _ = writeln!(out, "  Not available");
    }

    if !snapshot.errors.is_empty() {
        let _ = writeln!(out, "\nERRORS");
        for err in &snapshot.errors {
            let _ = writeln!(out, "  - {err}");
        }
    }

    out
}

/// Banner printed when a threat reaches the operator
pub fn format_threat_alert(threat: &ThreatEvent) -> String {
    let paint = |s: &str| match threat.level {
        ThreatLevel::Critical | ThreatLevel::High => s.red().bold().to_string(),
        _ => s.yellow().to_string(),
    };

    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n{}",
        paint(&format!(
            "⚠ SECURITY ALERT [{}]",
            threat.level.as_str().to_uppercase()
        ))
    );
    let _ = writeln!(out, "{}", paint(&threat.title));
    let _ = writeln!(out, "{}", threat.description);
    if !matches!(threat.action, ThreatAction::Pending | ThreatAction::Logged) {
        let _ = writeln!(out, "\n→ Action taken: {}", threat.action);
    }
    out
}
