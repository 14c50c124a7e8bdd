//! Process listing inside the container and command-line classifiers

use crate::control::ContainerControl;
use crate::models::{Process, ProcessMatch, ProcessStats};
use crate::tables::ThreatTables;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

/// Parse `ps -eo user,pid,ppid,args` output
pub fn parse_ps_eo(output: &str) -> Vec<Process> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(Process {
                pid: fields[1].parse().ok()?,
                ppid: fields[2].parse().ok(),
                user: fields[0].to_string(),
                command: fields[3..].join(" "),
                env_access: false,
            })
        })
        .collect()
}

/// Parse `ps aux` output, which carries no parent pid
///
/// `USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND`
pub fn parse_ps_aux(output: &str) -> Vec<Process> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 11 {
                return None;
            }
            Some(Process {
                pid: fields[1].parse().ok()?,
                ppid: None,
                user: fields[0].to_string(),
                command: fields[10..].join(" "),
                env_access: false,
            })
        })
        .collect()
}

/// True when the command looks like it is reading environment secrets
pub fn check_env_access(command: &str, tables: &ThreatTables) -> bool {
    let cmd = command.to_lowercase();

    let dumps_env = tables.env_commands.iter().any(|env_cmd| {
        cmd == *env_cmd
            || cmd
                .strip_prefix(env_cmd.as_str())
                .is_some_and(|rest| rest.starts_with(' '))
    });
    if dumps_env {
        return true;
    }

    if cmd.contains("grep") && tables.secret_keywords.iter().any(|kw| cmd.contains(kw.as_str())) {
        return true;
    }

    cmd.contains("/proc/") && cmd.contains("environ")
}

/// True when some whitespace-separated token is a dotted quad
fn contains_ip_pattern(command: &str) -> bool {
    command.split_whitespace().any(|token| {
        let octets: Vec<&str> = token.split('.').collect();
        octets.len() == 4
            && octets
                .iter()
                .all(|o| !o.is_empty() && o.chars().all(|c| c.is_ascii_digit()))
    })
}

fn has_network_indicator(command: &str) -> bool {
    command.contains(':')
        || command.contains("sock")
        || command.contains("tcp")
        || command.contains("udp")
        || contains_ip_pattern(command)
}

/// Characters that may precede a pattern starting with a word character
fn is_command_boundary(c: char) -> bool {
    c.is_whitespace() || matches!(c, '/' | ';' | '|' | '&' | '(' | '\'' | '"' | '`' | '=' | ',')
}

/// `sh -i` must not match inside `ssh -i`, but `/bin/sh -i` still does
fn contains_pattern(cmd: &str, pattern: &str) -> bool {
    let needs_boundary = pattern.chars().next().is_some_and(|c| c.is_alphanumeric());
    cmd.match_indices(pattern).any(|(i, _)| {
        !needs_boundary || cmd[..i].chars().next_back().map_or(true, is_command_boundary)
    })
}

/// Match processes against the reverse-shell patterns
///
/// At most one match per process: the first pattern that counts.
pub fn detect_reverse_shells(processes: &[Process], tables: &ThreatTables) -> Vec<ProcessMatch> {
    let mut matches = Vec::new();

    for proc in processes {
        let cmd = proc.command.to_lowercase();
        let networked = has_network_indicator(&cmd);

        let hit = tables.reverse_shell_patterns.iter().find(|pattern| {
            contains_pattern(&cmd, &pattern.pattern.to_lowercase())
                && (networked || pattern.standalone)
        });

        if let Some(pattern) = hit {
            debug!(pid = proc.pid, pattern = %pattern.pattern, "Reverse shell pattern matched");
            matches.push(ProcessMatch {
                pid: proc.pid,
                command: proc.command.clone(),
                user: proc.user.clone(),
                pattern: pattern.pattern.clone(),
                indicators: pattern.indicators.clone(),
            });
        }
    }

    matches
}

pub fn detect_env_scanning(processes: &[Process]) -> Vec<ProcessMatch> {
    processes
        .iter()
        .filter(|proc| proc.env_access)
        .map(|proc| ProcessMatch {
            pid: proc.pid,
            command: proc.command.clone(),
            user: proc.user.clone(),
            pattern: "environment scanning".to_string(),
            indicators: vec!["accessing environment variables".to_string()],
        })
        .collect()
}

pub struct ProcessCollector {
    tables: Arc<ThreatTables>,
}

impl ProcessCollector {
    pub fn new(tables: Arc<ThreatTables>) -> Self {
        Self { tables }
    }

    async fn list(&self, name: &str, control: &dyn ContainerControl) -> Result<Vec<Process>> {
        match control
            .exec(name, &["ps", "-eo", "user,pid,ppid,args"])
            .await
        {
            Ok(output) => {
                let processes = parse_ps_eo(&output);
                if !processes.is_empty() {
                    return Ok(processes);
                }
            }
            Err(e) => debug!(container = %name, error = %e, "ps -eo unavailable, falling back to ps aux"),
        }

        let output = control
            .exec(name, &["ps", "aux"])
            .await
            .context("Failed to execute ps")?;
        Ok(parse_ps_aux(&output))
    }

    pub async fn collect(&self, name: &str, control: &dyn ContainerControl) -> Result<ProcessStats> {
        let mut processes = self.list(name, control).await?;
        for proc in &mut processes {
            proc.env_access = check_env_access(&proc.command, &self.tables);
        }

        Ok(ProcessStats {
            available: true,
            total_count: processes.len(),
            processes,
        })
    }
}
