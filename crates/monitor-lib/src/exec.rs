//! External command execution with timeouts

use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default bound for container and packet-filter commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr joined, trimmed
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(err);
        }
        out
    }
}

/// Runs external programs; swapped for an in-memory fake in tests
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput>;

    /// Run and require a zero exit status, returning stdout
    async fn output(&self, program: &str, args: &[&str], timeout: Duration) -> Result<String> {
        let out = self.run(program, args, timeout).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(MonitorError::CommandFailed {
                command: render_command(program, args),
                message: match out.status {
                    Some(code) => format!("exit status {}: {}", code, out.combined()),
                    None => format!("terminated by signal: {}", out.combined()),
                },
            })
        }
    }
}

pub(crate) fn render_command(program: &str, args: &[&str]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

/// Spawns real processes via tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        debug!(command = %render_command(program, args), "Running command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MonitorError::CommandTimeout {
                    command: render_command(program, args),
                    timeout,
                })
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
