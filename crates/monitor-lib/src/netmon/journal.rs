//! Kernel log streaming

use crate::error::{MonitorError, Result};
use crate::observability::MonitorMetrics;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

pub const JOURNAL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lines buffered between the source and the log reader
const LINE_BUFFER: usize = 100;

/// Hand a line to the reader without waiting. A slow consumer loses lines
/// rather than stalling the stream. False once the receiver is gone.
fn forward_line(tx: &mpsc::Sender<String>, line: String, metrics: &MonitorMetrics) -> bool {
    match tx.try_send(line) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("Kernel log line buffer full, dropping line");
            metrics.inc_kernel_log_lines_dropped();
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Lets exactly one of many concurrent callers perform a close
#[derive(Debug, Default)]
pub struct CloseGuard(AtomicBool);

impl CloseGuard {
    /// True for the first caller only
    pub fn close(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A stream of raw kernel log messages
#[async_trait]
pub trait KernelLogSource: Send + Sync {
    /// Start streaming new messages. The receiver ends when the source is
    /// closed or the underlying stream terminates.
    async fn open(&self) -> Result<mpsc::Receiver<String>>;

    /// Stop streaming; safe to call repeatedly and concurrently
    async fn close(&self);
}

/// Follows the kernel ring buffer through `journalctl -k -f`
pub struct JournalctlSource {
    program: String,
    args: Vec<String>,
    open_timeout: Duration,
    guard: CloseGuard,
    stop: Arc<Notify>,
}

impl Default for JournalctlSource {
    fn default() -> Self {
        Self::new()
    }
}

impl JournalctlSource {
    pub fn new() -> Self {
        Self::with_command(
            "journalctl",
            ["-k", "-f", "-n", "0", "-o", "cat"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    /// Stream the stdout of an arbitrary command instead
    pub fn with_command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            open_timeout: JOURNAL_OPEN_TIMEOUT,
            guard: CloseGuard::default(),
            stop: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl KernelLogSource for JournalctlSource {
    async fn open(&self) -> Result<mpsc::Receiver<String>> {
        if self.guard.is_closed() {
            return Err(MonitorError::LogSource("source already closed".to_string()));
        }

        let spawn = async {
            Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
        };
        let mut child = match tokio::time::timeout(self.open_timeout, spawn).await {
            Ok(Ok(child)) => child,
            Ok(Err(e)) => {
                return Err(MonitorError::LogSource(format!(
                    "failed to start {}: {}",
                    self.program, e
                )))
            }
            Err(_) => {
                return Err(MonitorError::LogSource(format!(
                    "timeout opening kernel log (waited {:?})",
                    self.open_timeout
                )))
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MonitorError::LogSource("kernel log has no stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let stop = self.stop.clone();
        let metrics = MonitorMetrics::new();
        debug!(program = %self.program, "Kernel log stream opened");

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !forward_line(&tx, line, &metrics) {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Kernel log read failed");
                            break;
                        }
                    },
                    _ = stop.notified() => break,
                }
            }
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Kernel log process already exited");
            }
        });

        Ok(rx)
    }

    async fn close(&self) {
        if self.guard.close() {
            self.stop.notify_one();
        }
    }
}
