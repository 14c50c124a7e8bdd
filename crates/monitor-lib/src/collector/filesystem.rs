//! Workspace I/O deltas and temp-storage usage

use super::cgroup::{CgroupReader, IoCounters};
use crate::control::ContainerControl;
use crate::models::FilesystemStats;
use anyhow::Result;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// `/tmp` usage as reported by `df -BM`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TmpUsage {
    pub used_mb: f64,
    pub total_mb: f64,
    pub used_percent: f64,
}

/// Parse `df -BM /tmp` output
///
/// `Filesystem 1M-blocks Used Available Use% Mounted on`
pub fn parse_df(output: &str) -> Option<TmpUsage> {
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let number = |s: &str, suffix: char| s.trim_end_matches(suffix).parse::<f64>().ok();
    Some(TmpUsage {
        total_mb: number(fields[1], 'M')?,
        used_mb: number(fields[2], 'M')?,
        used_percent: number(fields[4], '%')?,
    })
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    counters: IoCounters,
    at: Instant,
}

/// Turns cumulative cgroup I/O counters into per-interval volumes and rates
///
/// The first observation only records a baseline and reports zero.
#[derive(Debug, Default)]
pub struct FilesystemMonitor {
    baseline: Mutex<Option<Baseline>>,
}

impl FilesystemMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `counters` observed at `now` and report the delta since the last call
    pub fn observe(&self, counters: IoCounters, now: Instant) -> FilesystemStats {
        let mut guard = match self.baseline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut stats = FilesystemStats {
            available: true,
            ..Default::default()
        };

        if let Some(previous) = *guard {
            let elapsed = now.saturating_duration_since(previous.at).as_secs_f64();
            if elapsed > 0.0 {
                let read_mb =
                    counters.read_bytes.saturating_sub(previous.counters.read_bytes) as f64 / BYTES_PER_MB;
                let write_mb = counters
                    .write_bytes
                    .saturating_sub(previous.counters.write_bytes) as f64
                    / BYTES_PER_MB;

                stats.total_read_mb = read_mb;
                stats.read_rate_mb_per_sec = read_mb / elapsed;
                stats.total_write_mb = write_mb;
                stats.write_rate_mb_per_sec = write_mb / elapsed;
            } else {
                // keep the old baseline so the next poll sees a real interval
                return stats;
            }
        }

        *guard = Some(Baseline { counters, at: now });
        stats
    }

    pub async fn collect(
        &self,
        name: &str,
        cgroup: &CgroupReader,
        control: &dyn ContainerControl,
    ) -> Result<FilesystemStats> {
        let counters = cgroup.io_counters(name, control).await?;
        let mut stats = self.observe(counters, Instant::now());

        match control.exec(name, &["df", "-BM", "/tmp"]).await {
            Ok(output) => {
                if let Some(tmp) = parse_df(&output) {
                    stats.tmp_used_mb = tmp.used_mb;
                    stats.tmp_total_mb = tmp.total_mb;
                    stats.tmp_used_percent = tmp.used_percent;
                }
            }
            Err(e) => debug!(container = %name, error = %e, "Failed to collect /tmp usage"),
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_first_poll_is_baseline_only() {
        let monitor = FilesystemMonitor::new();
        let stats = monitor.observe(
            IoCounters {
                read_bytes: 500 * MB,
                write_bytes: 100 * MB,
            },
            Instant::now(),
        );
        assert!(stats.available);
        assert_eq!(stats.total_read_mb, 0.0);
        assert_eq!(stats.read_rate_mb_per_sec, 0.0);
        assert_eq!(stats.total_write_mb, 0.0);
    }

    #[test]
    fn test_second_poll_reports_delta_and_rate() {
        let monitor = FilesystemMonitor::new();
        let start = Instant::now();
        monitor.observe(
            IoCounters {
                read_bytes: 100 * MB,
                write_bytes: 10 * MB,
            },
            start,
        );
        let stats = monitor.observe(
            IoCounters {
                read_bytes: 300 * MB,
                write_bytes: 50 * MB,
            },
            start + Duration::from_secs(4),
        );
        assert_eq!(stats.total_read_mb, 200.0);
        assert_eq!(stats.read_rate_mb_per_sec, 50.0);
        assert_eq!(stats.total_write_mb, 40.0);
        assert_eq!(stats.write_rate_mb_per_sec, 10.0);
    }

    #[test]
    fn test_counter_reset_does_not_underflow() {
        let monitor = FilesystemMonitor::new();
        let start = Instant::now();
        monitor.observe(IoCounters { read_bytes: 100 * MB, write_bytes: 0 }, start);
        let stats = monitor.observe(IoCounters::default(), start + Duration::from_secs(1));
        assert_eq!(stats.total_read_mb, 0.0);
    }

    #[test]
    fn test_parse_df() {
        let output = "Filesystem     1M-blocks  Used Available Use% Mounted on\n\
tmpfs              2048M  100M     1948M   5% /tmp\n";
        let tmp = parse_df(output).unwrap();
        assert_eq!(tmp.total_mb, 2048.0);
        assert_eq!(tmp.used_mb, 100.0);
        assert_eq!(tmp.used_percent, 5.0);

        assert!(parse_df("Filesystem only").is_none());
    }
}
