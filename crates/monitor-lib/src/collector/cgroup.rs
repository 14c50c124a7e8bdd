//! cgroup v2 resource accounting for a single container
//!
//! Reads from the unified hierarchy:
//! - cpu.stat for total/user/system CPU time
//! - memory.current and memory.max for usage and limit
//! - io.stat for cumulative block I/O

use crate::control::ContainerControl;
use crate::models::ResourceStats;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Directory templates tried, in order, before falling back to the init pid
const CGROUP_TEMPLATES: &[&str] = &["incus.monitor", "lxc.monitor", "lxc", "incus"];

/// CPU time from cpu.stat, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub usage_usec: u64,
    pub user_usec: u64,
    pub system_usec: u64,
}

/// Cumulative block I/O summed over all devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl IoCounters {
    pub fn is_zero(&self) -> bool {
        self.read_bytes == 0 && self.write_bytes == 0
    }
}

/// Locates a container's cgroup and reads its accounting files
pub struct CgroupReader {
    cgroup_root: PathBuf,
    proc_path: PathBuf,
    located: RwLock<Option<PathBuf>>,
}

impl CgroupReader {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self::with_proc_path(cgroup_root, "/proc")
    }

    /// Create a reader with a custom proc path (for testing)
    pub fn with_proc_path(cgroup_root: impl Into<PathBuf>, proc_path: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc_path: proc_path.into(),
            located: RwLock::new(None),
        }
    }

    /// Candidate cgroup directories for `name`, in lookup order
    pub fn candidate_paths(&self, name: &str) -> Vec<PathBuf> {
        CGROUP_TEMPLATES
            .iter()
            .map(|prefix| self.cgroup_root.join(prefix).join(name))
            .collect()
    }

    /// Parse cpu.stat file contents
    pub fn parse_cpu_stat(content: &str) -> CpuStat {
        let mut stat = CpuStat::default();

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 2 {
                continue;
            }
            let Ok(value) = parts[1].parse::<u64>() else {
                continue;
            };
            match parts[0] {
                "usage_usec" => stat.usage_usec = value,
                "user_usec" => stat.user_usec = value,
                "system_usec" => stat.system_usec = value,
                _ => {}
            }
        }

        stat
    }

    /// Parse memory.max; `max` means no limit
    pub fn parse_memory_max(content: &str) -> Option<u64> {
        let value = content.trim();
        if value == "max" {
            return None;
        }
        value.parse().ok().filter(|v| *v > 0)
    }

    /// Parse io.stat, summing rbytes/wbytes across devices
    ///
    /// Format: `<major>:<minor> rbytes=X wbytes=Y rios=.. wios=..`
    pub fn parse_io_stat(content: &str) -> IoCounters {
        let mut counters = IoCounters::default();

        for line in content.lines() {
            for field in line.split_whitespace().skip(1) {
                let Some((key, value)) = field.split_once('=') else {
                    continue;
                };
                let Ok(value) = value.parse::<u64>() else {
                    continue;
                };
                match key {
                    "rbytes" => counters.read_bytes = counters.read_bytes.saturating_add(value),
                    "wbytes" => counters.write_bytes = counters.write_bytes.saturating_add(value),
                    _ => {}
                }
            }
        }

        counters
    }

    /// Parse /proc/{pid}/cgroup to get cgroup path for a process
    pub async fn get_cgroup_path_for_pid(&self, pid: u32) -> Result<String> {
        let cgroup_file = self.proc_path.join(format!("{}/cgroup", pid));
        let content = fs::read_to_string(&cgroup_file)
            .await
            .with_context(|| format!("Failed to read cgroup for pid {}", pid))?;

        // cgroup v2 format: "0::/path/to/cgroup"
        for line in content.lines() {
            if let Some(path) = line.strip_prefix("0::") {
                return Ok(path.trim().to_string());
            }
        }

        anyhow::bail!("No cgroup v2 path found for pid {}", pid)
    }

    /// Build full cgroup filesystem path from relative cgroup path
    pub fn build_cgroup_fs_path(&self, cgroup_path: &str) -> PathBuf {
        self.cgroup_root.join(cgroup_path.trim_start_matches('/'))
    }

    /// Find the cgroup directory for `name`
    pub async fn locate(&self, name: &str, control: &dyn ContainerControl) -> Result<PathBuf> {
        let cached = self.located.read().ok().and_then(|guard| guard.clone());
        if let Some(path) = cached {
            if fs::metadata(&path).await.is_ok() {
                return Ok(path);
            }
        }

        let path = self.resolve(name, control).await?;
        if let Ok(mut guard) = self.located.write() {
            *guard = Some(path.clone());
        }
        Ok(path)
    }

    async fn resolve(&self, name: &str, control: &dyn ContainerControl) -> Result<PathBuf> {
        for candidate in self.candidate_paths(name) {
            if fs::metadata(&candidate).await.is_ok() {
                debug!(container = %name, path = %candidate.display(), "Found cgroup");
                return Ok(candidate);
            }
        }

        let pid = control
            .init_pid(name)
            .await
            .context("Failed to get container init pid")?
            .with_context(|| format!("Container {} has no init pid", name))?;
        let relative = self.get_cgroup_path_for_pid(pid).await?;
        let path = self.build_cgroup_fs_path(&relative);
        debug!(container = %name, pid, path = %path.display(), "Found cgroup via init pid");
        Ok(path)
    }

    async fn read_io_at(path: &Path) -> Result<IoCounters> {
        let file = path.join("io.stat");
        let content = fs::read_to_string(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        Ok(Self::parse_io_stat(&content))
    }

    /// Read io.stat, retrying once against the parent when the leaf reports zero
    pub async fn read_io(&self, cgroup_path: &Path) -> Result<IoCounters> {
        let counters = Self::read_io_at(cgroup_path).await?;
        if !counters.is_zero() {
            return Ok(counters);
        }

        if let Some(parent) = cgroup_path.parent() {
            if let Ok(parent_counters) = Self::read_io_at(parent).await {
                if !parent_counters.is_zero() {
                    debug!(path = %parent.display(), "Using parent cgroup I/O stats");
                    return Ok(parent_counters);
                }
            }
        }
        Ok(counters)
    }

    /// Cumulative I/O for the container, used by the filesystem monitor
    pub async fn io_counters(&self, name: &str, control: &dyn ContainerControl) -> Result<IoCounters> {
        let path = self.locate(name, control).await?;
        self.read_io(&path).await
    }

    /// Collect a full resource reading for the container
    pub async fn collect(&self, name: &str, control: &dyn ContainerControl) -> Result<ResourceStats> {
        let path = self.locate(name, control).await?;

        let cpu_content = fs::read_to_string(path.join("cpu.stat"))
            .await
            .context("Failed to read CPU stats")?;
        let cpu = Self::parse_cpu_stat(&cpu_content);

        let memory_current: u64 = fs::read_to_string(path.join("memory.current"))
            .await
            .context("Failed to read memory stats")?
            .trim()
            .parse()
            .context("Failed to parse memory.current value")?;

        let memory_limit = fs::read_to_string(path.join("memory.max"))
            .await
            .ok()
            .and_then(|content| Self::parse_memory_max(&content));

        // I/O accounting is optional on some hosts
        let io = match self.read_io(&path).await {
            Ok(io) => io,
            Err(e) => {
                debug!(container = %name, error = %e, "I/O stats unavailable");
                IoCounters::default()
            }
        };

        Ok(ResourceStats {
            available: true,
            cpu_time_seconds: cpu.usage_usec as f64 / 1_000_000.0,
            user_cpu_seconds: cpu.user_usec as f64 / 1_000_000.0,
            sys_cpu_seconds: cpu.system_usec as f64 / 1_000_000.0,
            memory_mb: memory_current as f64 / BYTES_PER_MB,
            memory_limit_mb: memory_limit.map(|limit| limit as f64 / BYTES_PER_MB),
            io_read_mb: io.read_bytes as f64 / BYTES_PER_MB,
            io_write_mb: io.write_bytes as f64 / BYTES_PER_MB,
        })
    }
}
