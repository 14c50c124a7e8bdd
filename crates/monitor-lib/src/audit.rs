//! Append-only JSON Lines audit log
//!
//! Snapshots and threats are interleaved without a discriminator; readers
//! tell them apart by the `container_name` field only snapshots carry.

use crate::error::Result;
use crate::models::{Snapshot, ThreatEvent};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Shared by both pipelines; every write is flushed and fsynced
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (creating parent directories) in append mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "Opened audit log");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.append(snapshot)
    }

    pub fn write_threat(&self, threat: &ThreatEvent) -> Result<()> {
        self.append(threat)
    }

    fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write_all(&line)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

/// One decoded audit log line
#[derive(Debug, Clone)]
pub enum AuditEntry {
    Snapshot(Box<Snapshot>),
    Threat(Box<ThreatEvent>),
    /// Valid JSON that matches neither record shape
    Other(serde_json::Value),
}

fn classify(value: serde_json::Value) -> AuditEntry {
    if value.get("container_name").is_some() {
        match serde_json::from_value::<Snapshot>(value.clone()) {
            Ok(snapshot) => AuditEntry::Snapshot(Box::new(snapshot)),
            Err(_) => AuditEntry::Other(value),
        }
    } else {
        match serde_json::from_value::<ThreatEvent>(value.clone()) {
            Ok(threat) => AuditEntry::Threat(Box::new(threat)),
            Err(_) => AuditEntry::Other(value),
        }
    }
}

/// Read an audit log, skipping blank and unparseable lines
pub fn read_audit_log(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .map(classify)
        .collect())
}
