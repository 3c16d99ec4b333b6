//! Append-only JSON-lines record of applied mutations with bounded
//! rotation (C3).

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::mutation::Mutation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Accepted,
    Rejected,
}

/// One applied-or-rejected mutation record (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub timestamp: u64,
    pub kind: String,
    pub params: serde_json::Value,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl AuditEntry {
    pub fn accepted(kind: &str, mutation: &Mutation, before: serde_json::Value, after: serde_json::Value, timestamp: u64) -> Self {
        Self {
            timestamp,
            kind: kind.to_string(),
            params: serde_json::to_value(&mutation.kind).unwrap_or(serde_json::Value::Null),
            before,
            after,
            outcome: AuditOutcome::Accepted,
            rule: None,
        }
    }

    pub fn rejected(kind: &str, mutation: &Mutation, rule: &str, timestamp: u64) -> Self {
        Self {
            timestamp,
            kind: kind.to_string(),
            params: serde_json::to_value(&mutation.kind).unwrap_or(serde_json::Value::Null),
            before: serde_json::Value::Null,
            after: serde_json::Value::Null,
            outcome: AuditOutcome::Rejected,
            rule: Some(rule.to_string()),
        }
    }
}

enum Backing {
    File(PathBuf, u64),
    Memory(Vec<AuditEntry>),
}

/// Append-only audit log, rotated to `audit.old` once it exceeds
/// `max_bytes` (spec.md §4.5, §6).
pub struct AuditLog {
    backing: Backing,
    max_bytes: u64,
}

impl AuditLog {
    pub fn open(path: PathBuf, max_bytes: u64) -> Result<Self, StateError> {
        let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            backing: Backing::File(path, len),
            max_bytes,
        })
    }

    /// An in-memory audit log for tests that don't need real file I/O.
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
            max_bytes: u64::MAX,
        }
    }

    pub fn append(&mut self, entry: AuditEntry) {
        match &mut self.backing {
            Backing::Memory(entries) => entries.push(entry),
            Backing::File(path, len) => {
                if *len > self.max_bytes {
                    Self::rotate(path);
                    *len = 0;
                }
                let line = match serde_json::to_string(&entry) {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize audit entry");
                        return;
                    }
                };
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(mut file) => {
                        if writeln!(file, "{line}").is_ok() {
                            *len += line.len() as u64 + 1;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to open audit log for append"),
                }
            }
        }
    }

    fn rotate(path: &Path) {
        let rotated = path.with_extension("old");
        if let Err(e) = std::fs::rename(path, &rotated) {
            tracing::warn!(error = %e, "failed to rotate audit log");
        }
    }

    /// All entries, for tests and the in-memory case only — production
    /// reads should use [`AuditLog::recent`]'s bounded tail instead.
    pub fn entries(&self) -> Vec<AuditEntry> {
        match &self.backing {
            Backing::Memory(entries) => entries.clone(),
            Backing::File(path, _) => read_all(path).unwrap_or_default(),
        }
    }

    /// Return the last `n` entries without loading the whole file,
    /// clamped to `[1, 1000]` (spec.md §4.8 `/mutations`).
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let n = n.clamp(1, 1000);
        match &self.backing {
            Backing::Memory(entries) => {
                let start = entries.len().saturating_sub(n);
                entries[start..].to_vec()
            }
            Backing::File(path, _) => {
                let all = read_all(path).unwrap_or_default();
                let start = all.len().saturating_sub(n);
                all[start..].to_vec()
            }
        }
    }
}

fn read_all(path: &Path) -> std::io::Result<Vec<AuditEntry>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => out.push(entry),
            Err(e) => tracing::warn!(error = %e, "skipping unparseable audit line"),
        }
    }
    Ok(out)
}
