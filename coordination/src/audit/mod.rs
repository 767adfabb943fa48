//! Audit log — durable, replayable history of votes and outcomes
//!
//! Append-only JSON-lines file, one record per line. Replaying the log
//! against an empty context store reproduces an equivalent final state,
//! which is the disaster-recovery path for the whole core. JSON keeps the
//! log greppable when a round goes sideways.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consensus::RoundOutcome;
use crate::context::TtlClass;
use crate::types::{AgentId, RoundId, TaskId, Vote};

/// Error type for audit log operations
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for audit operations
pub type AuditResult<T> = Result<T, AuditError>;

/// Shared reference to AuditLog
pub type SharedAuditLog = Arc<AuditLog>;

/// One durable record in the audit stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    /// A committed context write
    ContextWrite {
        key: String,
        value: serde_json::Value,
        version: u64,
        writer: AgentId,
        written_at: DateTime<Utc>,
        ttl_class: TtlClass,
    },

    /// A vote received by the consensus engine
    ///
    /// `counted` is false for votes that arrived after round closure; they
    /// are kept for audit but never influence the outcome.
    VoteRecorded {
        round_id: RoundId,
        vote: Vote,
        counted: bool,
    },

    /// A vote rejected by protocol rules (duplicate, unknown participant)
    VoteRejected {
        round_id: RoundId,
        agent_id: AgentId,
        reason: String,
    },

    /// A round reaching a terminal state
    RoundOutcome {
        round_id: RoundId,
        task_id: TaskId,
        outcome: RoundOutcome,
        recorded_at: DateTime<Utc>,
    },
}

/// Append-only JSON-lines audit log
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Open or create an audit log at the given path
    pub fn open(path: impl Into<PathBuf>) -> AuditResult<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Create a shared reference to this log
    pub fn shared(self) -> SharedAuditLog {
        Arc::new(self)
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk
    pub fn append(&self, record: &AuditRecord) -> AuditResult<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().map_err(|_| AuditError::LockPoisoned)?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        debug!(path = %self.path.display(), "Audit record appended");
        Ok(())
    }

    /// Read every record from a log file in append order
    pub fn replay(path: impl AsRef<Path>) -> AuditResult<Vec<AuditRecord>> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}
