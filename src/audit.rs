//! Append-only audit trail of reconciliation outcomes.
//!
//! Writes are handed to a dedicated worker thread so a slow or failing sink
//! never delays the primary session write. Failures are logged and dropped.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Detection,
    Entry,
    Exit,
    OrphanExit,
    Error,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::Detection => "detection",
            AuditKind::Entry => "entry",
            AuditKind::Exit => "exit",
            AuditKind::OrphanExit => "orphan_exit",
            AuditKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub kind: AuditKind,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        message: impl Into<String>,
        details: serde_json::Value,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details,
            timestamp,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink lock poisoned")]
    Lock,
    #[error("audit sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("audit details serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Fire-and-forget handle to the audit worker.
#[derive(Debug, Clone)]
pub struct AuditLog {
    sender: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditLog {
    /// Start the worker thread. It exits once every handle has been dropped.
    pub fn spawn(sink: Arc<dyn AuditSink>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel::<AuditEntry>();
        let handle = std::thread::spawn(move || {
            for entry in receiver {
                if let Err(err) = sink.append(&entry) {
                    warn!(
                        error = %err,
                        kind = entry.kind.as_str(),
                        "Audit log write failed"
                    );
                }
            }
            debug!("Audit worker stopped");
        });
        (
            Self {
                sender: Some(sender),
            },
            handle,
        )
    }

    /// A handle that discards every entry.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn append(&self, entry: AuditEntry) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if let Err(err) = sender.send(entry) {
            warn!(kind = err.0.kind.as_str(), "Audit worker gone, entry dropped");
        }
    }
}
