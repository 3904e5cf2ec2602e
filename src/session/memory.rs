use crate::audit::{AuditEntry, AuditError, AuditSink};
use crate::fare::RatePolicy;
use crate::fare::rates::{RateSource, newest_active};
use crate::session::{SessionId, SessionPatch, SessionRecord, SessionStore, StoreError};
use std::sync::RwLock;

/// In-process store used when no database path is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<Vec<SessionRecord>>,
    rates: RwLock<Vec<RatePolicy>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|rows| rows.len()).unwrap_or(0)
    }
}

impl SessionStore for MemoryStore {
    fn open_sessions(&self, plate: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = self.sessions.read().map_err(|_| StoreError::Lock)?;
        Ok(rows
            .iter()
            .filter(|row| row.plate_number == plate && row.is_open())
            .cloned()
            .collect())
    }

    fn insert(&self, record: SessionRecord) -> Result<SessionRecord, StoreError> {
        let mut rows = self.sessions.write().map_err(|_| StoreError::Lock)?;
        rows.push(record.clone());
        Ok(record)
    }

    fn insert_open(&self, record: SessionRecord) -> Result<Option<SessionRecord>, StoreError> {
        let mut rows = self.sessions.write().map_err(|_| StoreError::Lock)?;
        if rows
            .iter()
            .any(|row| row.plate_number == record.plate_number && row.is_open())
        {
            return Ok(None);
        }
        rows.push(record.clone());
        Ok(Some(record))
    }

    fn update(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<Option<SessionRecord>, StoreError> {
        // check and write under one write guard
        let mut rows = self.sessions.write().map_err(|_| StoreError::Lock)?;
        let Some(row) = rows.iter_mut().find(|row| row.id == id) else {
            return Ok(None);
        };
        if !patch.applies_to(row) {
            return Ok(None);
        }
        patch.apply(row);
        Ok(Some(row.clone()))
    }

    fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let rows = self.sessions.read().map_err(|_| StoreError::Lock)?;
        Ok(rows.iter().find(|row| row.id == id).cloned())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = self.sessions.read().map_err(|_| StoreError::Lock)?;
        let mut recent: Vec<SessionRecord> = rows.clone();
        recent.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        recent.truncate(limit);
        Ok(recent)
    }
}

impl RateSource for MemoryStore {
    fn find_active_rate(&self) -> Result<Option<RatePolicy>, StoreError> {
        let rates = self.rates.read().map_err(|_| StoreError::Lock)?;
        Ok(newest_active(rates.iter()).cloned())
    }

    fn insert_rate(&self, policy: RatePolicy) -> Result<RatePolicy, StoreError> {
        let mut rates = self.rates.write().map_err(|_| StoreError::Lock)?;
        rates.push(policy.clone());
        Ok(policy)
    }
}

impl AuditSink for MemoryStore {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut entries = self.audit.write().map_err(|_| AuditError::Lock)?;
        entries.push(entry.clone());
        Ok(())
    }
}
