use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

pub mod memory;
pub mod sqlite;

pub type SessionId = Uuid;

/// Which gate camera produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    Entry,
    Exit,
}

impl CameraRole {
    pub fn as_str(self) -> &'static str {
        match self {
            CameraRole::Entry => "entry",
            CameraRole::Exit => "exit",
        }
    }
}

impl fmt::Display for CameraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid camera role: {0:?}")]
pub struct InvalidCameraRole(pub String);

impl FromStr for CameraRole {
    type Err = InvalidCameraRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "entry" => Ok(CameraRole::Entry),
            "exit" => Ok(CameraRole::Exit),
            _ => Err(InvalidCameraRole(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Entered,
    Completed,
    ExitWithoutEntry,
    /// Plain sighting with no gate semantics; kept readable for legacy rows.
    Detected,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Entered => "entered",
            SessionStatus::Completed => "completed",
            SessionStatus::ExitWithoutEntry => "exit_without_entry",
            SessionStatus::Detected => "detected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "entered" => Some(SessionStatus::Entered),
            "completed" => Some(SessionStatus::Completed),
            "exit_without_entry" => Some(SessionStatus::ExitWithoutEntry),
            "detected" => Some(SessionStatus::Detected),
            _ => None,
        }
    }
}

/// A detection/session record. A plate has many of these over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub plate_number: String,
    pub confidence_score: f64,
    pub camera_role: CameraRole,
    pub camera_location: String,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub entry_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub exit_time: Option<OffsetDateTime>,
    pub duration_hours: Option<f64>,
    pub fare_amount: Option<f64>,
    pub hourly_rate: Option<f64>,
    pub status: SessionStatus,
    pub image_ref: Option<String>,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        self.entry_time.is_some() && self.exit_time.is_none()
    }
}

/// Fields written when an open session is refreshed by a repeat entry sighting.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRefresh {
    pub entry_time: OffsetDateTime,
    pub confidence_score: f64,
    pub camera_location: String,
    pub image_ref: Option<String>,
}

/// Fields written, all together, when an open session is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClosure {
    /// Entry time the fare was computed from. The close only applies while
    /// the session still carries it.
    pub opened_at: OffsetDateTime,
    pub exit_time: OffsetDateTime,
    pub duration_hours: f64,
    pub fare_amount: f64,
    pub hourly_rate: f64,
    pub confidence_score: f64,
    pub camera_location: String,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionPatch {
    RefreshEntry(EntryRefresh),
    Close(SessionClosure),
}

impl SessionPatch {
    /// Whether the patch may be written to `record` as it currently stands.
    pub fn applies_to(&self, record: &SessionRecord) -> bool {
        match self {
            SessionPatch::RefreshEntry(_) => record.is_open(),
            SessionPatch::Close(closure) => {
                record.is_open() && record.entry_time == Some(closure.opened_at)
            }
        }
    }

    /// Apply the patch in place. Callers must have checked the record is open.
    pub fn apply(&self, record: &mut SessionRecord) {
        match self {
            SessionPatch::RefreshEntry(refresh) => {
                record.entry_time = Some(refresh.entry_time);
                record.detected_at = refresh.entry_time;
                record.confidence_score = refresh.confidence_score;
                record.camera_role = CameraRole::Entry;
                record.camera_location = refresh.camera_location.clone();
                if refresh.image_ref.is_some() {
                    record.image_ref = refresh.image_ref.clone();
                }
                record.status = SessionStatus::Entered;
            }
            SessionPatch::Close(closure) => {
                record.exit_time = Some(closure.exit_time);
                record.detected_at = closure.exit_time;
                record.duration_hours = Some(closure.duration_hours);
                record.fare_amount = Some(closure.fare_amount);
                record.hourly_rate = Some(closure.hourly_rate);
                record.confidence_score = closure.confidence_score;
                record.camera_role = CameraRole::Exit;
                record.camera_location = closure.camera_location.clone();
                if closure.image_ref.is_some() {
                    record.image_ref = closure.image_ref.clone();
                }
                record.status = SessionStatus::Completed;
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Lock,
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage of detection/session records.
pub trait SessionStore: Send + Sync {
    /// All open sessions for a normalized plate, in no particular order.
    fn open_sessions(&self, plate: &str) -> Result<Vec<SessionRecord>, StoreError>;

    fn insert(&self, record: SessionRecord) -> Result<SessionRecord, StoreError>;

    /// Insert an entry record unless its plate already has an open session,
    /// as one atomic step. Returns `None` when nothing was written.
    fn insert_open(&self, record: SessionRecord) -> Result<Option<SessionRecord>, StoreError>;

    /// Apply `patch` only if the record exists and `SessionPatch::applies_to`
    /// holds, as one atomic step. Returns `None` when nothing was written.
    fn update(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<Option<SessionRecord>, StoreError>;

    fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// Most recently detected records first.
    fn list_recent(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError>;
}
