use crate::audit::{AuditEntry, AuditError, AuditSink};
use crate::fare::RatePolicy;
use crate::fare::rates::RateSource;
use crate::session::{
    CameraRole, SessionId, SessionPatch, SessionRecord, SessionStatus, SessionStore, StoreError,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vehicle_detections (
    id TEXT PRIMARY KEY,
    plate_number TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    camera_role TEXT NOT NULL,
    camera_location TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    entry_time INTEGER,
    exit_time INTEGER,
    duration_hours REAL,
    fare_amount REAL,
    hourly_rate REAL,
    status TEXT NOT NULL,
    image_ref TEXT
);
CREATE INDEX IF NOT EXISTS idx_vehicle_detections_open
    ON vehicle_detections (plate_number, exit_time);
CREATE INDEX IF NOT EXISTS idx_vehicle_detections_detected_at
    ON vehicle_detections (detected_at);
CREATE TABLE IF NOT EXISTS fare_rates (
    id TEXT PRIMARY KEY,
    rate_name TEXT NOT NULL,
    hourly_rate REAL NOT NULL,
    minimum_charge REAL NOT NULL,
    grace_period_minutes INTEGER NOT NULL,
    is_active INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS system_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    log_type TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT,
    timestamp INTEGER NOT NULL
);
";

/// Enforces at most one open session per plate. Created separately so a
/// database that already holds duplicate open rows still opens.
const OPEN_PLATE_INDEX: &str = "
CREATE UNIQUE INDEX IF NOT EXISTS idx_vehicle_detections_one_open
    ON vehicle_detections (plate_number)
    WHERE entry_time IS NOT NULL AND exit_time IS NULL;
";

const SESSION_COLUMNS: &str = "id, plate_number, confidence_score, camera_role, camera_location, \
     detected_at, entry_time, exit_time, duration_hours, fare_amount, hourly_rate, status, image_ref";

const OPEN_CONDITION: &str = "entry_time IS NOT NULL AND exit_time IS NULL";

/// SQLite-backed store for sessions, rate policies and the audit trail.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|err| StoreError::Unavailable(format!("create {}: {err}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened session database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        if let Err(err) = conn.execute_batch(OPEN_PLATE_INDEX) {
            warn!(error = %err, "Duplicate open sessions present, one-open-per-plate index not created");
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }
}

struct RawSession {
    id: String,
    plate_number: String,
    confidence_score: f64,
    camera_role: String,
    camera_location: String,
    detected_at: i64,
    entry_time: Option<i64>,
    exit_time: Option<i64>,
    duration_hours: Option<f64>,
    fare_amount: Option<f64>,
    hourly_rate: Option<f64>,
    status: String,
    image_ref: Option<String>,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            plate_number: row.get(1)?,
            confidence_score: row.get(2)?,
            camera_role: row.get(3)?,
            camera_location: row.get(4)?,
            detected_at: row.get(5)?,
            entry_time: row.get(6)?,
            exit_time: row.get(7)?,
            duration_hours: row.get(8)?,
            fare_amount: row.get(9)?,
            hourly_rate: row.get(10)?,
            status: row.get(11)?,
            image_ref: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<SessionRecord, StoreError> {
        Ok(SessionRecord {
            id: parse_uuid(&self.id)?,
            plate_number: self.plate_number,
            confidence_score: self.confidence_score,
            camera_role: self
                .camera_role
                .parse::<CameraRole>()
                .map_err(|err| StoreError::Corrupt(err.to_string()))?,
            camera_location: self.camera_location,
            detected_at: from_nanos(self.detected_at, "detected_at")?,
            entry_time: self
                .entry_time
                .map(|value| from_nanos(value, "entry_time"))
                .transpose()?,
            exit_time: self
                .exit_time
                .map(|value| from_nanos(value, "exit_time"))
                .transpose()?,
            duration_hours: self.duration_hours,
            fare_amount: self.fare_amount,
            hourly_rate: self.hourly_rate,
            status: SessionStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{}'", self.status)))?,
            image_ref: self.image_ref,
        })
    }
}

fn to_nanos(value: OffsetDateTime) -> Result<i64, StoreError> {
    i64::try_from(value.unix_timestamp_nanos())
        .map_err(|_| StoreError::Corrupt(format!("timestamp {value} exceeds INTEGER range")))
}

fn from_nanos(value: i64, column: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .map_err(|err| StoreError::Corrupt(format!("invalid {column} {value}: {err}")))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|err| StoreError::Corrupt(format!("invalid id '{value}': {err}")))
}

fn select_session(conn: &Connection, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM vehicle_detections WHERE id = ?1"),
            params![id.to_string()],
            RawSession::from_row,
        )
        .optional()?;
    raw.map(RawSession::into_record).transpose()
}

impl SessionStore for SqliteStore {
    fn open_sessions(&self, plate: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM vehicle_detections
             WHERE plate_number = ?1 AND {OPEN_CONDITION}"
        ))?;
        let rows = stmt.query_map(params![plate], RawSession::from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_record()?);
        }
        Ok(sessions)
    }

    fn insert(&self, record: SessionRecord) -> Result<SessionRecord, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO vehicle_detections ({SESSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                record.id.to_string(),
                record.plate_number,
                record.confidence_score,
                record.camera_role.as_str(),
                record.camera_location,
                to_nanos(record.detected_at)?,
                record.entry_time.map(to_nanos).transpose()?,
                record.exit_time.map(to_nanos).transpose()?,
                record.duration_hours,
                record.fare_amount,
                record.hourly_rate,
                record.status.as_str(),
                record.image_ref,
            ],
        )?;
        Ok(record)
    }

    fn insert_open(&self, record: SessionRecord) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO vehicle_detections ({SESSION_COLUMNS})
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
                 WHERE NOT EXISTS (
                     SELECT 1 FROM vehicle_detections
                     WHERE plate_number = ?2 AND {OPEN_CONDITION}
                 )"
            ),
            params![
                record.id.to_string(),
                record.plate_number,
                record.confidence_score,
                record.camera_role.as_str(),
                record.camera_location,
                to_nanos(record.detected_at)?,
                record.entry_time.map(to_nanos).transpose()?,
                record.exit_time.map(to_nanos).transpose()?,
                record.duration_hours,
                record.fare_amount,
                record.hourly_rate,
                record.status.as_str(),
                record.image_ref,
            ],
        );
        match inserted {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(record)),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn update(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let changed = match &patch {
            SessionPatch::RefreshEntry(refresh) => conn.execute(
                &format!(
                    "UPDATE vehicle_detections
                     SET entry_time = ?1, detected_at = ?1, confidence_score = ?2,
                         camera_role = 'entry', camera_location = ?3,
                         image_ref = COALESCE(?4, image_ref), status = 'entered'
                     WHERE id = ?5 AND {OPEN_CONDITION}"
                ),
                params![
                    to_nanos(refresh.entry_time)?,
                    refresh.confidence_score,
                    refresh.camera_location,
                    refresh.image_ref,
                    id.to_string(),
                ],
            )?,
            SessionPatch::Close(closure) => conn.execute(
                &format!(
                    "UPDATE vehicle_detections
                     SET exit_time = ?1, detected_at = ?1, duration_hours = ?2,
                         fare_amount = ?3, hourly_rate = ?4, confidence_score = ?5,
                         camera_role = 'exit', camera_location = ?6,
                         image_ref = COALESCE(?7, image_ref), status = 'completed'
                     WHERE id = ?8 AND {OPEN_CONDITION} AND entry_time = ?9"
                ),
                params![
                    to_nanos(closure.exit_time)?,
                    closure.duration_hours,
                    closure.fare_amount,
                    closure.hourly_rate,
                    closure.confidence_score,
                    closure.camera_location,
                    closure.image_ref,
                    id.to_string(),
                    to_nanos(closure.opened_at)?,
                ],
            )?,
        };
        if changed == 0 {
            return Ok(None);
        }
        select_session(&conn, id)
    }

    fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        select_session(&conn, id)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM vehicle_detections
             ORDER BY detected_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], RawSession::from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_record()?);
        }
        Ok(sessions)
    }
}

impl RateSource for SqliteStore {
    fn find_active_rate(&self) -> Result<Option<RatePolicy>, StoreError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT id, rate_name, hourly_rate, minimum_charge, grace_period_minutes,
                        is_active, created_at
                 FROM fare_rates
                 WHERE is_active = 1
                 ORDER BY created_at DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, hourly_rate, minimum_charge, grace, is_active, created_at)) = raw
        else {
            return Ok(None);
        };
        Ok(Some(RatePolicy {
            id: parse_uuid(&id)?,
            name,
            hourly_rate,
            minimum_charge,
            grace_period_minutes: grace,
            is_active,
            created_at: from_nanos(created_at, "created_at")?,
        }))
    }

    fn insert_rate(&self, policy: RatePolicy) -> Result<RatePolicy, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO fare_rates (id, rate_name, hourly_rate, minimum_charge,
                                     grace_period_minutes, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                policy.id.to_string(),
                policy.name,
                policy.hourly_rate,
                policy.minimum_charge,
                policy.grace_period_minutes,
                policy.is_active,
                to_nanos(policy.created_at)?,
            ],
        )?;
        Ok(policy)
    }
}

impl AuditSink for SqliteStore {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let details = serde_json::to_string(&entry.details)?;
        let timestamp = i64::try_from(entry.timestamp.unix_timestamp_nanos()).unwrap_or(i64::MAX);
        let conn = self.conn.lock().map_err(|_| AuditError::Lock)?;
        conn.execute(
            "INSERT INTO system_logs (log_type, message, details, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry.kind.as_str(), entry.message, details, timestamp],
        )?;
        Ok(())
    }
}
