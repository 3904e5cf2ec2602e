//! Entry/exit reconciliation.
//!
//! Each detection is a `(plate, confidence, role)` event. Per plate, sessions
//! move `NONE -> OPEN -> CLOSED`; a repeat entry sighting refreshes the open
//! session in place and an exit with nothing open is recorded as an orphan.
//! Closing is a conditional store write, so two racing exits for the same
//! plate can never both compute a fare.

use crate::audit::{AuditEntry, AuditKind, AuditLog};
use crate::fare::rates::RateProvider;
use crate::fare::{FareBreakdown, FareError, compute_fare, round_cents};
use crate::session::{
    CameraRole, EntryRefresh, SessionClosure, SessionId, SessionPatch, SessionRecord,
    SessionStatus, SessionStore, StoreError,
};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_ENTRY_LOCATION: &str = "Entrance Gate";
pub const DEFAULT_EXIT_LOCATION: &str = "Exit Gate";

/// Conditional writes retried before giving up on a contended plate.
const MAX_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub plate: String,
    pub confidence: f64,
    pub role: CameraRole,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Entry,
    Exit,
    Fare,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Entry => "entry",
            Stage::Exit => "exit",
            Stage::Fare => "fare",
        })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid plate: {0:?}")]
    InvalidPlate(String),
    #[error("invalid confidence {0} for plate {1} (expected 0-100)")]
    InvalidConfidence(f64, String),
    #[error("fare calculation failed for plate {plate} at fare stage: {source}")]
    Calculation {
        plate: String,
        #[source]
        source: FareError,
    },
    #[error("session store failed for plate {plate} at {stage} stage: {source}")]
    Store {
        plate: String,
        stage: Stage,
        #[source]
        source: StoreError,
    },
    #[error("plate {plate} kept changing under concurrent writes at {stage} stage")]
    Contended { plate: String, stage: Stage },
}

impl ReconcileError {
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ReconcileError::InvalidPlate(_) | ReconcileError::InvalidConfidence(..)
        )
    }

    fn store(plate: &str, stage: Stage) -> impl FnOnce(StoreError) -> Self + '_ {
        move |source| ReconcileError::Store {
            plate: plate.to_string(),
            stage,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Entered(SessionRecord),
    Refreshed(SessionRecord),
    Closed {
        session: SessionRecord,
        fare: FareBreakdown,
        rate_name: String,
    },
    OrphanExit(SessionRecord),
    /// The open session was closed by a concurrent exit; nothing written.
    AlreadyClosed { plate: String },
}

impl ReconcileOutcome {
    pub fn session(&self) -> Option<&SessionRecord> {
        match self {
            ReconcileOutcome::Entered(session)
            | ReconcileOutcome::Refreshed(session)
            | ReconcileOutcome::OrphanExit(session)
            | ReconcileOutcome::Closed { session, .. } => Some(session),
            ReconcileOutcome::AlreadyClosed { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Entered(_) => "entered",
            ReconcileOutcome::Refreshed(_) => "refreshed",
            ReconcileOutcome::Closed { .. } => "closed",
            ReconcileOutcome::OrphanExit(_) => "orphan_exit",
            ReconcileOutcome::AlreadyClosed { .. } => "already_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraLocations {
    pub entry: String,
    pub exit: String,
}

impl CameraLocations {
    pub fn for_role(&self, role: CameraRole) -> &str {
        match role {
            CameraRole::Entry => &self.entry,
            CameraRole::Exit => &self.exit,
        }
    }
}

impl Default for CameraLocations {
    fn default() -> Self {
        Self {
            entry: DEFAULT_ENTRY_LOCATION.to_string(),
            exit: DEFAULT_EXIT_LOCATION.to_string(),
        }
    }
}

/// Trim and uppercase a plate, rejecting blank input.
pub fn normalize_plate(raw: &str) -> Option<String> {
    let plate = raw.trim();
    if plate.is_empty() {
        None
    } else {
        Some(plate.to_uppercase())
    }
}

/// Pick the open session with the latest entry time.
pub fn select_latest_open(sessions: Vec<SessionRecord>) -> Option<SessionRecord> {
    sessions
        .into_iter()
        .filter(SessionRecord::is_open)
        .max_by_key(|session| (session.entry_time, session.detected_at))
}

pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    rates: RateProvider,
    audit: AuditLog,
    locations: CameraLocations,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        rates: RateProvider,
        audit: AuditLog,
        locations: CameraLocations,
    ) -> Self {
        Self {
            store,
            rates,
            audit,
            locations,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn rates(&self) -> &RateProvider {
        &self.rates
    }

    pub fn reconcile(&self, detection: &Detection) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile_at(detection, OffsetDateTime::now_utc())
    }

    pub fn reconcile_at(
        &self,
        detection: &Detection,
        now: OffsetDateTime,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let plate = normalize_plate(&detection.plate)
            .ok_or_else(|| ReconcileError::InvalidPlate(detection.plate.clone()))?;
        if !detection.confidence.is_finite() || !(0.0..=100.0).contains(&detection.confidence) {
            return Err(ReconcileError::InvalidConfidence(detection.confidence, plate));
        }

        let result = match detection.role {
            CameraRole::Entry => self.record_entry(&plate, detection, now),
            CameraRole::Exit => self.record_exit(&plate, detection, now),
        };

        match &result {
            Ok(outcome) => self.audit.append(audit_for_outcome(&plate, outcome, now)),
            Err(err) => {
                error!(plate = %plate, role = %detection.role, error = %err, "Reconciliation failed");
                self.audit.append(AuditEntry::new(
                    AuditKind::Error,
                    err.to_string(),
                    json!({ "plate": plate, "camera_role": detection.role.as_str() }),
                    now,
                ));
            }
        }
        result
    }

    fn record_entry(
        &self,
        plate: &str,
        detection: &Detection,
        now: OffsetDateTime,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let open = self
                .store
                .open_sessions(plate)
                .map_err(ReconcileError::store(plate, Stage::Entry))?;
            warn_on_duplicates(plate, open.len());

            if let Some(current) = select_latest_open(open) {
                let refresh = SessionPatch::RefreshEntry(EntryRefresh {
                    entry_time: now,
                    confidence_score: detection.confidence,
                    camera_location: self.locations.entry.clone(),
                    image_ref: detection.image_ref.clone(),
                });
                let updated = self
                    .store
                    .update(current.id, refresh)
                    .map_err(ReconcileError::store(plate, Stage::Entry))?;
                if let Some(session) = updated {
                    info!(plate = %plate, session_id = %session.id, "Open session refreshed");
                    return Ok(ReconcileOutcome::Refreshed(session));
                }
                warn!(plate = %plate, session_id = %current.id, "Open session closed before refresh, opening a new one");
            }

            let inserted = self
                .store
                .insert_open(self.entry_record(plate, detection, now))
                .map_err(ReconcileError::store(plate, Stage::Entry))?;
            if let Some(session) = inserted {
                info!(plate = %plate, session_id = %session.id, "Vehicle entered");
                return Ok(ReconcileOutcome::Entered(session));
            }
            debug!(plate = %plate, attempt, "Concurrent entry opened a session first, retrying as refresh");
        }
        Err(ReconcileError::Contended {
            plate: plate.to_string(),
            stage: Stage::Entry,
        })
    }

    fn entry_record(&self, plate: &str, detection: &Detection, now: OffsetDateTime) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            plate_number: plate.to_string(),
            confidence_score: detection.confidence,
            camera_role: CameraRole::Entry,
            camera_location: self.locations.entry.clone(),
            detected_at: now,
            entry_time: Some(now),
            exit_time: None,
            duration_hours: None,
            fare_amount: None,
            hourly_rate: None,
            status: SessionStatus::Entered,
            image_ref: detection.image_ref.clone(),
        }
    }

    fn record_exit(
        &self,
        plate: &str,
        detection: &Detection,
        now: OffsetDateTime,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let rate = self.rates.active_rate();
        let mut lost_close: Option<SessionId> = None;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let open = self
                .store
                .open_sessions(plate)
                .map_err(ReconcileError::store(plate, Stage::Exit))?;
            warn_on_duplicates(plate, open.len());

            let Some((current, entry_time)) = select_latest_open(open)
                .and_then(|session| session.entry_time.map(|entry| (session, entry)))
            else {
                if let Some(session_id) = lost_close {
                    warn!(plate = %plate, session_id = %session_id, "Session already closed by a concurrent exit");
                    return Ok(ReconcileOutcome::AlreadyClosed {
                        plate: plate.to_string(),
                    });
                }
                return self.record_orphan_exit(plate, detection, now);
            };

            let fare = compute_fare(entry_time, now, &rate).map_err(|source| {
                ReconcileError::Calculation {
                    plate: plate.to_string(),
                    source,
                }
            })?;

            let closure = SessionPatch::Close(SessionClosure {
                opened_at: entry_time,
                exit_time: now,
                duration_hours: fare.duration_hours,
                fare_amount: fare.fare_amount,
                hourly_rate: fare.hourly_rate,
                confidence_score: detection.confidence,
                camera_location: self.locations.exit.clone(),
                image_ref: detection.image_ref.clone(),
            });
            let closed = self
                .store
                .update(current.id, closure)
                .map_err(ReconcileError::store(plate, Stage::Fare))?;

            if let Some(session) = closed {
                info!(
                    plate = %plate,
                    session_id = %session.id,
                    duration_minutes = fare.duration_minutes,
                    fare = %fare.display_amount(),
                    rate = %rate.name,
                    "Vehicle exited"
                );
                return Ok(ReconcileOutcome::Closed {
                    session,
                    fare,
                    rate_name: rate.name,
                });
            }
            debug!(plate = %plate, session_id = %current.id, attempt, "Session changed before close, re-reading");
            lost_close = Some(current.id);
        }
        Err(ReconcileError::Contended {
            plate: plate.to_string(),
            stage: Stage::Fare,
        })
    }

    fn record_orphan_exit(
        &self,
        plate: &str,
        detection: &Detection,
        now: OffsetDateTime,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let record = SessionRecord {
            id: Uuid::new_v4(),
            plate_number: plate.to_string(),
            confidence_score: detection.confidence,
            camera_role: CameraRole::Exit,
            camera_location: self.locations.exit.clone(),
            detected_at: now,
            entry_time: None,
            exit_time: Some(now),
            duration_hours: None,
            fare_amount: None,
            hourly_rate: None,
            status: SessionStatus::ExitWithoutEntry,
            image_ref: detection.image_ref.clone(),
        };
        let session = self
            .store
            .insert(record)
            .map_err(ReconcileError::store(plate, Stage::Exit))?;
        warn!(plate = %plate, session_id = %session.id, "Exit without matching entry");
        Ok(ReconcileOutcome::OrphanExit(session))
    }
}

fn warn_on_duplicates(plate: &str, open_count: usize) {
    if open_count > 1 {
        warn!(plate = %plate, open_count, "Multiple open sessions for plate, using latest entry");
    }
}

fn audit_for_outcome(plate: &str, outcome: &ReconcileOutcome, now: OffsetDateTime) -> AuditEntry {
    match outcome {
        ReconcileOutcome::Entered(session) => AuditEntry::new(
            AuditKind::Entry,
            format!("Vehicle entered: {plate}"),
            json!({ "plate": plate, "session_id": session.id, "confidence": session.confidence_score }),
            now,
        ),
        ReconcileOutcome::Refreshed(session) => AuditEntry::new(
            AuditKind::Entry,
            format!("Entry refreshed: {plate}"),
            json!({ "plate": plate, "session_id": session.id, "confidence": session.confidence_score }),
            now,
        ),
        ReconcileOutcome::Closed {
            session,
            fare,
            rate_name,
        } => AuditEntry::new(
            AuditKind::Exit,
            format!("Vehicle exited: {plate}, fare {}", fare.display_amount()),
            json!({
                "plate": plate,
                "session_id": session.id,
                "duration_hours": fare.duration_hours,
                "fare_amount": round_cents(fare.fare_amount),
                "hourly_rate": fare.hourly_rate,
                "rate_name": rate_name,
                "within_grace": fare.within_grace,
            }),
            now,
        ),
        ReconcileOutcome::OrphanExit(session) => AuditEntry::new(
            AuditKind::OrphanExit,
            format!("Exit without entry: {plate}"),
            json!({ "plate": plate, "session_id": session.id }),
            now,
        ),
        ReconcileOutcome::AlreadyClosed { .. } => AuditEntry::new(
            AuditKind::Detection,
            format!("Duplicate exit sighting ignored: {plate}"),
            json!({ "plate": plate }),
            now,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fare::RatePolicy;
    use crate::fare::rates::RateSource;
    use crate::session::memory::MemoryStore;
    use crate::session::{SessionId, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use time::Duration;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2025-03-01 08:00 UTC);
    const TOLERANCE: f64 = 1e-6;

    fn detection(plate: &str, role: CameraRole) -> Detection {
        Detection {
            plate: plate.to_string(),
            confidence: 97.0,
            role,
            image_ref: None,
        }
    }

    fn reconciler_with(store: Arc<MemoryStore>) -> Reconciler {
        Reconciler::new(
            store.clone(),
            RateProvider::new(store),
            AuditLog::disabled(),
            CameraLocations::default(),
        )
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let policy = RatePolicy::new("standard", 10.0, 5.0, 15, T0 - Duration::days(30))
            .expect("valid policy");
        store.insert_rate(policy).expect("seed rate");
        store
    }

    #[test]
    fn entry_then_exit_within_grace_is_free() -> Result<(), ReconcileError> {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());

        reconciler.reconcile_at(&detection("abc123", CameraRole::Entry), T0)?;
        let outcome = reconciler.reconcile_at(
            &detection("ABC123", CameraRole::Exit),
            T0 + Duration::minutes(10),
        )?;

        let ReconcileOutcome::Closed { session, fare, .. } = outcome else {
            panic!("expected closed outcome, got {outcome:?}");
        };
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.fare_amount, Some(0.0));
        assert_eq!(fare.duration_minutes, 10);
        assert_eq!(session.hourly_rate, Some(10.0));
        Ok(())
    }

    #[test]
    fn exit_after_forty_minutes_bills_time_fare() -> Result<(), ReconcileError> {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());

        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;
        let outcome = reconciler.reconcile_at(
            &detection("ABC123", CameraRole::Exit),
            T0 + Duration::minutes(40),
        )?;

        let session = outcome.session().cloned().expect("session written");
        let duration = session.duration_hours.expect("duration set");
        let fare = session.fare_amount.expect("fare set");
        assert!((duration - 40.0 / 60.0).abs() < TOLERANCE);
        assert!((fare - 40.0 / 60.0 * 10.0).abs() < TOLERANCE);
        assert_eq!(format!("{:.2}", fare), "6.67");
        let entry = session.entry_time.expect("entry set");
        let exit = session.exit_time.expect("exit set");
        assert!(exit >= entry);
        Ok(())
    }

    #[test]
    fn exit_without_open_session_is_orphan() -> Result<(), ReconcileError> {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());

        let outcome = reconciler.reconcile_at(&detection("ZZZ999", CameraRole::Exit), T0)?;

        let ReconcileOutcome::OrphanExit(session) = outcome else {
            panic!("expected orphan exit");
        };
        assert_eq!(session.status, SessionStatus::ExitWithoutEntry);
        assert_eq!(session.exit_time, Some(T0));
        assert_eq!(session.entry_time, None);
        assert_eq!(session.fare_amount, None);
        assert_eq!(session.duration_hours, None);
        assert_eq!(session.camera_location, DEFAULT_EXIT_LOCATION);
        assert_eq!(store.session_count(), 1);
        Ok(())
    }

    #[test]
    fn repeated_entry_refreshes_single_session() -> Result<(), ReconcileError> {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());
        let second_time = T0 + Duration::minutes(1);

        let first = reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;
        let second = reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), second_time)?;

        assert!(matches!(first, ReconcileOutcome::Entered(_)));
        let ReconcileOutcome::Refreshed(session) = second else {
            panic!("expected refresh");
        };
        assert_eq!(session.entry_time, Some(second_time));
        assert_eq!(store.session_count(), 1);
        let open = store.open_sessions("ABC123").expect("query open");
        assert_eq!(open.len(), 1);
        Ok(())
    }

    #[test]
    fn exit_after_close_starts_fresh_orphan() -> Result<(), ReconcileError> {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());

        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;
        reconciler.reconcile_at(&detection("ABC123", CameraRole::Exit), T0 + Duration::hours(2))?;
        let again = reconciler.reconcile_at(&detection("ABC123", CameraRole::Exit), T0 + Duration::hours(3))?;

        assert!(matches!(again, ReconcileOutcome::OrphanExit(_)));
        assert_eq!(store.session_count(), 2);
        Ok(())
    }

    #[test]
    fn blank_plate_is_rejected_before_store_access() {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());

        let result = reconciler.reconcile_at(&detection("   ", CameraRole::Entry), T0);

        assert!(matches!(result, Err(ReconcileError::InvalidPlate(_))));
        assert!(result.as_ref().err().is_some_and(ReconcileError::is_input_error));
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());
        let mut bad = detection("ABC123", CameraRole::Entry);
        bad.confidence = 120.0;

        let result = reconciler.reconcile_at(&bad, T0);

        assert!(matches!(result, Err(ReconcileError::InvalidConfidence(..))));
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn clock_skew_leaves_session_open() -> Result<(), ReconcileError> {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());

        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;
        let result = reconciler.reconcile_at(
            &detection("ABC123", CameraRole::Exit),
            T0 - Duration::minutes(5),
        );

        let Err(err) = result else {
            panic!("expected calculation error");
        };
        assert!(matches!(err, ReconcileError::Calculation { .. }));
        assert!(err.to_string().contains("ABC123"));
        assert!(err.to_string().contains("fare"));
        let open = store.open_sessions("ABC123").expect("query open");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].fare_amount, None);

        let retry = reconciler.reconcile_at(
            &detection("ABC123", CameraRole::Exit),
            T0 + Duration::minutes(30),
        )?;
        assert!(matches!(retry, ReconcileOutcome::Closed { .. }));
        Ok(())
    }

    #[test]
    fn missing_rate_policy_uses_default() -> Result<(), ReconcileError> {
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler_with(store.clone());

        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;
        let outcome = reconciler.reconcile_at(
            &detection("ABC123", CameraRole::Exit),
            T0 + Duration::minutes(20),
        )?;

        let ReconcileOutcome::Closed { session, rate_name, .. } = outcome else {
            panic!("expected close");
        };
        assert_eq!(rate_name, "default");
        assert_eq!(session.fare_amount, Some(5.0));
        Ok(())
    }

    #[test]
    fn latest_entry_wins_among_duplicates() {
        let older = SessionRecord {
            id: Uuid::new_v4(),
            plate_number: "ABC123".to_string(),
            confidence_score: 96.0,
            camera_role: CameraRole::Entry,
            camera_location: DEFAULT_ENTRY_LOCATION.to_string(),
            detected_at: T0,
            entry_time: Some(T0),
            exit_time: None,
            duration_hours: None,
            fare_amount: None,
            hourly_rate: None,
            status: SessionStatus::Entered,
            image_ref: None,
        };
        let mut newer = older.clone();
        newer.id = Uuid::new_v4();
        newer.entry_time = Some(T0 + Duration::minutes(3));

        let selected = select_latest_open(vec![older, newer.clone()]);

        assert_eq!(selected.map(|s| s.id), Some(newer.id));
    }

    #[test]
    fn rate_changes_do_not_alter_closed_fares() -> Result<(), Box<dyn std::error::Error>> {
        let store = seeded_store();
        let reconciler = reconciler_with(store.clone());

        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;
        let closed = reconciler.reconcile_at(
            &detection("ABC123", CameraRole::Exit),
            T0 + Duration::hours(1),
        )?;
        store.insert_rate(RatePolicy::new("surge", 50.0, 20.0, 0, T0 + Duration::days(1))?)?;

        let id = closed.session().map(|s| s.id).ok_or("missing session")?;
        let reread = store.get(id)?.ok_or("missing record")?;
        assert_eq!(reread.hourly_rate, Some(10.0));
        assert_eq!(reread.fare_amount, Some(10.0));
        Ok(())
    }

    /// Store whose writes can be switched off, and which can let a
    /// competing exit close the session just before ours.
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
        lose_close_race: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_writes: AtomicBool::new(false),
                lose_close_race: AtomicBool::new(false),
            }
        }
    }

    impl SessionStore for FlakyStore {
        fn open_sessions(&self, plate: &str) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner.open_sessions(plate)
        }

        fn insert(&self, record: SessionRecord) -> Result<SessionRecord, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            self.inner.insert(record)
        }

        fn insert_open(
            &self,
            record: SessionRecord,
        ) -> Result<Option<SessionRecord>, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            self.inner.insert_open(record)
        }

        fn update(
            &self,
            id: SessionId,
            patch: SessionPatch,
        ) -> Result<Option<SessionRecord>, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            if self.lose_close_race.load(Ordering::SeqCst) {
                // another exit lands first
                self.inner.update(id, patch)?;
                return Ok(None);
            }
            self.inner.update(id, patch)
        }

        fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.get(id)
        }

        fn list_recent(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner.list_recent(limit)
        }
    }

    fn flaky_reconciler(store: Arc<FlakyStore>) -> Reconciler {
        Reconciler::new(
            store,
            RateProvider::new(Arc::new(MemoryStore::new())),
            AuditLog::disabled(),
            CameraLocations::default(),
        )
    }

    #[test]
    fn store_write_failure_is_surfaced_with_plate_and_stage() {
        let store = Arc::new(FlakyStore::new());
        store.fail_writes.store(true, Ordering::SeqCst);
        let reconciler = flaky_reconciler(store);

        let result = reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0);

        let Err(err) = result else {
            panic!("expected store error");
        };
        assert!(matches!(
            err,
            ReconcileError::Store {
                stage: Stage::Entry,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "session store failed for plate ABC123 at entry stage: store unavailable: disk full"
        );
    }

    #[test]
    fn lost_close_race_writes_nothing() -> Result<(), ReconcileError> {
        let store = Arc::new(FlakyStore::new());
        let reconciler = flaky_reconciler(store.clone());
        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;
        store.lose_close_race.store(true, Ordering::SeqCst);

        let outcome = reconciler.reconcile_at(
            &detection("ABC123", CameraRole::Exit),
            T0 + Duration::minutes(30),
        )?;

        assert!(matches!(outcome, ReconcileOutcome::AlreadyClosed { .. }));
        assert_eq!(store.inner.session_count(), 1);
        Ok(())
    }

    #[test]
    fn concurrent_exits_close_once() -> Result<(), ReconcileError> {
        let store = seeded_store();
        let reconciler = Arc::new(reconciler_with(store.clone()));
        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = Arc::clone(&reconciler);
                std::thread::spawn(move || {
                    reconciler.reconcile_at(
                        &detection("ABC123", CameraRole::Exit),
                        T0 + Duration::minutes(45),
                    )
                })
            })
            .collect();

        let mut closed = 0;
        for handle in handles {
            let outcome = handle.join().expect("exit thread")?;
            if matches!(outcome, ReconcileOutcome::Closed { .. }) {
                closed += 1;
            }
        }

        assert_eq!(closed, 1);
        let completed = store
            .list_recent(100)
            .expect("list")
            .into_iter()
            .filter(|s| s.status == SessionStatus::Completed)
            .count();
        assert_eq!(completed, 1);
        Ok(())
    }

    #[test]
    fn outcomes_are_audited() -> Result<(), ReconcileError> {
        let store = seeded_store();
        let (audit, worker) = AuditLog::spawn(store.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            RateProvider::new(store.clone()),
            audit,
            CameraLocations::default(),
        );

        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;
        reconciler.reconcile_at(&detection("ABC123", CameraRole::Exit), T0 + Duration::hours(1))?;
        reconciler.reconcile_at(&detection("QRS456", CameraRole::Exit), T0 + Duration::hours(1))?;
        drop(reconciler);
        worker.join().expect("audit worker joins");

        let kinds: Vec<AuditKind> = store.audit_entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![AuditKind::Entry, AuditKind::Exit, AuditKind::OrphanExit]
        );
        Ok(())
    }

    /// Delegating store that pauses after reading open sessions, widening the
    /// window between the read and the write.
    struct SlowReadStore {
        inner: MemoryStore,
        read_delay: std::time::Duration,
    }

    impl SessionStore for SlowReadStore {
        fn open_sessions(&self, plate: &str) -> Result<Vec<SessionRecord>, StoreError> {
            let open = self.inner.open_sessions(plate)?;
            std::thread::sleep(self.read_delay);
            Ok(open)
        }

        fn insert(&self, record: SessionRecord) -> Result<SessionRecord, StoreError> {
            self.inner.insert(record)
        }

        fn insert_open(
            &self,
            record: SessionRecord,
        ) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.insert_open(record)
        }

        fn update(
            &self,
            id: SessionId,
            patch: SessionPatch,
        ) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.update(id, patch)
        }

        fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.get(id)
        }

        fn list_recent(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner.list_recent(limit)
        }
    }

    #[test]
    fn concurrent_entries_open_one_session() -> Result<(), ReconcileError> {
        let store = Arc::new(SlowReadStore {
            inner: MemoryStore::new(),
            read_delay: std::time::Duration::from_millis(20),
        });
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            RateProvider::new(Arc::new(MemoryStore::new())),
            AuditLog::disabled(),
            CameraLocations::default(),
        ));
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|offset| {
                let reconciler = Arc::clone(&reconciler);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    reconciler.reconcile_at(
                        &detection("ABC123", CameraRole::Entry),
                        T0 + Duration::seconds(offset),
                    )
                })
            })
            .collect();

        let mut labels = Vec::new();
        for handle in handles {
            labels.push(handle.join().expect("entry thread")?.label());
        }
        labels.sort_unstable();

        assert_eq!(labels, vec!["entered", "refreshed"]);
        let open = store.inner.open_sessions("ABC123").expect("query open");
        assert_eq!(open.len(), 1);
        assert_eq!(store.inner.session_count(), 1);
        Ok(())
    }

    /// Store that slips a repeat entry sighting in between the exit's read
    /// and its close.
    struct RefreshBeforeCloseStore {
        inner: MemoryStore,
        refreshed_to: OffsetDateTime,
        fired: AtomicBool,
    }

    impl SessionStore for RefreshBeforeCloseStore {
        fn open_sessions(&self, plate: &str) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner.open_sessions(plate)
        }

        fn insert(&self, record: SessionRecord) -> Result<SessionRecord, StoreError> {
            self.inner.insert(record)
        }

        fn insert_open(
            &self,
            record: SessionRecord,
        ) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.insert_open(record)
        }

        fn update(
            &self,
            id: SessionId,
            patch: SessionPatch,
        ) -> Result<Option<SessionRecord>, StoreError> {
            if matches!(patch, SessionPatch::Close(_)) && !self.fired.swap(true, Ordering::SeqCst) {
                self.inner.update(
                    id,
                    SessionPatch::RefreshEntry(EntryRefresh {
                        entry_time: self.refreshed_to,
                        confidence_score: 99.0,
                        camera_location: DEFAULT_ENTRY_LOCATION.to_string(),
                        image_ref: None,
                    }),
                )?;
            }
            self.inner.update(id, patch)
        }

        fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.get(id)
        }

        fn list_recent(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner.list_recent(limit)
        }
    }

    #[test]
    fn exit_bills_from_entry_refreshed_during_close() -> Result<(), ReconcileError> {
        let refreshed_to = T0 + Duration::minutes(60);
        let store = Arc::new(RefreshBeforeCloseStore {
            inner: MemoryStore::new(),
            refreshed_to,
            fired: AtomicBool::new(false),
        });
        let reconciler = Reconciler::new(
            store.clone(),
            RateProvider::new(Arc::new(MemoryStore::new())),
            AuditLog::disabled(),
            CameraLocations::default(),
        );
        reconciler.reconcile_at(&detection("ABC123", CameraRole::Entry), T0)?;

        let outcome = reconciler.reconcile_at(
            &detection("ABC123", CameraRole::Exit),
            T0 + Duration::minutes(90),
        )?;

        let ReconcileOutcome::Closed { session, fare, .. } = outcome else {
            panic!("expected close, got {outcome:?}");
        };
        assert_eq!(session.entry_time, Some(refreshed_to));
        assert_eq!(fare.duration_minutes, 30);
        assert_eq!(session.fare_amount, Some(5.0));
        Ok(())
    }
}
