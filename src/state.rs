use crate::error::AppError;
use crate::fare::round_cents;
use crate::session::{CameraRole, SessionRecord, SessionStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::watch;

/// Aggregate figures over the cached recent sessions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionStats {
    pub total_detections: usize,
    pub today_detections: usize,
    pub average_confidence: u32,
    pub open_sessions: usize,
    pub completed_revenue: f64,
}

/// Shared service state.
///
/// `recent` is a read-through cache of the session store. It is only ever
/// replaced wholesale from a fresh store read, never edited in place.
#[derive(Debug)]
pub struct AppState {
    recent: Vec<SessionRecord>,
    recent_tx: watch::Sender<Vec<SessionRecord>>,
    refreshed_at: Option<OffsetDateTime>,
    last_capture: HashMap<CameraRole, Instant>,
}

impl AppState {
    pub fn new() -> Self {
        let (recent_tx, _recent_rx) = watch::channel(Vec::new());
        Self {
            recent: Vec::new(),
            recent_tx,
            refreshed_at: None,
            last_capture: HashMap::new(),
        }
    }

    pub fn recent(&self) -> &[SessionRecord] {
        &self.recent
    }

    pub fn refreshed_at(&self) -> Option<OffsetDateTime> {
        self.refreshed_at
    }

    pub fn subscribe_recent(&self) -> watch::Receiver<Vec<SessionRecord>> {
        self.recent_tx.subscribe()
    }

    pub fn set_recent(
        &mut self,
        sessions: Vec<SessionRecord>,
        refreshed_at: OffsetDateTime,
    ) -> Result<(), AppError> {
        self.recent = sessions.clone();
        self.refreshed_at = Some(refreshed_at);
        if self.recent_tx.receiver_count() == 0 {
            return Ok(());
        }
        self.recent_tx
            .send(sessions)
            .map_err(|_| AppError::WatchSend)
    }

    /// Claim a capture slot for a camera. Returns `false` when the previous
    /// capture on that camera was less than `min_interval` ago.
    pub fn try_begin_capture(
        &mut self,
        role: CameraRole,
        now: Instant,
        min_interval: Duration,
    ) -> bool {
        if let Some(last) = self.last_capture.get(&role)
            && now.saturating_duration_since(*last) < min_interval
        {
            return false;
        }
        self.last_capture.insert(role, now);
        true
    }

    pub fn stats(&self, now: OffsetDateTime) -> DetectionStats {
        let today = now.date();
        let total_detections = self.recent.len();
        let today_detections = self
            .recent
            .iter()
            .filter(|session| session.detected_at.date() == today)
            .count();
        let average_confidence = if total_detections == 0 {
            0
        } else {
            let sum: f64 = self.recent.iter().map(|s| s.confidence_score).sum();
            (sum / total_detections as f64).round() as u32
        };
        let open_sessions = self.recent.iter().filter(|s| s.is_open()).count();
        let completed_revenue = round_cents(
            self.recent
                .iter()
                .filter(|s| s.status == SessionStatus::Completed)
                .filter_map(|s| s.fare_amount)
                .sum(),
        );

        DetectionStats {
            total_detections,
            today_detections,
            average_confidence,
            open_sessions,
            completed_revenue,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
