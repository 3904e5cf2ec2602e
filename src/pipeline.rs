use crate::error::AppError;
use crate::reconcile::{Detection, ReconcileError, ReconcileOutcome, Reconciler};
use crate::recognition::{ConfidenceGate, PlateRecognizer};
use crate::session::CameraRole;
use crate::state::AppState;
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const DEFAULT_MIN_CAPTURE_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_RECENT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub gate: ConfidenceGate,
    pub min_capture_interval: Duration,
    pub recent_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            gate: ConfidenceGate::default(),
            min_capture_interval: DEFAULT_MIN_CAPTURE_INTERVAL,
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// Frame arrived sooner than the minimum capture spacing for its camera.
    Throttled,
    NoPlate,
    /// Recognition failed; the frame is skipped.
    RecognitionFailed(String),
    /// Dropped before reconciliation. Nothing is written.
    LowConfidence { plate: String, confidence: f64 },
    Reconciled(ReconcileOutcome),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("plate recognition is not configured")]
    RecognizerUnavailable,
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    State(#[from] AppError),
}

/// Result of reading a frame, before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameReading {
    Detected(Detection),
    Finished(CaptureOutcome),
}

/// Content digest recorded as the image reference of an unnamed frame.
pub fn frame_digest(image: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(image)))
}

/// Capture flow: spacing, recognition, confidence gate, reconciliation, and
/// refresh of the recent-sessions cache.
pub struct DetectionPipeline {
    reconciler: Reconciler,
    recognizer: Option<Arc<dyn PlateRecognizer>>,
    state: Arc<RwLock<AppState>>,
    settings: PipelineSettings,
}

impl DetectionPipeline {
    pub fn new(
        reconciler: Reconciler,
        recognizer: Option<Arc<dyn PlateRecognizer>>,
        state: Arc<RwLock<AppState>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            reconciler,
            recognizer,
            state,
            settings,
        }
    }

    pub fn state(&self) -> &Arc<RwLock<AppState>> {
        &self.state
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn has_recognizer(&self) -> bool {
        self.recognizer.is_some()
    }

    /// Run one captured frame through recognition and reconciliation.
    ///
    /// `image_ref` names where the frame is kept; without one the frame's
    /// content digest is recorded.
    pub async fn process_frame(
        &self,
        image: &[u8],
        role: CameraRole,
        image_ref: Option<String>,
    ) -> Result<CaptureOutcome, PipelineError> {
        self.process_frame_at(image, role, image_ref, Instant::now()).await
    }

    pub async fn process_frame_at(
        &self,
        image: &[u8],
        role: CameraRole,
        image_ref: Option<String>,
        captured: Instant,
    ) -> Result<CaptureOutcome, PipelineError> {
        match self.read_frame_at(image, role, image_ref, captured).await? {
            FrameReading::Detected(detection) => self.submit(detection),
            FrameReading::Finished(outcome) => Ok(outcome),
        }
    }

    /// Spacing and recognition only. Nothing is written to the store.
    pub async fn read_frame_at(
        &self,
        image: &[u8],
        role: CameraRole,
        image_ref: Option<String>,
        captured: Instant,
    ) -> Result<FrameReading, PipelineError> {
        let recognizer = self
            .recognizer
            .as_ref()
            .ok_or(PipelineError::RecognizerUnavailable)?;

        let admitted = {
            let mut guard = self.state.write().map_err(|_| AppError::StateLock)?;
            guard.try_begin_capture(role, captured, self.settings.min_capture_interval)
        };
        if !admitted {
            debug!(role = %role, "Capture throttled");
            return Ok(FrameReading::Finished(CaptureOutcome::Throttled));
        }

        let reading = match recognizer.recognize(image).await {
            Ok(Some(reading)) => reading,
            Ok(None) => {
                debug!(role = %role, "No plate in frame");
                return Ok(FrameReading::Finished(CaptureOutcome::NoPlate));
            }
            Err(err) => {
                warn!(role = %role, error = %err, "Plate recognition failed, skipping frame");
                return Ok(FrameReading::Finished(CaptureOutcome::RecognitionFailed(
                    err.to_string(),
                )));
            }
        };

        Ok(FrameReading::Detected(Detection {
            plate: reading.plate,
            confidence: reading.confidence,
            role,
            image_ref: Some(image_ref.unwrap_or_else(|| frame_digest(image))),
        }))
    }

    /// Gate and reconcile a detection that already carries a plate.
    pub fn submit(&self, detection: Detection) -> Result<CaptureOutcome, PipelineError> {
        self.submit_at(detection, OffsetDateTime::now_utc())
    }

    pub fn submit_at(
        &self,
        detection: Detection,
        now: OffsetDateTime,
    ) -> Result<CaptureOutcome, PipelineError> {
        if !self.settings.gate.accepts(detection.confidence) {
            info!(
                plate = %detection.plate,
                confidence = detection.confidence,
                threshold = self.settings.gate.min_confidence(),
                "Low-confidence detection dropped"
            );
            return Ok(CaptureOutcome::LowConfidence {
                plate: detection.plate,
                confidence: detection.confidence,
            });
        }

        let outcome = self.reconciler.reconcile_at(&detection, now)?;
        if let Err(err) = self.refresh_recent() {
            warn!(error = %err, "Failed to refresh recent sessions cache");
        }
        Ok(CaptureOutcome::Reconciled(outcome))
    }

    /// Reload the recent-sessions cache from the store.
    pub fn refresh_recent(&self) -> Result<usize, AppError> {
        let sessions = self
            .reconciler
            .store()
            .list_recent(self.settings.recent_limit)?;
        let count = sessions.len();
        let mut guard = self.state.write().map_err(|_| AppError::StateLock)?;
        guard.set_recent(sessions, OffsetDateTime::now_utc())?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::fare::rates::RateProvider;
    use crate::reconcile::CameraLocations;
    use crate::recognition::mock::{MockRecognition, MockRecognizer};
    use crate::session::{SessionStatus, SessionStore};
    use crate::session::memory::MemoryStore;

    fn pipeline(
        store: Arc<MemoryStore>,
        recognizer: Option<Arc<dyn PlateRecognizer>>,
    ) -> DetectionPipeline {
        let reconciler = Reconciler::new(
            store.clone(),
            RateProvider::new(store),
            AuditLog::disabled(),
            CameraLocations::default(),
        );
        DetectionPipeline::new(
            reconciler,
            recognizer,
            Arc::new(RwLock::new(AppState::new())),
            PipelineSettings::default(),
        )
    }

    fn detection(plate: &str, confidence: f64, role: CameraRole) -> Detection {
        Detection {
            plate: plate.to_string(),
            confidence,
            role,
            image_ref: None,
        }
    }

    #[test]
    fn low_confidence_detection_is_dropped_without_writes() -> Result<(), PipelineError> {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone(), None);

        let outcome = pipeline.submit(detection("ABC123", 80.0, CameraRole::Entry))?;

        assert_eq!(
            outcome,
            CaptureOutcome::LowConfidence {
                plate: "ABC123".to_string(),
                confidence: 80.0,
            }
        );
        assert_eq!(store.session_count(), 0);
        Ok(())
    }

    #[test]
    fn accepted_detection_refreshes_cache() -> Result<(), PipelineError> {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone(), None);

        pipeline.submit(detection("abc123", 97.0, CameraRole::Entry))?;

        let guard = pipeline.state().read().map_err(|_| AppError::StateLock)?;
        assert_eq!(guard.recent().len(), 1);
        assert_eq!(guard.recent()[0].plate_number, "ABC123");
        assert_eq!(guard.recent()[0].status, SessionStatus::Entered);
        Ok(())
    }

    #[tokio::test]
    async fn frames_require_a_recognizer() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()), None);

        let result = pipeline.process_frame(b"frame", CameraRole::Entry, None).await;

        assert!(matches!(result, Err(PipelineError::RecognizerUnavailable)));
    }

    #[tokio::test]
    async fn recognition_failure_skips_frame() -> Result<(), PipelineError> {
        let store = Arc::new(MemoryStore::new());
        let recognizer = Arc::new(MockRecognizer::new(vec![MockRecognition::Fail]));
        let pipeline = pipeline(store.clone(), Some(recognizer));

        let outcome = pipeline.process_frame(b"frame", CameraRole::Entry, None).await?;

        assert!(matches!(outcome, CaptureOutcome::RecognitionFailed(_)));
        assert_eq!(store.session_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn frames_closer_than_spacing_are_throttled() -> Result<(), PipelineError> {
        let store = Arc::new(MemoryStore::new());
        let recognizer = Arc::new(MockRecognizer::new(vec![
            MockRecognition::NoPlate,
            MockRecognition::plate("ABC123", 99.0),
        ]));
        let pipeline = pipeline(store.clone(), Some(recognizer.clone()));
        let start = Instant::now();

        let first = pipeline.process_frame_at(b"f1", CameraRole::Entry, None, start).await?;
        let second = pipeline
            .process_frame_at(b"f2", CameraRole::Entry, None, start + Duration::from_millis(100))
            .await?;

        assert_eq!(first, CaptureOutcome::NoPlate);
        assert_eq!(second, CaptureOutcome::Throttled);
        assert_eq!(recognizer.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn recognized_frame_carries_its_image_reference() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let recognizer = Arc::new(MockRecognizer::new(vec![
            MockRecognition::plate("ABC123", 99.0),
            MockRecognition::plate("XYZ789", 99.0),
        ]));
        let pipeline = pipeline(store.clone(), Some(recognizer));
        let start = Instant::now();

        pipeline
            .process_frame_at(b"entry-frame", CameraRole::Entry, None, start)
            .await?;
        pipeline
            .process_frame_at(
                b"exit-frame",
                CameraRole::Exit,
                Some("gate-2/0042.jpg".to_string()),
                start,
            )
            .await?;

        let entered = store.open_sessions("ABC123")?;
        assert_eq!(
            entered[0].image_ref.as_deref(),
            Some(frame_digest(b"entry-frame").as_str())
        );
        let recent = store.list_recent(10)?;
        let exit = recent
            .iter()
            .find(|s| s.plate_number == "XYZ789")
            .ok_or("orphan exit missing")?;
        assert_eq!(exit.image_ref.as_deref(), Some("gate-2/0042.jpg"));
        Ok(())
    }

    #[test]
    fn frame_digest_is_stable_hex() {
        assert_eq!(
            frame_digest(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
