//! Plate recognition boundary.
//!
//! The recognizer is an opaque external service. Its results are untrusted:
//! readings below the configured confidence threshold are discarded before
//! they reach reconciliation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub mod mock;
pub mod remote;

pub const DEFAULT_MIN_CONFIDENCE_PERCENT: f64 = 95.0;

/// A plate read from a frame, with confidence as a percentage in [0, 100].
#[derive(Debug, Clone, PartialEq)]
pub struct PlateReading {
    pub plate: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("recognition service rejected the API token")]
    Unauthorized,
    #[error("recognition service rate limit exceeded")]
    RateLimited,
    #[error("recognition service returned http {0}: {1}")]
    Http(u16, String),
    #[error("recognition request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("recognition service unavailable: {0}")]
    Unavailable(String),
}

pub type RecognitionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<PlateReading>, RecognitionError>> + Send + 'a>>;

pub trait PlateRecognizer: Send + Sync {
    /// Read the most likely plate in an encoded image, if any.
    fn recognize<'a>(&'a self, image: &'a [u8]) -> RecognitionFuture<'a>;
}

/// Acceptance threshold applied to recognizer output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceGate {
    min_confidence: f64,
}

impl ConfidenceGate {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence: min_confidence.clamp(0.0, 100.0),
        }
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn accepts(&self, confidence: f64) -> bool {
        confidence.is_finite() && confidence >= self.min_confidence
    }
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CONFIDENCE_PERCENT)
    }
}

/// Decode a `data:image/<type>;base64,<payload>` frame into raw bytes.
pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>, RecognitionError> {
    let rest = data_url
        .strip_prefix("data:image/")
        .ok_or_else(|| RecognitionError::InvalidImage("missing data:image/ prefix".to_string()))?;
    let (_media, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| RecognitionError::InvalidImage("missing base64 marker".to_string()))?;
    if payload.is_empty() {
        return Err(RecognitionError::InvalidImage("empty image data".to_string()));
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|err| RecognitionError::InvalidImage(format!("base64 decode failed: {err}")))?;
    if bytes.is_empty() {
        return Err(RecognitionError::InvalidImage("empty image data".to_string()));
    }
    Ok(bytes)
}
