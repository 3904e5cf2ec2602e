use crate::fare::RatePolicy;
use crate::session::SessionRecord;
use crate::state::DetectionStats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthSuccessResponse {
    pub status: HealthStatus,
    pub recognizer_configured: bool,
    pub cached_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_refreshed_at: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionsSuccessResponse {
    pub sessions: Vec<SessionRecord>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct StatsSuccessResponse {
    #[serde(flatten)]
    pub stats: DetectionStats,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RateSuccessResponse {
    pub rate: RatePolicy,
    pub is_default: bool,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRateRequest {
    pub name: String,
    pub hourly_rate: f64,
    pub minimum_charge: f64,
    pub grace_period_minutes: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct DetectionRequest {
    pub plate: String,
    pub confidence: f64,
    pub camera_role: String,
    #[serde(default)]
    pub image_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FrameRequest {
    pub camera_role: String,
    /// `data:image/<type>;base64,<payload>`
    pub image: String,
    /// Where the caller keeps the frame. Defaults to the frame digest.
    #[serde(default)]
    pub image_ref: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FareSummary {
    pub duration_minutes: i64,
    pub duration_hours: f64,
    pub fare_amount: f64,
    pub display_amount: String,
    pub hourly_rate: f64,
    pub within_grace: bool,
    pub rate_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DetectionSuccessResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fare: Option<FareSummary>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    CalculationError,
    StorageError,
    RecognitionUnavailable,
    Throttled,
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_response_uses_screaming_snake_case_code() {
        let response = ErrorResponse {
            error_code: ErrorCode::RecognitionUnavailable,
            error_message: "plate recognition is not configured".to_string(),
            timestamp: "2026-01-11T12:32:00Z".to_string(),
        };

        let value = serde_json::to_value(response).expect("serialize error response");
        assert_eq!(
            value,
            json!({
                "error_code": "RECOGNITION_UNAVAILABLE",
                "error_message": "plate recognition is not configured",
                "timestamp": "2026-01-11T12:32:00Z"
            })
        );
    }

    #[test]
    fn stats_response_is_flattened() {
        let response = StatsSuccessResponse {
            stats: DetectionStats {
                total_detections: 3,
                today_detections: 1,
                average_confidence: 97,
                open_sessions: 1,
                completed_revenue: 12.5,
            },
            timestamp: "2026-01-11T12:33:00Z".to_string(),
        };

        let value = serde_json::to_value(response).expect("serialize stats response");
        assert_eq!(
            value,
            json!({
                "total_detections": 3,
                "today_detections": 1,
                "average_confidence": 97,
                "open_sessions": 1,
                "completed_revenue": 12.5,
                "timestamp": "2026-01-11T12:33:00Z"
            })
        );
    }

    #[test]
    fn dropped_detection_omits_session_and_fare() {
        let response = DetectionSuccessResponse {
            outcome: "low_confidence",
            plate: Some("ABC123".to_string()),
            confidence: Some(80.0),
            session: None,
            fare: None,
            timestamp: "2026-01-11T12:34:00Z".to_string(),
        };

        let value = serde_json::to_value(response).expect("serialize detection response");
        assert_eq!(
            value,
            json!({
                "outcome": "low_confidence",
                "plate": "ABC123",
                "confidence": 80.0,
                "timestamp": "2026-01-11T12:34:00Z"
            })
        );
    }

    #[test]
    fn create_rate_request_defaults_to_active() {
        let request: CreateRateRequest = serde_json::from_value(json!({
            "name": "evening",
            "hourly_rate": 6.0,
            "minimum_charge": 3.0,
            "grace_period_minutes": 20
        }))
        .expect("deserialize rate request");

        assert!(request.is_active);
        assert_eq!(request.grace_period_minutes, 20);
    }
}
