use crate::api::responses::{
    CreateRateRequest, DetectionRequest, DetectionSuccessResponse, ErrorCode, ErrorResponse,
    FareSummary, FrameRequest, HealthStatus, HealthSuccessResponse, RateSuccessResponse,
    SessionsSuccessResponse, StatsSuccessResponse,
};
use crate::fare::RatePolicy;
use crate::pipeline::{CaptureOutcome, DetectionPipeline, FrameReading, PipelineError};
use crate::reconcile::{Detection, ReconcileError, ReconcileOutcome};
use crate::recognition::decode_data_url;
use crate::session::CameraRole;
use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, warn};

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";
pub const MAX_SESSIONS_LIMIT: usize = 1000;

pub type SharedPipeline = Arc<DetectionPipeline>;

pub enum ApiResponse<T> {
    Success { status: StatusCode, body: T },
    Error {
        status: StatusCode,
        body: ErrorResponse,
    },
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Success { status, body } => (status, Json(body)).into_response(),
            ApiResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub limit: Option<usize>,
}

pub async fn get_health(State(pipeline): State<SharedPipeline>) -> impl IntoResponse {
    build_health_response(&pipeline, OffsetDateTime::now_utc())
}

pub async fn get_sessions(
    State(pipeline): State<SharedPipeline>,
    query: Result<Query<SessionsQuery>, QueryRejection>,
) -> impl IntoResponse {
    let now = OffsetDateTime::now_utc();
    match query {
        Ok(Query(query)) => {
            run_blocking(pipeline, "/api/sessions", now, move |pipeline| {
                build_sessions_response(pipeline, query.limit, now)
            })
            .await
        }
        Err(rejection) => invalid_input(rejection.body_text(), now),
    }
}

pub async fn get_stats(State(pipeline): State<SharedPipeline>) -> impl IntoResponse {
    build_stats_response(&pipeline, OffsetDateTime::now_utc())
}

pub async fn get_rate(State(pipeline): State<SharedPipeline>) -> impl IntoResponse {
    let now = OffsetDateTime::now_utc();
    run_blocking(pipeline, "/api/rate", now, move |pipeline| {
        build_rate_response(pipeline, now)
    })
    .await
}

pub async fn post_rate(
    State(pipeline): State<SharedPipeline>,
    payload: Result<Json<CreateRateRequest>, JsonRejection>,
) -> impl IntoResponse {
    let now = OffsetDateTime::now_utc();
    match payload {
        Ok(Json(request)) => {
            run_blocking(pipeline, "/api/rates", now, move |pipeline| {
                build_create_rate_response(pipeline, request, now)
            })
            .await
        }
        Err(rejection) => invalid_input(rejection.body_text(), now),
    }
}

pub async fn post_detection(
    State(pipeline): State<SharedPipeline>,
    payload: Result<Json<DetectionRequest>, JsonRejection>,
) -> impl IntoResponse {
    let now = OffsetDateTime::now_utc();
    match payload {
        Ok(Json(request)) => {
            run_blocking(pipeline, "/api/detections", now, move |pipeline| {
                build_detection_response(pipeline, request, now)
            })
            .await
        }
        Err(rejection) => invalid_input(rejection.body_text(), now),
    }
}

pub async fn post_frame(
    State(pipeline): State<SharedPipeline>,
    payload: Result<Json<FrameRequest>, JsonRejection>,
) -> impl IntoResponse {
    let now = OffsetDateTime::now_utc();
    match payload {
        Ok(Json(request)) => build_frame_response(pipeline, request, now).await,
        Err(rejection) => invalid_input(rejection.body_text(), now),
    }
}

/// Store calls block, so they run on the blocking pool instead of a runtime worker.
async fn run_blocking<T, F>(
    pipeline: SharedPipeline,
    route: &'static str,
    now: OffsetDateTime,
    work: F,
) -> ApiResponse<T>
where
    T: Send + 'static,
    F: FnOnce(&DetectionPipeline) -> ApiResponse<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || work(pipeline.as_ref())).await {
        Ok(response) => response,
        Err(err) => {
            error!(route = route, error = %err, "Blocking request task failed");
            internal_error(route, "blocking task failed", now)
        }
    }
}

fn build_health_response(
    pipeline: &DetectionPipeline,
    now: OffsetDateTime,
) -> ApiResponse<HealthSuccessResponse> {
    let guard = match pipeline.state().read() {
        Ok(guard) => guard,
        Err(_) => return internal_error("/api/health", "state lock poisoned", now),
    };
    let cached_sessions = guard.recent().len();
    let refreshed_at = guard.refreshed_at();
    drop(guard);

    let recognizer_configured = pipeline.has_recognizer();
    let status = if recognizer_configured && refreshed_at.is_some() {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };

    ApiResponse::Success {
        status: StatusCode::OK,
        body: HealthSuccessResponse {
            status,
            recognizer_configured,
            cached_sessions,
            cache_refreshed_at: refreshed_at.map(format_timestamp),
            timestamp: format_timestamp(now),
        },
    }
}

fn build_sessions_response(
    pipeline: &DetectionPipeline,
    limit: Option<usize>,
    now: OffsetDateTime,
) -> ApiResponse<SessionsSuccessResponse> {
    let cache_limit = pipeline.settings().recent_limit;
    let limit = limit.unwrap_or(cache_limit);
    if limit == 0 {
        return invalid_input("limit must be at least 1".to_string(), now);
    }
    let limit = limit.min(MAX_SESSIONS_LIMIT);

    if limit <= cache_limit {
        let guard = match pipeline.state().read() {
            Ok(guard) => guard,
            Err(_) => return internal_error("/api/sessions", "state lock poisoned", now),
        };
        if guard.refreshed_at().is_some() {
            let sessions = guard.recent().iter().take(limit).cloned().collect();
            return ApiResponse::Success {
                status: StatusCode::OK,
                body: SessionsSuccessResponse {
                    sessions,
                    timestamp: format_timestamp(now),
                },
            };
        }
    }

    match pipeline.reconciler().store().list_recent(limit) {
        Ok(sessions) => ApiResponse::Success {
            status: StatusCode::OK,
            body: SessionsSuccessResponse {
                sessions,
                timestamp: format_timestamp(now),
            },
        },
        Err(err) => {
            error!(error = %err, "Failed to list recent sessions");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::StorageError,
                err.to_string(),
                now,
            )
        }
    }
}

fn build_stats_response(
    pipeline: &DetectionPipeline,
    now: OffsetDateTime,
) -> ApiResponse<StatsSuccessResponse> {
    let stats = match pipeline.state().read() {
        Ok(guard) => guard.stats(now),
        Err(_) => return internal_error("/api/stats", "state lock poisoned", now),
    };

    ApiResponse::Success {
        status: StatusCode::OK,
        body: StatsSuccessResponse {
            stats,
            timestamp: format_timestamp(now),
        },
    }
}

fn build_rate_response(
    pipeline: &DetectionPipeline,
    now: OffsetDateTime,
) -> ApiResponse<RateSuccessResponse> {
    let rate = pipeline.reconciler().rates().active_rate();
    ApiResponse::Success {
        status: StatusCode::OK,
        body: RateSuccessResponse {
            is_default: rate.is_fallback(),
            rate,
            timestamp: format_timestamp(now),
        },
    }
}

fn build_create_rate_response(
    pipeline: &DetectionPipeline,
    request: CreateRateRequest,
    now: OffsetDateTime,
) -> ApiResponse<RateSuccessResponse> {
    let mut policy = match RatePolicy::new(
        request.name,
        request.hourly_rate,
        request.minimum_charge,
        request.grace_period_minutes,
        now,
    ) {
        Ok(policy) => policy,
        Err(err) => return invalid_input(err.to_string(), now),
    };
    policy.is_active = request.is_active;

    match pipeline.reconciler().rates().source().insert_rate(policy) {
        Ok(rate) => ApiResponse::Success {
            status: StatusCode::CREATED,
            body: RateSuccessResponse {
                is_default: false,
                rate,
                timestamp: format_timestamp(now),
            },
        },
        Err(err) => {
            error!(error = %err, "Failed to store rate policy");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::StorageError,
                err.to_string(),
                now,
            )
        }
    }
}

fn build_detection_response(
    pipeline: &DetectionPipeline,
    request: DetectionRequest,
    now: OffsetDateTime,
) -> ApiResponse<DetectionSuccessResponse> {
    let role = match request.camera_role.parse::<CameraRole>() {
        Ok(role) => role,
        Err(err) => return invalid_input(err.to_string(), now),
    };
    let detection = Detection {
        plate: request.plate,
        confidence: request.confidence,
        role,
        image_ref: request.image_ref,
    };
    capture_response(pipeline.submit_at(detection, now), now)
}

async fn build_frame_response(
    pipeline: SharedPipeline,
    request: FrameRequest,
    now: OffsetDateTime,
) -> ApiResponse<DetectionSuccessResponse> {
    let role = match request.camera_role.parse::<CameraRole>() {
        Ok(role) => role,
        Err(err) => return invalid_input(err.to_string(), now),
    };
    let image = match decode_data_url(&request.image) {
        Ok(image) => image,
        Err(err) => return invalid_input(err.to_string(), now),
    };

    let reading = pipeline
        .read_frame_at(&image, role, request.image_ref, Instant::now())
        .await;
    match reading {
        Ok(FrameReading::Detected(detection)) => {
            run_blocking(pipeline, "/api/frames", now, move |pipeline| {
                capture_response(pipeline.submit_at(detection, now), now)
            })
            .await
        }
        Ok(FrameReading::Finished(outcome)) => capture_response(Ok(outcome), now),
        Err(err) => pipeline_error_response(err, now),
    }
}

fn capture_response(
    result: Result<CaptureOutcome, PipelineError>,
    now: OffsetDateTime,
) -> ApiResponse<DetectionSuccessResponse> {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => return pipeline_error_response(err, now),
    };

    let timestamp = format_timestamp(now);
    match outcome {
        CaptureOutcome::Throttled => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Throttled,
            "capture attempted too soon after the previous one".to_string(),
            now,
        ),
        CaptureOutcome::RecognitionFailed(message) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RecognitionUnavailable,
            message,
            now,
        ),
        CaptureOutcome::NoPlate => ApiResponse::Success {
            status: StatusCode::OK,
            body: DetectionSuccessResponse {
                outcome: "no_plate",
                plate: None,
                confidence: None,
                session: None,
                fare: None,
                timestamp,
            },
        },
        CaptureOutcome::LowConfidence { plate, confidence } => ApiResponse::Success {
            status: StatusCode::OK,
            body: DetectionSuccessResponse {
                outcome: "low_confidence",
                plate: Some(plate),
                confidence: Some(confidence),
                session: None,
                fare: None,
                timestamp,
            },
        },
        CaptureOutcome::Reconciled(outcome) => reconciled_response(outcome, timestamp),
    }
}

fn reconciled_response(
    outcome: ReconcileOutcome,
    timestamp: String,
) -> ApiResponse<DetectionSuccessResponse> {
    let label = outcome.label();
    let status = match outcome {
        ReconcileOutcome::Entered(_) | ReconcileOutcome::OrphanExit(_) => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    let body = match outcome {
        ReconcileOutcome::Entered(session)
        | ReconcileOutcome::Refreshed(session)
        | ReconcileOutcome::OrphanExit(session) => DetectionSuccessResponse {
            outcome: label,
            plate: Some(session.plate_number.clone()),
            confidence: Some(session.confidence_score),
            session: Some(session),
            fare: None,
            timestamp,
        },
        ReconcileOutcome::Closed {
            session,
            fare,
            rate_name,
        } => DetectionSuccessResponse {
            outcome: label,
            plate: Some(session.plate_number.clone()),
            confidence: Some(session.confidence_score),
            session: Some(session),
            fare: Some(FareSummary {
                duration_minutes: fare.duration_minutes,
                duration_hours: fare.duration_hours,
                fare_amount: fare.fare_amount,
                display_amount: fare.display_amount(),
                hourly_rate: fare.hourly_rate,
                within_grace: fare.within_grace,
                rate_name,
            }),
            timestamp,
        },
        ReconcileOutcome::AlreadyClosed { plate } => DetectionSuccessResponse {
            outcome: label,
            plate: Some(plate),
            confidence: None,
            session: None,
            fare: None,
            timestamp,
        },
    };
    ApiResponse::Success { status, body }
}

fn pipeline_error_response<T>(err: PipelineError, now: OffsetDateTime) -> ApiResponse<T> {
    match err {
        PipelineError::RecognizerUnavailable => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RecognitionUnavailable,
            err.to_string(),
            now,
        ),
        PipelineError::Reconcile(err) if err.is_input_error() => invalid_input(err.to_string(), now),
        PipelineError::Reconcile(err @ ReconcileError::Calculation { .. }) => error_response(
            StatusCode::CONFLICT,
            ErrorCode::CalculationError,
            err.to_string(),
            now,
        ),
        PipelineError::Reconcile(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StorageError,
            err.to_string(),
            now,
        ),
        PipelineError::State(err) => {
            warn!(error = %err, "Detection handled but state update failed");
            internal_error("detection", "state update failed", now)
        }
    }
}

fn invalid_input<T>(message: String, now: OffsetDateTime) -> ApiResponse<T> {
    error_response(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput, message, now)
}

fn error_response<T>(
    status: StatusCode,
    error_code: ErrorCode,
    error_message: String,
    now: OffsetDateTime,
) -> ApiResponse<T> {
    ApiResponse::Error {
        status,
        body: ErrorResponse {
            error_code,
            error_message,
            timestamp: format_timestamp(now),
        },
    }
}

fn internal_error<T>(route: &str, message: &str, now: OffsetDateTime) -> ApiResponse<T> {
    error!(route = route, message = message, "Internal error while handling request");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::InternalError,
        INTERNAL_ERROR_MESSAGE.to_string(),
        now,
    )
}

fn format_timestamp(timestamp: OffsetDateTime) -> String {
    timestamp.format(&Rfc3339).unwrap_or_else(|err| {
        error!(error = %err, "Failed to format response timestamp");
        "1970-01-01T00:00:00Z".to_string()
    })
}
