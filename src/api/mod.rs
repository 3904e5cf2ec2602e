use crate::api::handlers::SharedPipeline;
use axum::Router;
use axum::routing::{get, post};

pub mod handlers;
pub mod responses;

pub fn router(pipeline: SharedPipeline) -> Router {
    Router::new()
        .route("/api/health", get(handlers::get_health))
        .route("/api/sessions", get(handlers::get_sessions))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/rate", get(handlers::get_rate))
        .route("/api/rates", post(handlers::post_rate))
        .route("/api/detections", post(handlers::post_detection))
        .route("/api/frames", post(handlers::post_frame))
        .with_state(pipeline)
}
