mod health;
mod index;
mod metrics;
mod upload;
mod video_feed;

use crate::server::SharedState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

pub fn api_routes(upload_limit: usize) -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route(
            "/upload",
            post(upload::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/video_feed", get(video_feed::video_feed))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
