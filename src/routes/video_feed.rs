use crate::{server::SharedState, stream::CONTENT_TYPE};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum VideoFeedError {
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

impl IntoResponse for VideoFeedError {
    fn into_response(self) -> Response {
        let status = match self {
            VideoFeedError::HttpBuilderError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct VideoFeedParams {
    video_path: Option<String>,
}

#[instrument(skip(state))]
pub async fn video_feed(
    State(state): State<SharedState>,
    Query(params): Query<VideoFeedParams>,
) -> Result<Response, VideoFeedError> {
    state.metrics.record_request("/video_feed");

    let Some(video_path) = params.video_path.filter(|path| !path.is_empty()) else {
        return Ok(Redirect::to("/").into_response());
    };
    let Some(path) = state.uploads.resolve(&video_path) else {
        tracing::warn!("Refusing to stream {:?}", video_path);
        return Ok(Redirect::to("/").into_response());
    };

    let stream = state.video_stream.clone().generate_stream(path);

    let response = Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(Body::from_stream(stream))
        .map_err(|e| VideoFeedError::HttpBuilderError(e.to_string()))?;

    Ok(response)
}
