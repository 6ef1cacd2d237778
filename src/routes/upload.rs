use crate::{config::UploadConfig, server::SharedState};
use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::instrument;

const UPLOAD_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Failed to store upload: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        match self {
            UploadError::Multipart(e) => {
                tracing::warn!("Rejecting upload: {}", e);
                Redirect::to("/").into_response()
            }
            UploadError::Io(_) => {
                tracing::error!("{}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Something went wrong: {}", self),
                )
                    .into_response()
            }
        }
    }
}

fn reject(state: &SharedState, reason: &str) -> Redirect {
    tracing::info!("Upload rejected: {}", reason);
    state.metrics.record_upload("rejected");
    Redirect::to("/")
}

#[instrument(skip(state, multipart))]
pub async fn upload(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Redirect, UploadError> {
    state.metrics.record_request("/upload");

    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(e) => return Ok(reject(&state, &e.body_text())),
    };

    match receive(&state, multipart).await {
        Err(UploadError::Multipart(e)) => Ok(reject(&state, &e.body_text())),
        result => result,
    }
}

async fn receive(state: &SharedState, mut multipart: Multipart) -> Result<Redirect, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        if file_name.is_empty() {
            return Ok(reject(state, "no file selected"));
        }
        if !state.uploads.is_allowed(&file_name) {
            return Ok(reject(state, &format!("{} has an unsupported extension", file_name)));
        }

        let path = save_upload(field, &state.uploads).await?;
        state.metrics.record_upload("accepted");
        tracing::info!("Stored upload {} at {:?}", file_name, path);

        return Ok(Redirect::to(&format!(
            "/video_feed?video_path={}",
            state.uploads.file_name
        )));
    }

    Ok(reject(state, "missing file field"))
}

/// Streams the field into its own temporary file next to the destination and
/// renames it into place once complete. A failed transfer never replaces the
/// previous video, and concurrent uploads never share a partial file.
async fn save_upload(mut field: Field<'_>, uploads: &UploadConfig) -> Result<PathBuf, UploadError> {
    let destination = uploads.get_file_path();
    // The partial file is deleted when `partial` drops without being persisted.
    let (file, partial) = tempfile::Builder::new()
        .prefix(&uploads.file_name)
        .suffix(".part")
        .tempfile_in(&uploads.directory)?
        .into_parts();

    let mut file = fs::File::from_std(file);
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    partial.persist(&destination).map_err(|e| e.error)?;
    Ok(destination)
}
