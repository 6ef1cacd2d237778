use crate::frame::Frame;
use opencv::{core::Mat, prelude::*, videoio};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VideoSourceError {
    #[error("Failed to open video {0:?}")]
    OpenFailed(PathBuf),
    #[error("Video path is not valid UTF-8: {0:?}")]
    InvalidPath(PathBuf),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

/// An ordered, finite sequence of frames. Once `next_frame` returns
/// `Ok(None)` the source is exhausted; it can only be restarted by opening it
/// again.
pub trait VideoSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, VideoSourceError>;

    /// Frees the underlying handle. Called once when the stream ends.
    fn release(&mut self) {}
}

pub struct VideoFile {
    path: PathBuf,
    capture: videoio::VideoCapture,
}

impl VideoFile {
    pub fn open(path: &Path) -> Result<Self, VideoSourceError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VideoSourceError::InvalidPath(path.to_path_buf()))?;
        let capture = videoio::VideoCapture::from_file(path_str, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(VideoSourceError::OpenFailed(path.to_path_buf()));
        }
        tracing::debug!("Opened video {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            capture,
        })
    }
}

impl VideoSource for VideoFile {
    fn next_frame(&mut self) -> Result<Option<Frame>, VideoSourceError> {
        let mut mat = Mat::default();
        let grabbed = self
            .capture
            .read(&mut mat)
            .map_err(VideoSourceError::ReadFrameFailed)?;
        if !grabbed || mat.empty() {
            return Ok(None);
        }
        Ok(Some(Frame::from_mat(mat)))
    }

    fn release(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("Failed to release video {:?}: {}", self.path, e);
        }
    }
}
