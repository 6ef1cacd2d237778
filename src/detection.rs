use crate::frame::{Frame, FrameError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to load model: {0}")]
    Model(String),
    #[error("Failed to prepare frame: {0}")]
    Preprocess(#[from] FrameError),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Box corners in frame pixel coordinates, as reported by the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let width = self.x2.min(other.x2) - self.x1.max(other.x1);
        let height = self.y2.min(other.y2) - self.y1.max(other.y1);
        width.max(0.0) * height.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Truncates towards zero, like an `int()` cast.
    pub fn to_pixels(&self) -> PixelBox {
        PixelBox {
            x1: self.x1 as i32,
            y1: self.y1 as i32,
            x2: self.x2 as i32,
            y2: self.y2 as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    /// Model score in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    /// Confidence on a 0-100 scale, rounded up.
    pub fn confidence_percent(&self) -> u32 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).ceil() as u32
    }
}

/// Runs object detection on a single frame.
///
/// Implementations are shared between concurrent streams and must not keep
/// any per-video state.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}
