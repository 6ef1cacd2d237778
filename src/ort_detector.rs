use crate::{
    config::ModelConfig,
    detection::{BoundingBox, Detection, Detector, DetectorError},
    frame::Frame,
};
use ndarray::{ArrayView2, Axis};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::path::Path;
use tracing::instrument;

fn load_session(path: &Path) -> ort::Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(path)?;
    Ok(session)
}

/// YOLOv8-style detector backed by an ONNX Runtime session.
pub struct OrtDetector {
    session: Mutex<Session>,
    input_size: u32,
    min_probability: f32,
    iou_threshold: f32,
}

impl OrtDetector {
    pub fn new(model_config: &ModelConfig) -> Result<Self, DetectorError> {
        model_config.validate().map_err(DetectorError::Model)?;

        let session = load_session(&model_config.get_path())
            .map_err(|e| DetectorError::Model(e.to_string()))?;

        tracing::info!("Loaded ONNX model from {:?}", model_config.get_path());

        Ok(Self {
            session: Mutex::new(session),
            input_size: model_config.input_size,
            min_probability: model_config.min_probability,
            iou_threshold: model_config.iou_threshold,
        })
    }
}

impl Detector for OrtDetector {
    #[instrument(skip(self, frame))]
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let input = frame.to_rgb_tensor(self.input_size)?;

        let output = {
            let mut session = self.session.lock();
            let tensor_ref = TensorRef::from_array_view(input.view())
                .map_err(|e| DetectorError::Inference(format!("failed to build tensor: {}", e)))?;
            let outputs = session
                .run(ort::inputs![tensor_ref])
                .map_err(|e| DetectorError::Inference(e.to_string()))?;
            let output = outputs["output0"]
                .try_extract_array::<f32>()
                .map_err(|e| DetectorError::Inference(format!("failed to extract tensor: {}", e)))?
                .into_owned();
            output
        };

        if output.ndim() != 3 || output.shape()[0] == 0 {
            return Err(DetectorError::Inference(format!(
                "unexpected output shape {:?}",
                output.shape()
            )));
        }
        let predictions = output
            .index_axis(Axis(0), 0)
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| DetectorError::Inference(format!("invalid tensor shape: {}", e)))?;

        let scale = (
            frame.width() as f32 / self.input_size as f32,
            frame.height() as f32 / self.input_size as f32,
        );
        let candidates = decode_predictions(predictions, scale, self.min_probability);
        let detections = non_max_suppression(candidates, self.iou_threshold);

        tracing::debug!("Returning {} detections", detections.len());
        Ok(detections)
    }
}

/// Reads a `[4 + classes, anchors]` prediction matrix. Each anchor column
/// holds `xc, yc, w, h` followed by per-class scores.
fn decode_predictions(
    predictions: ArrayView2<f32>,
    scale: (f32, f32),
    min_probability: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    if predictions.nrows() <= 4 {
        return detections;
    }

    for column in predictions.axis_iter(Axis(1)) {
        let best = column
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });
        let Some((class_id, prob)) = best else {
            continue;
        };
        if prob < min_probability {
            continue;
        }

        let xc = column[0] * scale.0;
        let yc = column[1] * scale.1;
        let w = column[2] * scale.0;
        let h = column[3] * scale.1;

        detections.push(Detection {
            class_id,
            confidence: prob,
            bbox: BoundingBox {
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
            },
        });
    }

    detections
}

fn non_max_suppression(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in boxes {
        if kept
            .iter()
            .all(|best| best.bbox.iou(&candidate.bbox) < iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}
