use crate::{
    accuracy::{AccuracyCounter, GroundTruth},
    config::PipelineConfig,
    detection::{Detector, DetectorError, PixelBox},
    frame::{Frame, FrameError, BOX_COLOR, BOX_THICKNESS},
    stream::multipart_part,
    telemetry::Metrics,
    video::VideoSource,
};
use bytes::Bytes;
use opencv::core::Point;
use std::{borrow::Cow, iter::FusedIterator, sync::Arc, time::Instant};
use thiserror::Error;

pub const FRAME_WIDTH: i32 = 640;
pub const FRAME_HEIGHT: i32 = 480;
/// Detections must score strictly above this percentage.
pub const CONFIDENCE_THRESHOLD: u32 = 50;
/// Label anchor relative to the top-left corner of the box.
const LABEL_OFFSET: (i32, i32) = (8, 100);

/// Label text for a detection and its anchor inside the box.
fn detection_label(class_name: &str, confidence: u32, bbox: &PixelBox) -> (String, Point) {
    let text = format!("{} {}%", class_name, confidence);
    let anchor = Point::new(bbox.x1 + LABEL_OFFSET.0, bbox.y1 + LABEL_OFFSET.1);
    (text, anchor)
}

/// Logs the final accuracy of a run and publishes it as a gauge.
pub(crate) fn report_accuracy(counter: &AccuracyCounter, metrics: Option<&Metrics>) -> f64 {
    let accuracy = counter.accuracy();
    tracing::info!(
        total_frames = counter.total_frames,
        correct_detections = counter.correct_detections,
        "Accuracy of the fire detector: {:.2}%",
        accuracy
    );
    if let Some(metrics) = metrics {
        metrics.record_accuracy(accuracy);
    }
    accuracy
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Static inputs shared by every pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    ground_truth: Arc<GroundTruth>,
    class_labels: Arc<[String]>,
}

impl PipelineSettings {
    pub fn new(ground_truth: GroundTruth, class_labels: Vec<String>) -> Self {
        Self {
            ground_truth: Arc::new(ground_truth),
            class_labels: class_labels.into(),
        }
    }

    pub fn class_name(&self, class_id: usize) -> Cow<'_, str> {
        match self.class_labels.get(class_id) {
            Some(label) => Cow::Borrowed(label.as_str()),
            None => Cow::Owned(format!("Unknown class {}", class_id)),
        }
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self::new(
            GroundTruth::new(config.ground_truth.iter().copied()),
            config.class_labels.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Streaming,
    Done,
}

/// Turns a video source into annotated multipart JPEG parts, one per decoded
/// frame, while tallying agreement with the ground truth.
///
/// The iterator yields `None` once the source is exhausted. A failure while
/// processing a frame is yielded once as `Err` and also ends the sequence.
pub struct FramePipeline<S: VideoSource, D: Detector + ?Sized> {
    source: S,
    detector: Arc<D>,
    settings: PipelineSettings,
    counter: AccuracyCounter,
    frame_index: u64,
    state: PipelineState,
    metrics: Option<Arc<Metrics>>,
}

impl<S: VideoSource, D: Detector + ?Sized> FramePipeline<S, D> {
    pub fn new(source: S, detector: Arc<D>, settings: PipelineSettings) -> Self {
        Self {
            source,
            detector,
            settings,
            counter: AccuracyCounter::default(),
            frame_index: 0,
            state: PipelineState::Streaming,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn counter(&self) -> AccuracyCounter {
        self.counter
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Stops early, e.g. when nobody is reading the output anymore.
    pub fn abort(&mut self) {
        if self.state == PipelineState::Streaming {
            tracing::info!(
                "Aborting frame pipeline after {} frames",
                self.counter.total_frames
            );
        }
        self.finish();
    }

    fn finish(&mut self) {
        if self.state == PipelineState::Done {
            return;
        }
        self.state = PipelineState::Done;
        self.source.release();
        report_accuracy(&self.counter, self.metrics.as_deref());
    }

    fn process(&mut self, frame: Frame) -> Result<Bytes, PipelineError> {
        let index = self.frame_index;
        self.frame_index += 1;

        let mut frame = frame.resized(FRAME_WIDTH, FRAME_HEIGHT)?;

        let started = Instant::now();
        let detections = self.detector.detect(&frame)?;
        let inference_ms = started.elapsed().as_millis() as u64;

        let mut fire_detected = false;
        for detection in &detections {
            let confidence = detection.confidence_percent();
            if confidence <= CONFIDENCE_THRESHOLD {
                continue;
            }
            fire_detected = true;

            let class_name = self.settings.class_name(detection.class_id);
            let bbox = detection.bbox.to_pixels();
            let (label, anchor) = detection_label(&class_name, confidence, &bbox);
            frame
                .draw_box(&bbox, BOX_COLOR, BOX_THICKNESS)?
                .draw_label(&label, anchor)?;

            tracing::info!("Detected {} with confidence: {}%", class_name, confidence);
        }

        let expected_fire = self.settings.ground_truth.contains(index);
        let correct = self.counter.record(fire_detected, expected_fire);
        tracing::debug!(
            frame = index,
            fire_detected,
            expected_fire,
            correct,
            inference_ms,
            "Frame analysed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_frame(fire_detected, inference_ms);
        }

        let jpeg = frame.to_jpg()?;
        Ok(multipart_part(&jpeg))
    }
}

impl<S: VideoSource, D: Detector + ?Sized> Iterator for FramePipeline<S, D> {
    type Item = Result<Bytes, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == PipelineState::Done {
            return None;
        }

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.finish();
                return None;
            }
            Err(e) => {
                tracing::warn!("Error reading frame, ending stream: {}", e);
                self.finish();
                return None;
            }
        };

        match self.process(frame) {
            Ok(part) => Some(Ok(part)),
            Err(e) => {
                tracing::error!("Failed to process frame {}: {}", self.frame_index - 1, e);
                self.finish();
                Some(Err(e))
            }
        }
    }
}

impl<S: VideoSource, D: Detector + ?Sized> FusedIterator for FramePipeline<S, D> {}

impl<S: VideoSource, D: Detector + ?Sized> Drop for FramePipeline<S, D> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        detection::{BoundingBox, Detection},
        video::VideoSourceError,
    };
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

    /// Produces `frames` black frames, then optionally fails.
    pub(crate) struct FakeSource {
        remaining: usize,
        fail_after: bool,
        pub(crate) releases: Arc<AtomicUsize>,
    }

    impl FakeSource {
        pub(crate) fn new(frames: usize) -> Self {
            Self {
                remaining: frames,
                fail_after: false,
                releases: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing_after(frames: usize) -> Self {
            Self {
                fail_after: true,
                ..Self::new(frames)
            }
        }
    }

    impl VideoSource for FakeSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, VideoSourceError> {
            if self.remaining == 0 {
                if self.fail_after {
                    return Err(VideoSourceError::ReadFrameFailed(opencv::Error::new(
                        opencv::core::StsError,
                        "decoder gave up",
                    )));
                }
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Frame::blank(1280, 720).unwrap()))
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Reports fire on the listed call indices, a weak detection elsewhere.
    pub(crate) struct FakeDetector {
        fire_frames: HashSet<usize>,
        calls: AtomicUsize,
        seen_sizes: Mutex<Vec<(i32, i32)>>,
        fail_on: Option<usize>,
    }

    impl FakeDetector {
        pub(crate) fn new(fire_frames: impl IntoIterator<Item = usize>) -> Self {
            Self {
                fire_frames: fire_frames.into_iter().collect(),
                calls: AtomicUsize::new(0),
                seen_sizes: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    impl Detector for FakeDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_sizes.lock().push((frame.width(), frame.height()));
            if self.fail_on == Some(call) {
                return Err(DetectorError::Inference("model crashed".into()));
            }

            let bbox = BoundingBox {
                x1: 100.0,
                y1: 50.0,
                x2: 300.0,
                y2: 250.0,
            };
            let confidence = if self.fire_frames.contains(&call) {
                0.87
            } else {
                0.5
            };
            Ok(vec![Detection {
                class_id: 0,
                confidence,
                bbox,
            }])
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings::new(GroundTruth::new([0, 2, 5]), vec!["fire".into()])
    }

    #[test]
    fn test_emits_one_part_per_frame() {
        let detector = Arc::new(FakeDetector::new([0, 2, 5]));
        let mut pipeline = FramePipeline::new(FakeSource::new(6), detector.clone(), settings());

        let parts: Vec<Bytes> = pipeline
            .by_ref()
            .collect::<Result<_, _>>()
            .expect("all frames should be processed");

        assert_eq!(parts.len(), 6);
        for part in &parts {
            assert!(part.starts_with(PART_HEADER));
            assert_eq!(&part[PART_HEADER.len()..PART_HEADER.len() + 2], &[0xFF, 0xD8]);
            assert!(part.ends_with(b"\r\n"));
        }
        assert!(detector
            .seen_sizes
            .lock()
            .iter()
            .all(|size| *size == (FRAME_WIDTH, FRAME_HEIGHT)));
    }

    #[test]
    fn test_matching_ground_truth_scores_one_hundred_fifty() {
        let detector = Arc::new(FakeDetector::new([0, 2, 5]));
        let mut pipeline = FramePipeline::new(FakeSource::new(6), detector, settings());

        assert_eq!(pipeline.by_ref().count(), 6);

        let counter = pipeline.counter();
        assert_eq!(counter.total_frames, 6);
        assert_eq!(counter.correct_detections, 6);
        assert_eq!(counter.accuracy(), 150.0);
        assert_eq!(pipeline.state(), PipelineState::Done);
    }

    #[test]
    fn test_threshold_is_strict() {
        // Every frame only gets a 50% detection, which must not count as fire.
        let detector = Arc::new(FakeDetector::new([]));
        let mut pipeline = FramePipeline::new(FakeSource::new(6), detector, settings());

        pipeline.by_ref().for_each(drop);

        let counter = pipeline.counter();
        assert_eq!(counter.correct_detections, 3);
        assert!(counter.correct_detections <= counter.total_frames);
        assert_eq!(counter.accuracy(), 100.0);
    }

    #[test]
    fn test_empty_source_yields_nothing() {
        let source = FakeSource::new(0);
        let releases = source.releases.clone();
        let mut pipeline = FramePipeline::new(source, Arc::new(FakeDetector::new([])), settings());

        assert!(pipeline.next().is_none());
        assert!(pipeline.next().is_none());
        assert_eq!(pipeline.counter().accuracy(), 0.0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_error_ends_stream() {
        let source = FakeSource::failing_after(2);
        let releases = source.releases.clone();
        let mut pipeline = FramePipeline::new(source, Arc::new(FakeDetector::new([0])), settings());

        assert_eq!(pipeline.by_ref().filter(Result::is_ok).count(), 2);
        assert_eq!(pipeline.state(), PipelineState::Done);
        drop(pipeline);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detector_failure_is_reported_once() {
        let mut detector = FakeDetector::new([0]);
        detector.fail_on = Some(1);
        let mut pipeline = FramePipeline::new(FakeSource::new(4), Arc::new(detector), settings());

        assert!(matches!(pipeline.next(), Some(Ok(_))));
        assert!(matches!(
            pipeline.next(),
            Some(Err(PipelineError::Detector(_)))
        ));
        assert!(pipeline.next().is_none());
        assert_eq!(pipeline.counter().total_frames, 1);
    }

    #[test]
    fn test_release_happens_once_even_when_dropped_early() {
        let source = FakeSource::new(5);
        let releases = source.releases.clone();
        let mut pipeline = FramePipeline::new(source, Arc::new(FakeDetector::new([])), settings());

        assert!(pipeline.next().is_some());
        pipeline.abort();
        assert!(pipeline.next().is_none());
        drop(pipeline);

        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detection_label_text_and_anchor() {
        let bbox = PixelBox {
            x1: 100,
            y1: 50,
            x2: 300,
            y2: 250,
        };

        let (text, anchor) = detection_label("fire", 87, &bbox);

        assert_eq!(text, "fire 87%");
        assert_eq!(anchor, Point::new(108, 150));
    }

    #[test]
    fn test_report_accuracy_without_frames() {
        let metrics = Metrics::new().unwrap();

        let accuracy = report_accuracy(&AccuracyCounter::default(), Some(&metrics));

        assert_eq!(accuracy, 0.0);
        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|name| name.starts_with("pipeline_accuracy")));
    }

    #[test]
    fn test_unknown_class_label() {
        let settings = settings();
        assert_eq!(settings.class_name(0), "fire");
        assert_eq!(settings.class_name(3), "Unknown class 3");
    }
}
