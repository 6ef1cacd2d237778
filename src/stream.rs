use crate::{
    detection::Detector,
    accuracy::AccuracyCounter,
    pipeline::{report_accuracy, FramePipeline, PipelineError, PipelineSettings},
    telemetry::Metrics,
    video::{VideoFile, VideoSource},
};
use bytes::Bytes;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

const FRAME_BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wraps one JPEG image in a `multipart/x-mixed-replace` part.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let part_header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", FRAME_BOUNDARY);
    let mut body = Vec::with_capacity(part_header.len() + jpeg.len() + 2);
    body.extend_from_slice(part_header.as_bytes());
    body.extend_from_slice(jpeg);
    body.extend_from_slice(b"\r\n");
    Bytes::from(body)
}

#[derive(Clone)]
pub struct VideoStream {
    detector: Arc<dyn Detector>,
    settings: PipelineSettings,
    metrics: Arc<Metrics>,
}

impl VideoStream {
    pub fn new(
        detector: Arc<dyn Detector>,
        settings: PipelineSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            detector,
            settings,
            metrics,
        }
    }

    /// Streams the annotated frames of the video at `path`.
    ///
    /// Decoding and inference block, so the pipeline runs on a blocking
    /// worker. The channel holds a single part: the next frame is only
    /// produced once the client has taken the previous one.
    #[instrument(skip(self))]
    pub fn generate_stream(self, path: PathBuf) -> ReceiverStream<Result<Bytes, PipelineError>> {
        let (tx, rx) = mpsc::channel(1);

        tokio::task::spawn_blocking(move || {
            let source = match VideoFile::open(&path) {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!("Streaming nothing for {:?}: {}", path, e);
                    report_accuracy(&AccuracyCounter::default(), Some(self.metrics.as_ref()));
                    return;
                }
            };

            let pipeline =
                FramePipeline::new(source, self.detector, self.settings).with_metrics(self.metrics);
            let sent = forward(pipeline, &tx);
            tracing::debug!("Stream for {:?} finished after {} parts", path, sent);
        });

        ReceiverStream::new(rx)
    }
}

/// Pushes pipeline output into `tx` until the pipeline ends or the receiver
/// goes away, in which case the pipeline is aborted. Returns the number of
/// items delivered.
fn forward<S, D>(
    mut pipeline: FramePipeline<S, D>,
    tx: &mpsc::Sender<Result<Bytes, PipelineError>>,
) -> usize
where
    S: VideoSource,
    D: Detector + ?Sized,
{
    let mut sent = 0;
    for item in pipeline.by_ref() {
        if tx.blocking_send(item).is_err() {
            tracing::info!("Client disconnected after {} parts", sent);
            pipeline.abort();
            break;
        }
        sent += 1;
    }
    sent
}
