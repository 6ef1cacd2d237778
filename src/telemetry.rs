use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;

pub struct Metrics {
    request_counter: Counter<u64>,
    upload_counter: Counter<u64>,
    frames_processed: Counter<u64>,
    fire_frames: Counter<u64>,
    inference_duration: Histogram<u64>,
    pipeline_accuracy: Gauge<f64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("fire_stream");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let upload_counter = meter
            .u64_counter("uploads_total")
            .with_description("Video uploads by outcome")
            .build();

        let frames_processed = meter
            .u64_counter("frames_processed_total")
            .with_description("Frames decoded, analysed and streamed")
            .build();

        let fire_frames = meter
            .u64_counter("fire_frames_total")
            .with_description("Frames with at least one fire detection above threshold")
            .build();

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(exponential_boundaries(5.0, 2.0, 9))
            .with_description("Duration of detector calls in milliseconds")
            .build();

        let pipeline_accuracy = meter
            .f64_gauge("pipeline_accuracy")
            .with_description("Accuracy reported at the end of the last streamed video")
            .build();

        Ok(Metrics {
            request_counter,
            upload_counter,
            frames_processed,
            fire_frames,
            inference_duration,
            pipeline_accuracy,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_upload(&self, outcome: &'static str) {
        self.upload_counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub fn record_frame(&self, fire_detected: bool, inference_ms: u64) {
        self.frames_processed.add(1, &[]);
        if fire_detected {
            self.fire_frames.add(1, &[]);
        }
        self.inference_duration.record(inference_ms, &[]);
    }

    pub fn record_accuracy(&self, accuracy: f64) {
        self.pipeline_accuracy.record(accuracy, &[]);
    }
}

/// `count` bucket boundaries starting at `start`, each `factor` times the
/// previous one.
fn exponential_boundaries(start: f64, factor: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start), |previous| Some(previous * factor))
        .take(count)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_exponential_boundaries() {
        assert_eq!(
            exponential_boundaries(5.0, 2.0, 5),
            vec![5.0, 10.0, 20.0, 40.0, 80.0]
        );
        assert!(exponential_boundaries(1.0, 2.0, 0).is_empty());
    }

    #[test]
    fn test_recorded_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/video_feed");
        metrics.record_frame(true, 12);
        metrics.record_upload("accepted");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let exposition = String::from_utf8(buffer).unwrap();

        assert!(exposition.contains("fire_frames_total"));
        assert!(exposition.contains("requests_total"));
    }
}
