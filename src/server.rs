use crate::{
    config::{Config, PipelineConfig, UploadConfig},
    detection::Detector,
    pipeline::PipelineSettings,
    routes::api_routes,
    stream::VideoStream,
    telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub video_stream: VideoStream,
    pub uploads: Arc<UploadConfig>,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(
        detector: Arc<dyn Detector>,
        uploads: UploadConfig,
        pipeline: &PipelineConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let video_stream =
            VideoStream::new(detector, PipelineSettings::from(pipeline), metrics.clone());
        Self {
            video_stream,
            uploads: Arc::new(uploads),
            metrics,
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    let upload_limit = state.uploads.max_upload_bytes();
    Router::new()
        .merge(api_routes(upload_limit))
        .with_state(state)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(detector: Arc<dyn Detector>, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState::new(
            detector,
            config.uploads.clone(),
            &config.pipeline,
            metrics,
        );

        let router = build_router(app_state).layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}
