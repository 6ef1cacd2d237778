use crate::config::Config;
use crate::detection::Detector;
use crate::ort_detector::OrtDetector;
use crate::server::HttpServer;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    tokio::fs::create_dir_all(&config.uploads.directory).await?;

    let detector: Arc<dyn Detector> = match OrtDetector::new(&config.model) {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to initialize detector: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let server = HttpServer::new(detector, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server exited with error: {:?}", e),
        Err(e) => tracing::error!("Server task failed: {:?}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
