use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use presence_core::{BrightRegionDetector, FaceDetector, FrameRenderer};
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod engine;
mod http;
mod metrics;
mod store;

use config::{Config, DetectorKind};
use engine::{Rig, StreamDriver};
use metrics::MetricsBoard;
use store::AttendanceStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env();

    let store = AttendanceStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "attendance store opened");

    let camera = presence_hw::opener_for(config.camera_config())?;
    let detector = load_detector(&config)?;
    let detector_name = detector.name();
    let renderer = load_renderer(&config)?;

    let metrics = Arc::new(MetricsBoard::new());
    let driver = StreamDriver::new(
        Rig { camera, detector },
        renderer,
        Arc::clone(&metrics),
        Arc::new(store.clone()),
        config.driver_settings(),
    );

    let identity_header = HeaderName::from_bytes(config.identity_header.as_bytes())
        .with_context(|| format!("invalid identity header name '{}'", config.identity_header))?;

    let app = http::router(Arc::new(http::AppState {
        driver,
        metrics,
        store,
        identity_header,
        camera_device: config.camera_device.clone(),
        detector: detector_name,
    }));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!(
        addr = %config.listen_addr,
        camera = %config.camera_device,
        detector = detector_name,
        "presenced ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            // Keep running until signaled
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("presenced shutting down");

    Ok(())
}

fn load_detector(config: &Config) -> Result<Box<dyn FaceDetector>> {
    match config.detector {
        DetectorKind::Stub => {
            tracing::info!("using bright-region detector");
            Ok(Box::new(BrightRegionDetector::new(
                config.detection_confidence,
            )))
        }
        DetectorKind::Scrfd => load_scrfd(config),
    }
}

#[cfg(feature = "onnx")]
fn load_scrfd(config: &Config) -> Result<Box<dyn FaceDetector>> {
    let path = config.detection_model_path();
    presence_models::DETECTION_MODEL
        .check_file(&path)
        .context("detection model failed verification; run `presence setup`")?;
    let detector = presence_core::ScrfdDetector::load(&path, config.detection_confidence)?;
    tracing::info!(path = %path.display(), "SCRFD detector loaded");
    Ok(Box::new(detector))
}

#[cfg(not(feature = "onnx"))]
fn load_scrfd(config: &Config) -> Result<Box<dyn FaceDetector>> {
    anyhow::bail!(
        "PRESENCE_DETECTOR=scrfd needs a build with the `onnx` feature (model: {}); \
         set PRESENCE_DETECTOR=stub to run without it",
        config.detection_model_path().display()
    )
}

fn load_renderer(config: &Config) -> Result<FrameRenderer> {
    let renderer = FrameRenderer::new(config.jpeg_quality);
    let Some(path) = &config.font_path else {
        return Ok(renderer);
    };
    let renderer = renderer.with_font_file(path)?;
    tracing::info!(path = %path.display(), "label font loaded");
    Ok(renderer)
}
