use tokio_util::sync::CancellationToken;

mod capture;
mod config;
mod dataset;
mod pipeline;
mod transport;

use capture::{FrameSource, TestPatternSource};
use config::Settings;
use pipeline::{ActiveMode, Pipeline};

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("capture_bus", log::LevelFilter::Debug)
        .init();
}

fn load_settings() -> anyhow::Result<Settings> {
    match std::env::args().nth(1) {
        Some(path) => Settings::from_file(path),
        None => Settings::default().validated(),
    }
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let settings = load_settings().unwrap_or_else(|e| {
        eprintln!("Error loading settings: {}", e);
        std::process::exit(1);
    });

    let source = FrameSource::new();
    let pattern = TestPatternSource::start(source.clone(), settings.capture.clone());

    let (pipeline, worker) = Pipeline::start(settings, source.clone());
    pipeline
        .set_mode(Some(ActiveMode::Stream))
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error starting stream: {}", e);
            std::process::exit(1);
        });

    let cancel = CancellationToken::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    pattern.stop().await;
    pipeline.shutdown().await;
    let _ = worker.await;

    std::process::exit(0);
}
