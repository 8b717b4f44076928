use std::path::{Path, PathBuf};
use std::sync::Arc;

use camrelay_api::fanout::FanoutSettings;
use camrelay_api::placeholder;
use camrelay_api::routes::{self, AppState};
use camrelay_common::cache::FrameCache;
use camrelay_common::config::Config;
use camrelay_ingest::{ReaderSettings, SourceSupervisor, UriConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let placeholder = match placeholder::load(Path::new(&config.stream.placeholder_path)) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to prepare placeholder frame");
            std::process::exit(1);
        }
    };

    let connector = match UriConnector::new(
        config.ffmpeg.clone(),
        config.reconnect.connect_timeout(),
        config.stream.max_frame_bytes,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build source connector");
            std::process::exit(1);
        }
    };

    let cameras = config.cameras();
    let camera_count = cameras.len();
    let cache = Arc::new(FrameCache::new(camera_count));
    let shutdown = CancellationToken::new();

    let supervisor = match SourceSupervisor::start(
        cameras,
        Arc::new(connector),
        Arc::clone(&cache),
        ReaderSettings::from_config(&config.reconnect, &config.stream),
        shutdown.child_token(),
    ) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start source readers");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(
        cache,
        supervisor.health(),
        placeholder,
        FanoutSettings::from_config(&config.stream),
        shutdown.clone(),
    ));
    let app = routes::router(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    info!(addr, cameras = camera_count, "camrelay starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    tokio::spawn(wait_for_signal(shutdown.clone()));

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
    {
        error!(error = %e, "HTTP server failed");
        shutdown.cancel();
    }

    supervisor.shutdown(config.server.shutdown_grace()).await;
    info!("camrelay stopped");
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
