use std::sync::Arc;

use axum::http::Method;
use bibliotek::config::{Cli, Config, resolve_paths};
use bibliotek::db::Database;
use bibliotek::handler::{AppState, router};
use bibliotek::kobo::clock::SystemClock;
use bibliotek::kobo::notifier::{ProgressNotifier, TracingSink};
use bibliotek::kobo::SyncService;
use clap::Parser;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let args = Cli::parse();

    let (config_path, data_dir) = resolve_paths(args.config_path);

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("bibliotek.svc starting");

    let cfg = Config::new(&config_path.to_string_lossy()).unwrap_or_else(|e| {
        tracing::error!(error = %e, path = ?config_path, "failed to load config file");
        std::process::exit(1);
    });
    let db = Arc::new(Database::new(&cfg, &data_dir).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup database");
        std::process::exit(1);
    }));

    let address = format!("0.0.0.0:{}", cfg.app.get_port());
    let cancellation_token = CancellationToken::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let (notifier, notifier_handle) = if cfg.sync.notify_progress {
        let (notifier, handle) = ProgressNotifier::spawn(Arc::new(TracingSink), cancellation_token.clone());
        (notifier, Some(handle))
    } else {
        tracing::info!("progress notifications disabled");
        (ProgressNotifier::disabled(), None)
    };

    // Embedded replicas push local writes on an interval.
    if Database::is_replica(&cfg.app.turso_url, &cfg.app.turso_auth_token) {
        let sync_db = db.clone();
        let sync_token = cancellation_token.clone();
        let sync_done = shutdown_complete_tx.clone();
        let every = std::time::Duration::from_secs(cfg.app.sync_interval_seconds.max(1));
        tokio::spawn(async move {
            let _done = sync_done;
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = sync_db.sync().await {
                            tracing::warn!("Failed to sync database replica: {}", e);
                        }
                    }
                    _ = sync_token.cancelled() => {
                        tracing::info!("Replica sync task shutting down");
                        break;
                    }
                }
            }
        });
    }

    let sync = Arc::new(SyncService::new(
        db.clone(),
        Arc::new(SystemClock),
        notifier,
        cfg.sync.options(),
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = router(AppState { sync }).layer(cors);

    let listener = tokio::net::TcpListener::bind(&address).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup tcp listener");
        std::process::exit(1);
    });

    tracing::info!("bibliotek.svc running on {}", &address);
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "server stopped unexpectedly");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            tracing::info!("ctrl+c signal received, preparing to shutdown");
            cancellation_token.cancel();
        }
    }

    if let Some(handle) = notifier_handle {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "progress notifier did not stop cleanly");
        }
    }

    drop(shutdown_complete_tx);
    shutdown_complete_rx.recv().await;
    tracing::info!("bibliotek.svc going off, graceful shutdown complete");
}
