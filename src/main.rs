use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hls_scout::browser::{
    BrowserPool, ChromiumDriver, CircuitWatchdog, ContextOptions, LaunchOptions,
    ManifestExtractor, PoolConfig,
};
use hls_scout::config::ServiceConfig;
use hls_scout::server::{build_router, AppState};

#[derive(Debug, Error)]
enum AppError {
    #[error("config error: {0}")]
    Config(#[from] hls_scout::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env()?;
    install_metrics(config.metrics_port)?;
    hls_scout::metrics::describe();

    let pool_config = PoolConfig {
        max_concurrent: config.max_concurrent,
        idle_timeout: config.browser_idle_timeout,
        max_age: config.browser_max_age,
        shutdown_timeout: config.shutdown_timeout,
        launch: LaunchOptions {
            executable: config.chrome_path.clone(),
        },
        context: ContextOptions::default(),
    };
    let user_agent = pool_config.context.user_agent.clone();
    let pool = BrowserPool::new(Arc::new(ChromiumDriver), pool_config);
    let extractor = Arc::new(ManifestExtractor::new(Arc::clone(&pool), user_agent));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchdog =
        CircuitWatchdog::new(Arc::clone(&pool), config.circuit_exit_threshold).spawn(shutdown_rx);

    let state = AppState {
        extractor,
        pool: Arc::clone(&pool),
        secret: config.extraction_secret.clone(),
    };
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, metrics_port = config.metrics_port, "hls-scout listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Watchdog first, so normal termination never races a process exit.
    let _ = shutdown_tx.send(true);
    let _ = watchdog.await;
    pool.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

fn install_metrics(port: u16) -> Result<(), AppError> {
    let buckets = [
        0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0,
    ];
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), &buckets)?
        .install()?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not register SIGTERM handler");
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
}
