use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use secrecy::SecretString;

use burstline::api::{self, AppState};
use burstline::config::CoordinatorConfig;
use burstline::error::ConfigError;
use burstline::handoff::HandoffManager;
use burstline::ingest::IngestionGateway;
use burstline::pipeline::{ProcessingPipeline, WebhookPipeline};
use burstline::store::{Database, LibSqlBackend};
use burstline::worker::{Sweeper, TimeoutSweeper, spawn_sweeper, spawn_timeout_sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (optionally into a daily-rolling file)
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _log_guard = match std::env::var("BURSTLINE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "burstline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
            None
        }
    };

    let port: u16 = std::env::var("BURSTLINE_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let pipeline_url = std::env::var("BURSTLINE_PIPELINE_URL")
        .map_err(|_| ConfigError::MissingEnvVar("BURSTLINE_PIPELINE_URL".into()))
        .unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            eprintln!("  export BURSTLINE_PIPELINE_URL=http://localhost:9000/process");
            std::process::exit(1);
        });
    let pipeline_token = std::env::var("BURSTLINE_PIPELINE_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .map(SecretString::from);

    eprintln!("📨 Burstline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Pipeline: {}", pipeline_url);
    eprintln!("   API: http://0.0.0.0:{}/api/events", port);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("BURSTLINE_DB_PATH").unwrap_or_else(|_| "./data/burstline.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("Failed to open database at {db_path}"))?,
    );
    eprintln!("   Database: {}", db_path);

    // ── Coordinator ──────────────────────────────────────────────────────
    let config = CoordinatorConfig::load(db.as_ref()).await;
    eprintln!(
        "   Buffer window: {}s, lock staleness: {}s, sweep every {}s",
        config.buffer_window.as_secs(),
        config.lock_stale_threshold.as_secs(),
        config.sweep_interval.as_secs()
    );
    let config = config.shared();

    let pipeline: Arc<dyn ProcessingPipeline> =
        Arc::new(WebhookPipeline::new(pipeline_url, pipeline_token));
    let handoff = Arc::new(HandoffManager::new(Arc::clone(&db)));
    let gateway = Arc::new(IngestionGateway::new(
        Arc::clone(&db),
        Arc::clone(&handoff),
        Arc::clone(&config),
    ));
    let sweeper = Arc::new(Sweeper::new(
        Arc::clone(&db),
        pipeline,
        Arc::clone(&handoff),
        Arc::clone(&config),
    ));

    let (_sweep_handle, sweep_shutdown) = spawn_sweeper(Arc::clone(&sweeper));
    let (_timeout_handle, timeout_shutdown) =
        spawn_timeout_sweeper(Arc::clone(&db), Arc::new(TimeoutSweeper::new(Arc::clone(&db))));

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::routes(AppState {
        db: Arc::clone(&db),
        gateway,
        sweeper,
        handoff,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    tracing::info!(port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down");
    sweep_shutdown.store(true, Ordering::Relaxed);
    timeout_shutdown.store(true, Ordering::Relaxed);
    Ok(())
}
