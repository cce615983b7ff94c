mod config;
mod db;
mod error;
mod rate_limit;
mod routes;
mod services;
mod state;
mod workflow;

use services::analysis::AnalyzerConfig;
use services::analysis_worker::{WorkerConfig, spawn_analysis_workers, spawn_sweep};

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to load .env: {e}");
        }
    }
    tracing_subscriber::fmt::init();

    let config = config::AppConfig::from_env().expect("invalid configuration");

    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("database init failed");

    if let Ok(name) = std::env::var("BOOTSTRAP_ADMIN_NAME") {
        let admin_id = services::directory::ensure_bootstrap_admin(&pool, &name)
            .await
            .expect("bootstrap admin failed");
        tracing::info!(%admin_id, %name, "bootstrap admin ready");
    }

    let analyzer = match AnalyzerConfig::from_env().map(AnalyzerConfig::build).transpose() {
        Ok(analyzer) => analyzer,
        Err(e) => {
            tracing::error!(error = %e, "image analyzer unavailable; issues will go to manual verification");
            None
        }
    };
    if analyzer.is_none() {
        tracing::warn!("image analysis disabled");
    }

    let state = state::AppState::new(pool, analyzer, config.uploads.clone())
        .with_technician_max_open(config.technician_max_open);

    // Spawn analysis workers and the stale-issue sweep.
    let worker_config = WorkerConfig::from_env();
    let (analysis_tx, _workers) = spawn_analysis_workers(state.worker_context(), worker_config);
    let _sweep = worker_config
        .sweep
        .then(|| spawn_sweep(state.worker_context(), analysis_tx.clone(), worker_config));
    let state = state.with_analysis_queue(analysis_tx);

    let app = routes::app(state);
    let port = config.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, workers = worker_config.workers, "civicflow listening");
    axum::serve(listener, app).await.expect("server failed");
}
