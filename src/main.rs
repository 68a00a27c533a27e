use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use questline::api::api_routes;
use questline::config::AppConfig;
use questline::llm::create_provider;
use questline::queue::JobQueue;
use questline::store::{LibSqlStore, RecordStore};
use questline::worker::{WorkerDeps, spawn_worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    eprintln!("🗺️ Questline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model.model);
    eprintln!("   API: http://{}", config.bind_addr);
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Workers: {}\n", config.workers);

    let store = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path))?,
    );

    let provider = create_provider(&config.model)?;
    let queue = JobQueue::new(store.connection());

    let deps = WorkerDeps {
        store: store.clone() as Arc<dyn RecordStore>,
        queue: queue.clone(),
        provider,
    };

    let mut handles = Vec::new();
    let mut shutdown_flags = Vec::new();
    for worker_id in 0..config.workers {
        let (handle, shutdown) = spawn_worker(worker_id, deps.clone(), None);
        handles.push(handle);
        shutdown_flags.push(shutdown);
    }

    let app = api_routes(store.clone() as Arc<dyn RecordStore>, queue);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Server is down; stop the consumer loops and let in-flight jobs finish
    for flag in &shutdown_flags {
        flag.store(true, Ordering::Relaxed);
    }
    for handle in handles {
        handle.await.ok();
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
