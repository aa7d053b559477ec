use std::sync::Arc;

use taskmill::api::api_routes;
use taskmill::config::Config;
use taskmill::engine::scheduler::JobScheduler;
use taskmill::modules::{ModuleRegistry, builtin};
use taskmill::store::{LibSqlBackend, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // Initialize tracing; log to a daily-rotated file as well when a log
    // directory is configured.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _file_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskmill.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("Taskmill v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   API: http://{}:{}  (logs: /jobs/{{id}}/logs/stream)",
        config.api_host, config.api_port
    );

    // ── Database ─────────────────────────────────────────────────────
    let store: Arc<dyn StateStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    // ── Modules ──────────────────────────────────────────────────────
    let modules = Arc::new(ModuleRegistry::new());
    builtin::register_builtin(&modules);
    eprintln!("   Modules: {} registered", modules.count());

    // ── Scheduler ────────────────────────────────────────────────────
    let scheduler = Arc::new(JobScheduler::new(config.clone(), store, modules));

    // Startup recovery: rows still marked running belong to a process
    // that no longer exists.
    let resumed = scheduler.resume_interrupted_jobs().await;
    if resumed > 0 {
        eprintln!("   Resumed {resumed} interrupted job(s)");
    }

    // ── API server ───────────────────────────────────────────────────
    let app = api_routes(Arc::clone(&scheduler), config.stream_keepalive);
    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.api_host, config.api_port)).await?;
    tracing::info!(host = %config.api_host, port = config.api_port, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
