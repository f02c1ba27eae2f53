use std::sync::Arc;

use parseit::api::api_routes;
use parseit::config::HostConfig;
use parseit::pipeline::{HttpAdapterFactory, PollingPipeline, spawn_polling_scheduler};
use parseit::store::{LibSqlStore, RecordStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let host = HostConfig::from_env();

    // Initialize tracing; log to a daily-rolling file when a directory is set
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &host.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "parseit.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
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

    eprintln!("📬 Parseit v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}/api/runs", host.bind_addr);
    eprintln!("   Database: {}", host.db_path);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&host.db_path);
    let store: Arc<dyn RecordStore> =
        Arc::new(LibSqlStore::new_local(db_path).await.unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {}", host.db_path, e);
            std::process::exit(1);
        }));

    let mailboxes = store.list_mail_settings().await.unwrap_or_default();
    eprintln!(
        "   Mailboxes: {} configured, {} enabled\n",
        mailboxes.len(),
        mailboxes.iter().filter(|m| m.enabled).count()
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let factory = Arc::new(HttpAdapterFactory::new());
    let pipeline = Arc::new(PollingPipeline::new(Arc::clone(&store), factory));

    let (_scheduler_handle, _shutdown) = spawn_polling_scheduler(Arc::clone(&pipeline), None);

    // ── API server ───────────────────────────────────────────────────────
    let app = api_routes(pipeline, store);
    let listener = tokio::net::TcpListener::bind(&host.bind_addr).await?;
    tracing::info!(addr = %host.bind_addr, "API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
