//! Chat relay
//!
//! Accepts websocket clients, admits their messages through a bounded
//! local queue or a partitioned log, and dispatches each message to the
//! recipient's connection while persisting its delivery status.

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod log;
pub mod models;
pub mod routes;
pub mod store;
pub mod transport;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{AppState, RelayConfig};
use lifecycle::Lifecycle;
use store::{MessageStore, SqliteMessageStore};

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already set, ignore
    }

    info!("=== Chat Relay ===");

    let config = RelayConfig::default();
    config.ensure_dirs().await?;
    config.validate()?;

    info!("Data directory: {:?}", config.data_dir);
    info!("Message mode: {:?}", config.message_mode);

    let store: Arc<dyn MessageStore> =
        Arc::new(SqliteMessageStore::open(&config.database_path()).await?);
    info!("Message store initialized at {:?}", config.database_path());

    let transport = transport::from_config(&config).await?;
    let lifecycle = Lifecycle::new(&config, transport, store.clone())?;
    lifecycle.start().await?;

    let app_state = AppState {
        config: config.clone(),
        lifecycle: lifecycle.clone(),
        store: store.clone(),
    };
    let app = routes::router(app_state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Relay listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    lifecycle.shutdown().await;
    store.close().await;
    info!("Relay stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
