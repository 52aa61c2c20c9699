use anyhow::Result;
use axum::Router;
use jar_store::{
    config::{AppConfig, RemoteMode},
    db,
    models::item::Capabilities,
    routes,
    services::{
        remote::MemoryRemote,
        retry::RetryConfig,
        store_service::{JarStore, StoreOptions},
        sync_service::{SyncConfig, SyncHandle, SyncService},
    },
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting jar-store with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // --- Handle migration mode ---
    if migrate {
        let pool = db::connect(&cfg.database_url, 1).await?;
        db::run_migrations(&pool).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize the store ---
    let store = JarStore::open(&StoreOptions {
        database_url: cfg.database_url.clone(),
        blob_dir: cfg.storage_dir.clone().into(),
        inline_threshold: cfg.inline_threshold,
        max_connections: 5,
    })
    .await?;

    // --- Start sync ---
    let sync = match cfg.remote {
        RemoteMode::None => {
            tracing::warn!("No remote configured, running in local-only mode");
            SyncHandle::local_only()
        }
        RemoteMode::Memory => {
            let config = SyncConfig {
                interval: cfg.sync_interval(),
                remote_timeout: cfg.remote_timeout(),
                retry: RetryConfig::default(),
            };
            SyncService::new(store.clone(), Arc::new(MemoryRemote::new()), config).start()
        }
    };

    // --- Build router ---
    let state = AppState {
        store,
        sync: sync.clone(),
        capabilities: Capabilities {
            camera_available: cfg.camera,
        },
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sync.shutdown().await;
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
