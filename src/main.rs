use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::BackendKind;
use services::{
    blob_storage::BlobStorage, memory_storage::MemoryStorage, sql_storage::SqlStorage,
    storage::TempStorage, sweeper, temp_file_service::TempFileService,
};

/// How long shutdown waits for an in-flight sweep before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting tempstore with config: {:?}", cfg);

    // --- Select and initialize the storage backend ---
    let storage: Arc<dyn TempStorage> = match cfg.backend {
        BackendKind::Memory => Arc::new(MemoryStorage::new(cfg.limits())),
        BackendKind::Sqlite => {
            let db = connect_sqlite(&cfg.database_url).await?;
            if migrate {
                run_migrations(&db).await?;
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }
            Arc::new(SqlStorage::new(db, cfg.limits()))
        }
        BackendKind::Blob => Arc::new(BlobStorage::open(&cfg.container_dir, cfg.limits()).await?),
    };

    // --- Facade + background eviction sweeper ---
    let service = TempFileService::new(storage.clone(), cfg.default_ttl());

    let shutdown = CancellationToken::new();
    let sweeper_handle = tokio::spawn(sweeper::run(
        storage.clone(),
        cfg.sweep_interval(),
        shutdown.clone(),
    ));

    // --- Build router ---
    let app: Router = routes::routes::routes(&cfg).with_state(service);

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

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            serve_shutdown.cancel();
        })
        .await?;

    // --- Stop the sweeper, waiting for an in-flight sweep within the grace
    //     period ---
    shutdown.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, sweeper_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!("Sweeper task failed during shutdown: {}", err),
        Err(_) => tracing::warn!("Sweeper did not finish within the shutdown grace period"),
    }

    Ok(())
}

/// Open the SQLite pool, creating the database file and its parent directory
/// when missing.
async fn connect_sqlite(db_url: &str) -> Result<Arc<sqlx::Pool<sqlx::Sqlite>>> {
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    if !db_path_obj.exists() {
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(db_path)?;
        tracing::info!("Created database file {}", db_path);
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    Ok(db)
}

/// Run SQLite migrations manually from the embedded SQL file.
async fn run_migrations(db: &Arc<sqlx::Pool<sqlx::Sqlite>>) -> Result<()> {
    let sql = include_str!("../migrations/0001_init.sql");
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(&**db).await?;
    }

    Ok(())
}
