use crate::services::storage::{StorageLimits, DEFAULT_MAX_PAYLOAD_BYTES};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration as StdDuration};

/// Which storage medium backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// In-process heap map. Contents are lost on restart.
    Memory,
    /// SQLite table, one row per object with the content as a BLOB column.
    Sqlite,
    /// Blob container directory: content as blob body, record fields as
    /// metadata entries.
    Blob,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "blob" => Ok(Self::Blob),
            other => Err(format!("unknown backend `{}`", other)),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub database_url: String,
    pub container_dir: String,
    pub default_ttl_minutes: i64,
    pub max_payload_bytes: u64,
    pub sweep_interval_minutes: u64,
    pub upload_path: String,
    pub download_path: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Ephemeral temp file store")]
pub struct Args {
    /// Host to bind to (overrides TEMPSTORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TEMPSTORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend: memory, sqlite, or blob (overrides TEMPSTORE_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Database URL for the sqlite backend (overrides TEMPSTORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Container directory for the blob backend (overrides TEMPSTORE_CONTAINER_DIR)
    #[arg(long)]
    pub container_dir: Option<String>,

    /// Default time-to-live in minutes (overrides TEMPSTORE_DEFAULT_TTL_MINUTES)
    #[arg(long)]
    pub default_ttl_minutes: Option<i64>,

    /// Maximum accepted payload size in bytes (overrides TEMPSTORE_MAX_PAYLOAD_BYTES)
    #[arg(long)]
    pub max_payload_bytes: Option<u64>,

    /// Sweep interval in minutes (overrides TEMPSTORE_SWEEP_INTERVAL_MINUTES)
    #[arg(long)]
    pub sweep_interval_minutes: Option<u64>,

    /// Run migrations and exit (sqlite backend)
    #[arg(long)]
    pub migrate: bool,
}

fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("TEMPSTORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parsed("TEMPSTORE_PORT", 3000u16)?;
        let env_backend = match env::var("TEMPSTORE_BACKEND") {
            Ok(value) => value
                .parse::<BackendKind>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parsing TEMPSTORE_BACKEND value `{}`", value))?,
            Err(_) => BackendKind::Memory,
        };
        let env_db = env::var("TEMPSTORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/tempstore.db".into());
        let env_container =
            env::var("TEMPSTORE_CONTAINER_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_ttl = env_parsed("TEMPSTORE_DEFAULT_TTL_MINUTES", 30i64)?;
        let env_max_payload =
            env_parsed("TEMPSTORE_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)?;
        let env_sweep = env_parsed("TEMPSTORE_SWEEP_INTERVAL_MINUTES", 15u64)?;
        let env_upload_path =
            env::var("TEMPSTORE_UPLOAD_PATH").unwrap_or_else(|_| "/upload-file".into());
        let env_download_path =
            env::var("TEMPSTORE_DOWNLOAD_PATH").unwrap_or_else(|_| "/download-file".into());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            backend: args.backend.unwrap_or(env_backend),
            database_url: args.database_url.unwrap_or(env_db),
            container_dir: args.container_dir.unwrap_or(env_container),
            default_ttl_minutes: args.default_ttl_minutes.unwrap_or(env_ttl),
            max_payload_bytes: args.max_payload_bytes.unwrap_or(env_max_payload),
            sweep_interval_minutes: args.sweep_interval_minutes.unwrap_or(env_sweep),
            upload_path: env_upload_path,
            download_path: env_download_path,
        };

        cfg.validate()?;

        Ok((cfg, args.migrate))
    }

    /// Reject values the rest of the system cannot run with. The sweep
    /// interval feeds `tokio::time::interval`, which panics on zero.
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.sweep_interval_minutes > 0,
            "sweep interval must be at least one minute, got 0"
        );
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.default_ttl_minutes)
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_minutes * 60)
    }

    pub fn limits(&self) -> StorageLimits {
        StorageLimits {
            max_payload_bytes: self.max_payload_bytes,
        }
    }
}
