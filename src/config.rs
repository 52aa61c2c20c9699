use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

use crate::services::store_service::DEFAULT_INLINE_THRESHOLD;

/// Which remote the sync service talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RemoteMode {
    /// No remote; everything stays on this device.
    None,
    /// In-process remote, useful for demos and local testing.
    Memory,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub inline_threshold: usize,
    pub sync_interval_secs: u64,
    pub remote_timeout_secs: u64,
    pub remote: RemoteMode,
    pub camera: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Personal jar organizer with background sync")]
pub struct Args {
    /// Host to bind to (overrides JAR_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides JAR_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for out-of-line item payloads (overrides JAR_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides JAR_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Payloads above this many bytes go to the blob directory (overrides JAR_STORE_INLINE_THRESHOLD)
    #[arg(long)]
    pub inline_threshold: Option<usize>,

    /// Seconds between periodic sync cycles (overrides JAR_STORE_SYNC_INTERVAL_SECS)
    #[arg(long)]
    pub sync_interval_secs: Option<u64>,

    /// Timeout for a single remote call (overrides JAR_STORE_REMOTE_TIMEOUT_SECS)
    #[arg(long)]
    pub remote_timeout_secs: Option<u64>,

    /// Remote backend (overrides JAR_STORE_REMOTE)
    #[arg(long, value_enum)]
    pub remote: Option<RemoteMode>,

    /// Whether a camera is available for capture (overrides JAR_STORE_CAMERA)
    #[arg(long)]
    pub camera: Option<bool>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name))?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values read through `lookup`, then defaults.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let env_host = lookup("JAR_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_storage =
            lookup("JAR_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = lookup("JAR_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/jar_store.db".into());
        let env_remote = match lookup("JAR_STORE_REMOTE") {
            Ok(value) => <RemoteMode as ValueEnum>::from_str(&value, true)
                .map_err(|err| anyhow::anyhow!(err))
                .with_context(|| format!("parsing JAR_STORE_REMOTE value `{}`", value))?,
            Err(env::VarError::NotPresent) => RemoteMode::None,
            Err(err) => return Err(err).context("reading JAR_STORE_REMOTE"),
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: pick(args.port, &lookup, "JAR_STORE_PORT", 3000)?,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            inline_threshold: pick(
                args.inline_threshold,
                &lookup,
                "JAR_STORE_INLINE_THRESHOLD",
                DEFAULT_INLINE_THRESHOLD,
            )?,
            sync_interval_secs: pick(
                args.sync_interval_secs,
                &lookup,
                "JAR_STORE_SYNC_INTERVAL_SECS",
                30,
            )?,
            remote_timeout_secs: pick(
                args.remote_timeout_secs,
                &lookup,
                "JAR_STORE_REMOTE_TIMEOUT_SECS",
                10,
            )?,
            remote: args.remote.unwrap_or(env_remote),
            camera: pick(args.camera, &lookup, "JAR_STORE_CAMERA", true)?,
        };

        if cfg.sync_interval_secs == 0 {
            bail!("sync interval must be at least one second");
        }
        if cfg.remote_timeout_secs == 0 {
            bail!("remote timeout must be at least one second");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

/// CLI value if given, else the parsed environment variable, else `default`.
fn pick<T, F>(arg: Option<T>, lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    if let Some(value) = arg {
        return Ok(value);
    }
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
