use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub staging_dir: String,
    pub storage_dir: String,
    pub database_url: String,
    /// Seconds of inactivity after which an active session is reaped.
    pub stale_after_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable upload backend for photo/media assets")]
pub struct Args {
    /// Host to bind to (overrides PICSTASH_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PICSTASH_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for in-flight staging files (overrides PICSTASH_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Directory where finalized assets are stored (overrides PICSTASH_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PICSTASH_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds before idle sessions are reaped (overrides PICSTASH_STALE_AFTER_SECS)
    #[arg(long)]
    pub stale_after_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("PICSTASH_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("PICSTASH_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing PICSTASH_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading PICSTASH_PORT"),
        };
        let env_staging =
            env::var("PICSTASH_STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_storage =
            env::var("PICSTASH_STORAGE_DIR").unwrap_or_else(|_| "./data/assets".into());
        let env_db = env::var("PICSTASH_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/picstash.db".into());
        let env_stale = match env::var("PICSTASH_STALE_AFTER_SECS") {
            Ok(value) => value
                .parse::<u64>()
                .with_context(|| format!("parsing PICSTASH_STALE_AFTER_SECS value `{}`", value))?,
            Err(env::VarError::NotPresent) => 24 * 60 * 60,
            Err(err) => return Err(err).context("reading PICSTASH_STALE_AFTER_SECS"),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            stale_after_secs: args.stale_after_secs.unwrap_or(env_stale),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
