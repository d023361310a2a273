use anyhow::Result;
use axum::Router;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    object_store::DiskObjectStore, staging::StagingArea, upload_service::UploadService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    info!("Starting picstash with config: {:?}", cfg);

    // --- Ensure staging and storage directories exist ---
    for dir in [&cfg.staging_dir, &cfg.storage_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            info!("Created directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true);
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        run_migrations(&db).await?;
        info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let staging = StagingArea::new(cfg.staging_dir.clone());
    staging.ensure_dir().await?;
    let store = Arc::new(DiskObjectStore::new(cfg.storage_dir.clone()));
    let service = UploadService::new(db, staging, store);

    // --- Reap abandoned sessions in the background ---
    spawn_session_reaper(service.clone(), cfg.stale_after_secs);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr, err, fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Run SQLite migrations manually from the embedded SQL file.
async fn run_migrations(db: &Arc<sqlx::Pool<sqlx::Sqlite>>) -> Result<()> {
    let path = "migrations/0001_init.sql";

    if !Path::new(path).exists() {
        anyhow::bail!("Migration file not found: {}", path);
    }

    let sql = fs::read_to_string(path)?;
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(&**db).await?;
    }

    Ok(())
}

/// Periodically abort active sessions with no activity for `stale_after_secs`.
///
/// The sweep reuses the service's reaper interface (`list_stale_sessions` +
/// `abort_session`), so each abort runs under the same per-session lock as
/// client traffic.
fn spawn_session_reaper(service: UploadService, stale_after_secs: u64) {
    let stale_after = chrono::Duration::seconds(stale_after_secs as i64);
    let period = Duration::from_secs((stale_after_secs / 2).max(60));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - stale_after;
            let stale = match service.list_stale_sessions(cutoff).await {
                Ok(stale) => stale,
                Err(err) => {
                    warn!(error = %err, "stale session sweep failed");
                    continue;
                }
            };
            for session in stale {
                match service.abort_session(session.id).await {
                    Ok(()) => info!(session = %session.id, "reaped stale upload session"),
                    Err(err) => {
                        warn!(session = %session.id, error = %err, "failed to reap stale session")
                    }
                }
            }
        }
    });
}
