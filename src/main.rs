use anyhow::{Context, Result};
use axum::Router;
use bytes::Bytes;
use chunked_upload::{
    client::{chunk_uploader::ChunkUploader, part_splitter::UploadResult},
    config::{self, AppConfig, DriveArgs, PushArgs, SessionBackend},
    db, routes,
    services::{
        accumulator::ChunkAccumulator,
        session_store::{
            InMemorySessionStore, SessionStore, SqliteSessionStore, spawn_session_sweeper,
        },
        storage_service::{DEFAULT_CONTENT_TYPE, LocalDiskSink, StorageSink},
    },
    state::{AppState, DriveTarget},
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

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    match mode {
        config::RunMode::Serve => serve(cfg, false).await,
        config::RunMode::Migrate => serve(cfg, true).await,
        config::RunMode::Push(args) => push(cfg, args).await,
        config::RunMode::Drive(args) => drive(cfg, args).await,
    }
}

async fn serve(cfg: AppConfig, migrate_only: bool) -> Result<()> {
    tracing::info!("Starting chunked-upload with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(
        db::connect(&cfg.database_url, 5)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?,
    );
    db::run_migrations(&db).await?;
    if migrate_only {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core services ---
    let sessions: Arc<dyn SessionStore> = match cfg.session_backend {
        SessionBackend::Memory => Arc::new(InMemorySessionStore::new()),
        SessionBackend::Sqlite => Arc::new(SqliteSessionStore::new(db.clone())),
    };
    let storage = LocalDiskSink::new(
        db.clone(),
        cfg.storage_dir.clone(),
        cfg.bucket.clone(),
        cfg.public_base_url.clone(),
        cfg.policy.max_object_size,
    );
    let sink: Arc<dyn StorageSink> = Arc::new(storage.clone());
    let accumulator = ChunkAccumulator::new(sessions.clone(), sink, cfg.policy.max_object_size);

    let drive = match DriveTarget::from_settings(&cfg.drive, cfg.policy.drive_chunk_size) {
        Ok(target) => Some(target),
        Err(err) => {
            tracing::info!("Drive endpoints disabled: {}", err);
            None
        }
    };

    let _sweeper = spawn_session_sweeper(sessions, cfg.session_ttl, cfg.sweep_interval);

    let state = AppState {
        accumulator,
        storage,
        drive,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(
        cfg.chunk_body_limit,
        cfg.policy.max_object_size,
        cfg.policy.max_source_size,
    )
    .with_state(state);

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
    axum::serve(listener, app).await?;

    Ok(())
}

/// Read a local file and derive the name it is uploaded under.
async fn read_source(path: &Path) -> Result<(Bytes, String)> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("source path has no file name")?
        .to_string();
    Ok((Bytes::from(data), name))
}

async fn push(cfg: AppConfig, args: PushArgs) -> Result<()> {
    let (source, name) = read_source(&args.path).await?;
    let uploader = ChunkUploader::new(&args.server, cfg.policy)?;

    let mut last_percent = 0;
    let result = uploader
        .upload_large_object(source, &name, args.content_type.as_deref(), |p| {
            let percent = (p * 100.0).round() as u32;
            if percent >= last_percent + 10 || percent == 100 {
                tracing::info!("{}: {}%", name, percent);
                last_percent = percent;
            }
        })
        .await?;

    match &result {
        UploadResult::Single(object) => {
            println!("{} ({} bytes): {}", object.file_name, object.file_size, object.url);
        }
        UploadResult::Split(parts) => {
            for part in parts {
                println!("{} ({} bytes): {}", part.file_name, part.file_size, part.url);
            }
        }
    }
    Ok(())
}

async fn drive(cfg: AppConfig, args: DriveArgs) -> Result<()> {
    let (source, name) = read_source(&args.path).await?;
    if source.len() as u64 > cfg.policy.max_source_size {
        anyhow::bail!(
            "{} is {} bytes, above the {} byte upload limit",
            name,
            source.len(),
            cfg.policy.max_source_size
        );
    }

    let client = DriveTarget::from_settings(&cfg.drive, cfg.policy.drive_chunk_size)?
        .client()
        .await?;

    let content_type = args.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
    let file = client
        .upload(source, &name, content_type, |p| {
            tracing::info!("{}: {:.0}%", name, p * 100.0)
        })
        .await?;

    println!("{}: {}", name, file.view_url);
    Ok(())
}
