use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

pub const MIB: u64 = 1024 * 1024;

/// Size policy shared by the server and the clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    /// Slice size for chunked uploads to the accumulator.
    pub chunk_size: usize,
    /// Slice size for resumable Drive transfers.
    pub drive_chunk_size: usize,
    /// Largest object the sink accepts; larger sources are split into parts.
    pub max_object_size: u64,
    /// Largest source the clients accept at all.
    pub max_source_size: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            chunk_size: MIB as usize,
            drive_chunk_size: 5 * MIB as usize,
            max_object_size: 50 * MIB,
            max_source_size: 500 * MIB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SessionBackend {
    /// Process-local map; sessions are lost on restart.
    Memory,
    /// `upload_chunks` table in the metadata database.
    Sqlite,
}

impl FromStr for SessionBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// OAuth refresh-token credentials and target folder for the Drive path.
#[derive(Clone, Default)]
pub struct DriveSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub folder_id: Option<String>,
    /// Endpoint overrides; the public Google endpoints when unset.
    pub upload_base: Option<String>,
    pub api_base: Option<String>,
    pub token_url: Option<String>,
}

impl fmt::Debug for DriveSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("folder_id", &self.folder_id)
            .field("upload_base", &self.upload_base)
            .field("api_base", &self.api_base)
            .field("token_url", &self.token_url)
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub public_base_url: String,
    pub session_backend: SessionBackend,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    /// Request body limit for one chunk submission.
    pub chunk_body_limit: usize,
    pub policy: UploadPolicy,
    pub drive: DriveSettings,
}

/// What the binary was asked to do.
#[derive(Debug, Clone)]
pub enum RunMode {
    Serve,
    Migrate,
    Push(PushArgs),
    Drive(DriveArgs),
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked large-file upload service")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides CHUNKED_UPLOAD_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Base URL used to build public object URLs (overrides CHUNKED_UPLOAD_PUBLIC_BASE_URL)
    #[arg(long, global = true)]
    pub public_base_url: Option<String>,

    /// Where in-flight chunks are kept (overrides CHUNKED_UPLOAD_SESSION_STORE)
    #[arg(long, value_enum, global = true)]
    pub session_store: Option<SessionBackend>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the upload server (default)
    Serve,
    /// Upload a file to a running server in chunks, splitting it into parts if needed
    Push(PushArgs),
    /// Upload a file to Google Drive using the resumable protocol
    Drive(DriveArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct PushArgs {
    /// File to upload
    pub path: PathBuf,

    /// Base URL of the upload server
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    pub server: String,

    /// MIME type to declare (defaults to application/octet-stream)
    #[arg(long)]
    pub content_type: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DriveArgs {
    /// File to upload
    pub path: PathBuf,

    /// MIME type to declare (defaults to application/octet-stream)
    #[arg(long)]
    pub content_type: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CHUNKED_UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("CHUNKED_UPLOAD_PORT", 3000u16)?;
        let env_storage =
            env::var("CHUNKED_UPLOAD_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("CHUNKED_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/uploads.db".into());
        let env_backend = env_or("CHUNKED_UPLOAD_SESSION_STORE", SessionBackend::Memory)?;

        let port = args.port.unwrap_or(env_port);
        let public_base_url = args
            .public_base_url
            .or_else(|| env::var("CHUNKED_UPLOAD_PUBLIC_BASE_URL").ok())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", port));

        let defaults = UploadPolicy::default();
        let policy = UploadPolicy {
            chunk_size: env_or("CHUNKED_UPLOAD_CHUNK_SIZE", defaults.chunk_size)?,
            drive_chunk_size: env_or("CHUNKED_UPLOAD_DRIVE_CHUNK_SIZE", defaults.drive_chunk_size)?,
            max_object_size: env_or("CHUNKED_UPLOAD_MAX_OBJECT_SIZE", defaults.max_object_size)?,
            max_source_size: env_or("CHUNKED_UPLOAD_MAX_SOURCE_SIZE", defaults.max_source_size)?,
        };
        if policy.chunk_size == 0 || policy.drive_chunk_size == 0 {
            anyhow::bail!("chunk sizes must be greater than zero");
        }

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            bucket: env::var("CHUNKED_UPLOAD_BUCKET").unwrap_or_else(|_| "attachments".into()),
            public_base_url,
            session_backend: args.session_store.unwrap_or(env_backend),
            session_ttl: Duration::from_secs(env_or("CHUNKED_UPLOAD_SESSION_TTL_SECS", 3600u64)?),
            sweep_interval: Duration::from_secs(env_or(
                "CHUNKED_UPLOAD_SWEEP_INTERVAL_SECS",
                60u64,
            )?),
            chunk_body_limit: env_or("CHUNKED_UPLOAD_CHUNK_BODY_LIMIT", 8 * MIB as usize)?,
            policy,
            drive: DriveSettings {
                client_id: env::var("GOOGLE_CLIENT_ID").ok(),
                client_secret: env::var("GOOGLE_CLIENT_SECRET").ok(),
                refresh_token: env::var("GOOGLE_REFRESH_TOKEN").ok(),
                folder_id: env::var("GOOGLE_DRIVE_FOLDER_ID")
                    .ok()
                    .filter(|v| !v.is_empty()),
                upload_base: env::var("GOOGLE_DRIVE_UPLOAD_BASE").ok(),
                api_base: env::var("GOOGLE_DRIVE_API_BASE").ok(),
                token_url: env::var("GOOGLE_TOKEN_URL").ok(),
            },
        };

        let mode = match (args.migrate, args.command) {
            (true, _) => RunMode::Migrate,
            (false, None | Some(Command::Serve)) => RunMode::Serve,
            (false, Some(Command::Push(push))) => RunMode::Push(push),
            (false, Some(Command::Drive(drive))) => RunMode::Drive(drive),
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
