use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Command-line interface. Every flag falls back to an `INSIGHTVAULT_*`
/// environment variable, then to a built-in default.
#[derive(Parser, Debug)]
#[command(author, version, about = "InsightVault conversation-export upload service and client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the upload service
    Serve(ServeArgs),
    /// Upload a file to a running service
    Upload(UploadArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Host to bind to (overrides INSIGHTVAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides INSIGHTVAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded files and staged chunks live (overrides INSIGHTVAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides INSIGHTVAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bearer token clients must present (overrides INSIGHTVAULT_API_TOKEN)
    #[arg(long)]
    pub api_token: Option<String>,

    /// Seconds after which an unfinished chunked upload is discarded
    /// (overrides INSIGHTVAULT_STALE_UPLOAD_TTL_SECS)
    #[arg(long)]
    pub stale_upload_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Args, Debug, Default)]
pub struct UploadArgs {
    /// File to upload (.json, .txt or .md)
    pub path: PathBuf,

    /// Base URL of the upload service (overrides INSIGHTVAULT_API_URL)
    #[arg(long)]
    pub api_url: Option<String>,

    /// Bearer token (overrides INSIGHTVAULT_TOKEN)
    #[arg(long)]
    pub token: Option<String>,
}

/// Upload service configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub api_token: Option<String>,
    pub stale_upload_ttl: Duration,
}

/// Upload client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub token: Option<String>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub const DEFAULT_API_URL: &str = "http://localhost:8000";

impl ServerConfig {
    /// Merge CLI args over environment variables over defaults.
    pub fn from_args(args: &ServeArgs) -> Result<Self> {
        let env_host = env::var("INSIGHTVAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse::<u16>("INSIGHTVAULT_PORT")?.unwrap_or(8000);
        let env_storage =
            env::var("INSIGHTVAULT_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_db = env::var("INSIGHTVAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/insightvault.db".into());
        let env_token = env::var("INSIGHTVAULT_API_TOKEN").ok();
        let env_ttl = env_parse::<u64>("INSIGHTVAULT_STALE_UPLOAD_TTL_SECS")?.unwrap_or(86_400);

        Ok(Self {
            host: args.host.clone().unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.clone().unwrap_or(env_storage),
            database_url: args.database_url.clone().unwrap_or(env_db),
            api_token: args
                .api_token
                .clone()
                .or(env_token)
                .filter(|t| !t.is_empty()),
            stale_upload_ttl: Duration::from_secs(args.stale_upload_ttl_secs.unwrap_or(env_ttl)),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ClientConfig {
    pub fn from_args(args: &UploadArgs) -> Self {
        let env_url = env::var("INSIGHTVAULT_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into());
        let env_token = env::var("INSIGHTVAULT_TOKEN").ok();
        Self {
            api_url: args.api_url.clone().unwrap_or(env_url),
            token: args.token.clone().or(env_token).filter(|t| !t.is_empty()),
        }
    }
}

/// Parse an optional environment variable, failing on malformed values.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
