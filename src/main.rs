use anyhow::{Context, Result};
use clap::Parser;
use insightvault::{
    client::{ProgressEvent, UploadClient, UploadFile},
    config::{Cli, ClientConfig, Command, ServeArgs, ServerConfig, UploadArgs},
    db,
    services::{storage_service::FileStorage, sweeper::spawn_stale_upload_sweeper},
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Upload(args) => upload(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cfg = ServerConfig::from_args(&args)?;
    tracing::info!(
        host = %cfg.host,
        port = cfg.port,
        storage_dir = %cfg.storage_dir,
        database_url = %cfg.database_url,
        auth = if cfg.api_token.is_some() { "token" } else { "any-bearer" },
        stale_upload_ttl_secs = cfg.stale_upload_ttl.as_secs(),
        "Starting insightvault"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite and schema ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;
    if args.migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let storage = FileStorage::new(db, cfg.storage_dir.clone());
    spawn_stale_upload_sweeper(storage.clone(), cfg.stale_upload_ttl);

    let app = insightvault::app(storage, cfg.api_token.clone());

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
        Err(err) => return Err(err).with_context(|| format!("binding {}", addr)),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn upload(args: UploadArgs) -> Result<()> {
    let cfg = ClientConfig::from_args(&args);
    tracing::debug!(?cfg, "client configuration");

    let file = UploadFile::open(&args.path)
        .await
        .with_context(|| format!("opening {}", args.path.display()))?;
    let client = UploadClient::from_config(&cfg);

    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            tracing::info!(
                phase = ?event.phase,
                completed = event.completed_chunks,
                total = event.total_chunks,
                "{:.0}%",
                event.percent
            );
            if event.phase.is_terminal() {
                break;
            }
        }
    });

    let outcome = client.upload_with_progress(&file, Some(tx)).await;
    let _ = reporter.await;

    let result = outcome.map_err(|err| anyhow::anyhow!("{}", err))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
