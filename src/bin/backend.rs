#![forbid(unsafe_code)]

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{error, info};
use reelstory::{
    api::{self, AppState},
    catalog::Catalog,
    config::{default_config_path, load_runtime_config_from},
    session::SupabaseSessions,
    storage,
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the ReelStory JSON API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", help = "Path to the env file")]
    config: Option<PathBuf>,
    #[arg(long = "host", value_name = "ADDR", help = "Override REELSTORY_HOST")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Override REELSTORY_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_runtime_config_from(&config_path)?;

    let supabase = config
        .supabase
        .as_ref()
        .ok_or_else(|| anyhow!("SUPABASE_URL and SUPABASE_ANON_KEY must be set"))?;

    let catalog = Catalog::open(&config.database_path).with_context(|| {
        format!("opening catalog at {}", config.database_path.display())
    })?;
    let state = AppState::new(
        catalog,
        Arc::new(SupabaseSessions::new(supabase)),
        storage::from_config(&config.storage),
        config.sync.clone(),
        config.cache_ttl,
    );
    let app = api::router(state);

    let host = cli.host.unwrap_or(config.host);
    let port = cli.port.unwrap_or(config.port);
    let addr = SocketAddr::new(
        host.parse()
            .with_context(|| format!("parsing listen host {host:?}"))?,
        port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {err}");
    }
}
