//! `proxyd`: the caching file proxy binary. Parses configuration, builds the
//! shared cache and origin client, and serves clients until killed.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use afscache::cache::Cache;
use afscache::config::Cli;
use afscache::dispatcher;
use afscache::rpc::{Origin, OriginServer, TcpOrigin};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::builder().with_default_directive(Level::INFO.into()).from_env_lossy())
        .init();

    let cli = Cli::parse();
    let config = cli.resolve().await?;

    info!(listen = %config.listen, cache_dir = ?config.cache_dir, cache_capacity = config.cache_capacity, "starting proxyd");

    tokio::fs::create_dir_all(&config.cache_dir).await?;
    let cache = Arc::new(Cache::new(config.cache_dir.clone(), config.cache_capacity));

    let origin: Arc<dyn Origin> = match &config.origin_addr {
        Some(addr) => {
            info!(%addr, "connecting to remote origin");
            Arc::new(TcpOrigin::connect(addr).await?)
        }
        None => {
            info!(origin_dir = ?config.origin_dir, "using bundled in-process origin");
            tokio::fs::create_dir_all(&config.origin_dir).await?;
            Arc::new(OriginServer::new(config.origin_dir.clone()))
        }
    };

    let listener = TcpListener::bind(config.listen).await?;
    info!(addr = %listener.local_addr()?, "listening for clients");
    dispatcher::serve(listener, cache, origin).await?;
    Ok(())
}
