//! Configuration and CLI surface for the `proxyd` binary (C8).
//!
//! A [`FileConfig`] is parsed from an optional TOML file; [`Cli`] carries the
//! same fields as overridable flags. `Cli::resolve` layers CLI flags over the
//! file over hardcoded defaults, CLI winning.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

const DEFAULT_LISTEN: &str = "0.0.0.0:8900";
const DEFAULT_CACHE_DIR: &str = "/var/cache/afscache";
const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 1024 * 1024 * 1024;

/// Command-line flags for `proxyd`.
#[derive(Parser, Debug)]
#[command(name = "proxyd")]
#[command(about = "Caching file proxy with check-on-open consistency")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML config file. CLI flags override values it sets.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to accept client connections on.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Directory to hold cached file copies.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Byte budget for cached file copies.
    #[arg(long)]
    pub cache_capacity: Option<u64>,

    /// Address of a remote origin server to connect to over TCP. If absent, a
    /// bundled in-process origin rooted at `origin-dir` is used instead.
    #[arg(long)]
    pub origin_addr: Option<String>,

    /// Root directory for the bundled in-process origin server, used when
    /// `origin-addr` is not given.
    #[arg(long)]
    pub origin_dir: Option<PathBuf>,
}

/// Fields loadable from a TOML config file. Every field is optional so a
/// partial file only overrides what it names.
#[derive(Deserialize, Debug, Default)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub cache_dir: Option<PathBuf>,
    pub cache_capacity: Option<u64>,
    pub origin_addr: Option<String>,
    pub origin_dir: Option<PathBuf>,
}

impl FileConfig {
    pub async fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        toml::from_str(&text)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
    }
}

/// Fully resolved configuration, CLI flags over file values over defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub cache_dir: PathBuf,
    pub cache_capacity: u64,
    pub origin_addr: Option<String>,
    pub origin_dir: PathBuf,
}

impl Cli {
    /// Load the config file (if `--config` was given) and layer these CLI
    /// flags over it, falling back to built-in defaults for anything unset.
    pub async fn resolve(&self) -> std::io::Result<Config> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path).await?,
            None => FileConfig::default(),
        };

        Ok(Config {
            listen: self
                .listen
                .or(file.listen)
                .unwrap_or_else(|| DEFAULT_LISTEN.parse().expect("valid default listen addr")),
            cache_dir: self
                .cache_dir
                .clone()
                .or(file.cache_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            cache_capacity: self.cache_capacity.or(file.cache_capacity).unwrap_or(DEFAULT_CACHE_CAPACITY_BYTES),
            origin_addr: self.origin_addr.clone().or(file.origin_addr),
            origin_dir: self
                .origin_dir
                .clone()
                .or(file.origin_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR).join("origin")),
        })
    }
}
