//! Image service binary.
//!
//! Loads a TOML configuration, connects the configured storage backend and
//! serves the HTTP API.

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use image_server::ImageServiceBuilder;
use image_storage::StorageConfig;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Serve container images over HTTP.
#[derive(Debug, Parser)]
#[command(name = "image-server", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on. Overrides the configuration file.
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default)]
    listen: Option<SocketAddr>,

    #[serde(default = "in_memory")]
    storage: StorageConfig,
}

fn in_memory() -> StorageConfig {
    StorageConfig::MemoryDocument
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            storage: in_memory(),
        }
    }
}

impl ServerConfig {
    async fn load(path: &camino::Utf8Path) -> eyre::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("reading {path}"))?;
        toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {path}"))
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ServerConfig::load(path).await?,
        None => {
            tracing::warn!("No configuration given, images are kept in memory");
            ServerConfig::default()
        }
    };

    let listen = match args.listen.or(config.listen) {
        Some(listen) => listen,
        None => DEFAULT_LISTEN.parse()?,
    };

    let storage = config
        .storage
        .build()
        .await
        .wrap_err("connecting storage backend")?;
    let app = ImageServiceBuilder::new().storage(storage).build()?;

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .wrap_err_with(|| format!("binding {listen}"))?;
    tracing::info!("Image service listening on http://{listen}");

    axum::serve(listener, app).await?;
    Ok(())
}
