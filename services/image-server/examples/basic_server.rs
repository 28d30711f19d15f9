//! Basic image server example
//!
//! Run with: cargo run -p image-server --example basic_server -- /tmp/images

use camino::Utf8PathBuf;
use image_server::ImageServiceBuilder;
use image_storage::StorageConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let path: Utf8PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "images".to_owned())
        .into();

    let storage = StorageConfig::Filesystem { path }.build().await?;
    let app = ImageServiceBuilder::new().storage(storage).build()?;

    let addr = "127.0.0.1:8080";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Image server listening on http://{}", addr);
    tracing::info!(
        "Try: curl --data-binary @image.tar http://{}/image/save/app/v1",
        addr
    );

    axum::serve(listener, app).await?;

    Ok(())
}
