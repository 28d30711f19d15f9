//! # Image storage
//!
//! The storage backends, the configuration which picks one of them at startup,
//! and the [`Storage`] facade which the rest of the service talks to.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
#[cfg(feature = "docker")]
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::Instrument;

pub mod document;
pub mod engine;
mod filesystem;
mod memory;
mod pipe;
#[cfg(test)]
mod testing;

use pipe::WriterPipe;

#[cfg(feature = "docker")]
pub mod docker;
#[cfg(feature = "mongodb")]
pub mod gridfs;

#[doc(inline)]
pub use document::{BlobSession, BlobStore, DocumentDriver};
#[doc(inline)]
pub use engine::{Engine, EngineDriver, EngineImage};
#[doc(inline)]
pub use filesystem::FilesystemDriver;
#[doc(inline)]
pub use memory::{MemoryBlobStore, MemorySession};
#[doc(inline)]
pub use pipe::{ImageReader, ImageWriter, DEFAULT_PIPE_CAPACITY};

#[cfg(feature = "docker")]
#[doc(inline)]
pub use docker::DockerEngine;
#[cfg(feature = "mongodb")]
#[doc(inline)]
pub use gridfs::GridFsStore;

#[doc(inline)]
pub use image_driver::{Driver, ImageError, ImageErrorKind, ImageName, Reader, Writer};

/// Selects and configures the storage backend.
///
/// In TOML:
///
/// ```toml
/// [storage.filesystem]
/// path = "/var/lib/images"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Files under a root directory.
    Filesystem {
        /// The root directory.
        path: Utf8PathBuf,
    },

    /// A Docker daemon.
    #[cfg(feature = "docker")]
    Engine {
        /// The daemon address. Defaults to `DOCKER_HOST` or the local socket.
        #[serde(default)]
        host: Option<String>,

        /// Request timeout in seconds.
        #[serde(default)]
        timeout: Option<u64>,
    },

    /// A MongoDB GridFS bucket.
    #[cfg(feature = "mongodb")]
    Document(GridFsStore),

    /// Blobs held in process memory. Nothing survives a restart.
    MemoryDocument,
}

impl StorageConfig {
    /// Connect the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, ImageError> {
        let storage: Storage = match self {
            StorageConfig::Filesystem { path } => FilesystemDriver::open(path).await?.into(),
            #[cfg(feature = "docker")]
            StorageConfig::Engine { host, timeout } => EngineDriver::new(DockerEngine::connect(
                host.as_deref(),
                timeout.map(Duration::from_secs),
            )?)
            .into(),
            #[cfg(feature = "mongodb")]
            StorageConfig::Document(store) => DocumentDriver::open(store).await?.into(),
            StorageConfig::MemoryDocument => {
                DocumentDriver::open(MemoryBlobStore::new()).await?.into()
            }
        };

        tracing::info!(driver = storage.name(), "Storage ready");
        Ok(storage)
    }
}

/// The storage facade: one backend, shared by every request.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: Arc<dyn Driver + Send + Sync>,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(driver: D) -> Self {
        Self::new(driver)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D>(driver: D) -> Self
    where
        D: Driver + Send + Sync + 'static,
    {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the backend.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// Store an image read from `reader`, replacing any image of the same name.
    #[tracing::instrument(skip_all, fields(driver = self.driver.name(), image = %image))]
    pub async fn write(&self, image: &ImageName, reader: &mut Reader<'_>) -> Result<(), ImageError> {
        self.driver.write(image, reader).await
    }

    /// Copy an image into `writer`.
    #[tracing::instrument(skip_all, fields(driver = self.driver.name(), image = %image))]
    pub async fn get(&self, image: &ImageName, writer: &mut Writer<'_>) -> Result<(), ImageError> {
        self.driver.get(image, writer).await
    }

    /// Delete an image.
    #[tracing::instrument(skip_all, fields(driver = self.driver.name(), image = %image))]
    pub async fn delete(&self, image: &ImageName) -> Result<(), ImageError> {
        self.driver.delete(image).await
    }

    /// List the stored images as `repository:tag` names, in no particular order.
    #[tracing::instrument(skip_all, fields(driver = self.driver.name()))]
    pub async fn list(&self) -> Result<Vec<String>, ImageError> {
        self.driver.list().await
    }

    /// Read an image as a stream.
    ///
    /// The image is copied out of storage on a separate task, through a pipe of
    /// [`DEFAULT_PIPE_CAPACITY`] bytes. Must be called within a tokio runtime.
    pub fn reader(&self, image: ImageName) -> ImageReader {
        let (tx, rx) = tokio::io::duplex(DEFAULT_PIPE_CAPACITY);
        let storage = self.clone();
        let producer = tokio::spawn(
            async move {
                let mut tx = tx;
                storage.get(&image, &mut tx).await
            }
            .in_current_span(),
        );
        ImageReader::new(self.name(), rx, producer)
    }

    /// Write an image as a stream.
    ///
    /// The image is copied into storage on a separate task, through a pipe of
    /// [`DEFAULT_PIPE_CAPACITY`] bytes. Must be called within a tokio runtime.
    /// The image is only stored once [`ImageWriter::finish`] is called.
    pub fn writer(&self, image: ImageName) -> ImageWriter {
        let (tx, rx) = tokio::io::duplex(DEFAULT_PIPE_CAPACITY);
        let finished = Arc::new(AtomicBool::new(false));
        let mut rx = WriterPipe::new(rx, Arc::clone(&finished));
        let storage = self.clone();
        let producer = tokio::spawn(
            async move {
                let result = storage.write(&image, &mut rx).await;
                if let Err(error) = &result {
                    tracing::debug!(%image, %error, "Streamed write failed");
                }
                result
            }
            .in_current_span(),
        );
        ImageWriter::new(self.name(), tx, finished, producer)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, root)
    }

    #[test]
    fn config_from_toml() {
        let config: StorageConfig =
            toml_edit::de::from_str("[filesystem]\npath = \"/var/lib/images\"\n").unwrap();
        assert!(matches!(
            config,
            StorageConfig::Filesystem { path } if path == "/var/lib/images"
        ));

        let config: StorageConfig =
            serde_json::from_str(r#""memory-document""#).unwrap();
        assert!(matches!(config, StorageConfig::MemoryDocument));
    }

    #[cfg(feature = "docker")]
    #[test]
    fn engine_config_defaults() {
        let config: StorageConfig = serde_json::from_str(r#"{"engine": {}}"#).unwrap();
        assert!(matches!(
            config,
            StorageConfig::Engine {
                host: None,
                timeout: None
            }
        ));
    }

    #[tokio::test]
    async fn build_filesystem() {
        let (_dir, root) = tempdir();
        let storage = StorageConfig::Filesystem { path: root }
            .build()
            .await
            .unwrap();
        assert_eq!(storage.name(), "filesystem");
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn facade_round_trip() {
        let storage = StorageConfig::MemoryDocument.build().await.unwrap();
        let image = ImageName::parse("app:v1");

        storage.write(&image, &mut &b"hello"[..]).await.unwrap();
        assert_eq!(storage.list().await.unwrap(), vec!["app:v1"]);

        let mut data = Vec::new();
        storage.get(&image, &mut data).await.unwrap();
        assert_eq!(data, b"hello");

        storage.delete(&image).await.unwrap();
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn streaming_handles() {
        let (_dir, root) = tempdir();
        let storage: Storage = FilesystemDriver::open(root).await.unwrap().into();
        let payload: Vec<u8> = (0..4 * DEFAULT_PIPE_CAPACITY).map(|n| n as u8).collect();

        let mut writer = storage.writer(ImageName::parse("big:v1"));
        writer.write_all(&payload).await.unwrap();
        writer.finish().await.unwrap();

        let mut reader = storage.reader(ImageName::parse("big:v1"));
        reader.ready().await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data.len(), payload.len());
        assert!(data == payload);
    }

    #[tokio::test]
    async fn reader_reports_missing_images_before_data() {
        let storage = StorageConfig::MemoryDocument.build().await.unwrap();

        let mut reader = storage.reader(ImageName::parse("missing"));
        let err = reader.ready().await.unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn reader_reports_errors_at_end_of_stream() {
        let storage = StorageConfig::MemoryDocument.build().await.unwrap();

        let mut reader = storage.reader(ImageName::parse("missing"));
        let err = reader.read_to_end(&mut Vec::new()).await.unwrap_err();
        let source = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ImageError>())
            .unwrap();
        assert!(source.is_not_found());
    }

    #[tokio::test]
    async fn abandoned_writers_store_nothing() {
        let store = MemoryBlobStore::new();
        let storage: Storage = DocumentDriver::open(store.clone()).await.unwrap().into();

        let mut writer = storage.writer(ImageName::parse("half:v1"));
        writer.write_all(b"first half of an archive").await.unwrap();
        drop(writer);

        let mut writer = storage.writer(ImageName::parse("closed:v1"));
        writer.write_all(b"first half of an archive").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        // One session to index the store, then one per write.
        while store.sessions_closed() < 3 {
            tokio::task::yield_now().await;
        }

        assert!(storage.list().await.unwrap().is_empty());
        assert_eq!(store.revisions("half:v1").await, 0);
        assert_eq!(store.revisions("closed:v1").await, 0);
        let err = storage
            .get(&ImageName::parse("half:v1"), &mut Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn writer_reports_driver_errors() {
        let (_dir, root) = tempdir();
        let storage: Storage = FilesystemDriver::open(root).await.unwrap().into();

        let mut writer = storage.writer(ImageName::parse("../escape:v1"));
        // The driver rejects the name without reading, so the write may or may not
        // see a closed pipe.
        let _ = writer.write_all(b"data").await;
        let err = writer.finish().await.unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::InvalidRequest);
    }
}
