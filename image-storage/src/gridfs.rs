//! MongoDB GridFS as a blob store.

use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::error::{Error as MongoError, ErrorKind, GridFsErrorKind};
use mongodb::gridfs::GridFsBucket;
use mongodb::options::GridFsBucketOptions;
use mongodb::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

use image_driver::{ImageError, ImageErrorKind, Reader, Writer};

use crate::document::{BlobSession, BlobStore};

const ENGINE: &str = "gridfs";

/// The GridFS bucket used when none is configured.
pub const DEFAULT_PREFIX: &str = "fs";

/// Connection parameters for a GridFS bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct GridFsStore {
    url: String,
    database: String,
    #[serde(default = "default_prefix")]
    prefix: String,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_owned()
}

impl GridFsStore {
    /// Parameters for the bucket `prefix` in `database` at `url`.
    pub fn new(url: impl Into<String>, database: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            prefix: prefix.unwrap_or_else(default_prefix),
        }
    }

    /// The bucket name.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn mongo_kind(err: &MongoError) -> ImageErrorKind {
    match err.kind.as_ref() {
        ErrorKind::GridFs(GridFsErrorKind::FileNotFound { .. }) => ImageErrorKind::NotFound,
        ErrorKind::ServerSelection { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => ImageErrorKind::Connection,
        ErrorKind::Io(err) => ImageErrorKind::from_io(err),
        ErrorKind::InvalidArgument { .. } => ImageErrorKind::InvalidRequest,
        _ => ImageErrorKind::Other,
    }
}

fn failed(name: &str, context: &'static str) -> impl FnOnce(MongoError) -> ImageError {
    let identifier = name.to_owned();
    move |err| {
        ImageError::builder(ENGINE, mongo_kind(&err), err)
            .identifier(identifier)
            .context(context)
            .build()
    }
}

fn stream_failed(name: &str, context: &'static str) -> impl FnOnce(std::io::Error) -> ImageError {
    let identifier = name.to_owned();
    move |err| {
        ImageError::io(ENGINE)(err)
            .with_identifier(identifier)
            .with_context(context)
    }
}

#[async_trait::async_trait]
impl BlobStore for GridFsStore {
    type Session = GridFsSession;

    fn name(&self) -> &'static str {
        ENGINE
    }

    #[tracing::instrument(skip(self), fields(database = %self.database, bucket = %self.prefix))]
    async fn connect(&self) -> Result<GridFsSession, ImageError> {
        let client = Client::with_uri_str(&self.url).await.map_err(|err| {
            ImageError::builder(ENGINE, ImageErrorKind::Connection, err)
                .context("connect to database")
                .build()
        })?;

        let options = GridFsBucketOptions::builder()
            .bucket_name(self.prefix.clone())
            .build();
        let bucket = client.database(&self.database).gridfs_bucket(options);

        Ok(GridFsSession { client, bucket })
    }
}

/// A client connection and the bucket it serves.
#[derive(Debug)]
pub struct GridFsSession {
    client: Client,
    bucket: GridFsBucket,
}

#[async_trait::async_trait]
impl BlobSession for GridFsSession {
    async fn filenames(&mut self) -> Result<Vec<String>, ImageError> {
        let files: Vec<_> = self
            .bucket
            .find(doc! {})
            .await
            .map_err(|err| ImageError::new(ENGINE, mongo_kind(&err), err))?
            .try_collect()
            .await
            .map_err(|err| ImageError::new(ENGINE, mongo_kind(&err), err))?;

        Ok(files.into_iter().filter_map(|file| file.filename).collect())
    }

    async fn upload(&mut self, name: &str, reader: &mut Reader<'_>) -> Result<(), ImageError> {
        let mut upload = self
            .bucket
            .open_upload_stream(name)
            .await
            .map_err(failed(name, "open upload stream"))?;

        // A dropped upload stream is aborted, so an error here leaves no revision.
        futures::io::copy(TokioAsyncReadCompatExt::compat(reader), &mut upload)
            .await
            .map_err(stream_failed(name, "upload image"))?;
        futures::io::AsyncWriteExt::close(&mut upload)
            .await
            .map_err(stream_failed(name, "commit upload"))?;
        Ok(())
    }

    async fn download(&mut self, name: &str, writer: &mut Writer<'_>) -> Result<(), ImageError> {
        let download = self
            .bucket
            .open_download_stream_by_name(name)
            .await
            .map_err(failed(name, "open download stream"))?;

        let mut download = FuturesAsyncReadCompatExt::compat(download);
        tokio::io::copy(&mut download, writer)
            .await
            .map_err(stream_failed(name, "download image"))?;

        writer
            .flush()
            .await
            .map_err(stream_failed(name, "flush download"))
    }

    async fn remove(&mut self, name: &str) -> Result<(), ImageError> {
        self.bucket
            .delete_by_name(name)
            .await
            .map_err(failed(name, "remove revisions"))
    }

    async fn close(self) {
        let Self { client, bucket } = self;
        drop(bucket);
        client.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bucket() {
        let store: GridFsStore =
            serde_json::from_str(r#"{"url": "mongodb://localhost", "database": "images"}"#)
                .unwrap();
        assert_eq!(store.prefix(), "fs");

        let store = GridFsStore::new("mongodb://localhost", "images", Some("images".into()));
        assert_eq!(store.prefix(), "images");
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err = MongoError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(mongo_kind(&err), ImageErrorKind::Connection);
    }
}
