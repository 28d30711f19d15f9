//! Backends which keep images as blobs in a document database.

use std::fmt;

use image_driver::{Driver, ImageError, ImageName, IndexError, NameIndex, Reader, Writer};

/// A document database with a chunked blob facility.
///
/// A store holds connection parameters only. Every operation connects a fresh
/// [`BlobSession`] and closes it again.
#[async_trait::async_trait]
pub trait BlobStore: fmt::Debug + Send + Sync {
    /// The session type for this store.
    type Session: BlobSession;

    /// The name of the store, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Open a session.
    async fn connect(&self) -> Result<Self::Session, ImageError>;
}

/// A live connection to a blob store.
///
/// Blobs are keyed by file name. Uploading a name which exists adds a revision,
/// and readers always see the latest revision.
#[async_trait::async_trait]
pub trait BlobSession: Send {
    /// The file names of every stored revision.
    async fn filenames(&mut self) -> Result<Vec<String>, ImageError>;

    /// Store a new revision named `name`.
    async fn upload(&mut self, name: &str, reader: &mut Reader<'_>) -> Result<(), ImageError>;

    /// Copy the latest revision named `name` into `writer`.
    async fn download(&mut self, name: &str, writer: &mut Writer<'_>) -> Result<(), ImageError>;

    /// Remove every revision named `name`, failing with `NotFound` when there
    /// are none.
    async fn remove(&mut self, name: &str) -> Result<(), ImageError>;

    /// Release the connection.
    async fn close(self);
}

/// A backend which keeps images as blobs in a document database.
#[derive(Debug)]
pub struct DocumentDriver<S> {
    store: S,
    index: NameIndex,
}

impl<S: BlobStore> DocumentDriver<S> {
    /// Connect to `store` and index the blobs it already holds.
    #[tracing::instrument(skip_all, fields(store = store.name()))]
    pub async fn open(store: S) -> Result<Self, ImageError> {
        let mut session = store.connect().await?;
        let names = session.filenames().await;
        session.close().await;

        let names = names?;
        tracing::debug!("Found {} blob revisions", names.len());

        Ok(Self {
            store,
            index: names.into_iter().collect(),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait::async_trait]
impl<S: BlobStore> Driver for DocumentDriver<S> {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    async fn write(&self, image: &ImageName, reader: &mut Reader<'_>) -> Result<(), ImageError> {
        let name = image.to_string();
        let mut session = self.store.connect().await?;

        let mut replaced = false;
        let result = async {
            match session.remove(&name).await {
                Ok(()) => {
                    replaced = true;
                    tracing::trace!(%name, "Removed previous revisions");
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            session.upload(&name, reader).await
        }
        .await;
        session.close().await;

        if let Err(err) = result {
            // The previous revisions are gone, so the name is too.
            if replaced && self.index.remove(&name).is_ok() {
                tracing::debug!(%name, "Dropped image replaced by a failed write");
            }
            return Err(err);
        }

        if let Err(IndexError::Duplicate(name)) = self.index.add(name) {
            tracing::trace!(%name, "Replaced existing image");
        }
        Ok(())
    }

    async fn get(&self, image: &ImageName, writer: &mut Writer<'_>) -> Result<(), ImageError> {
        let mut session = self.store.connect().await?;
        let result = session.download(&image.to_string(), writer).await;
        session.close().await;
        result
    }

    async fn delete(&self, image: &ImageName) -> Result<(), ImageError> {
        let name = image.to_string();
        let mut session = self.store.connect().await?;
        let result = session.remove(&name).await;
        session.close().await;
        result?;

        if let Err(IndexError::NotFound(name)) = self.index.remove(&name) {
            tracing::debug!(%name, "Deleted an image which was not indexed");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, ImageError> {
        Ok(self.index.names())
    }
}

#[cfg(test)]
mod tests {
    use image_driver::ImageErrorKind;

    use super::*;
    use crate::memory::MemoryBlobStore;
    use crate::testing::interrupted;

    async fn read(driver: &DocumentDriver<MemoryBlobStore>, name: &str) -> Result<Vec<u8>, ImageError> {
        let mut data = Vec::new();
        driver.get(&ImageName::parse(name), &mut data).await?;
        Ok(data)
    }

    fn assert_sessions_released(store: &MemoryBlobStore) {
        assert!(store.sessions_opened() > 0);
        assert_eq!(store.sessions_opened(), store.sessions_closed());
    }

    #[tokio::test]
    async fn round_trip() {
        let store = MemoryBlobStore::new();
        let driver = DocumentDriver::open(store.clone()).await.unwrap();
        let image = ImageName::parse("app:v1");

        driver.write(&image, &mut &b"hello"[..]).await.unwrap();
        assert_eq!(driver.list().await.unwrap(), vec!["app:v1"]);
        assert_eq!(read(&driver, "app:v1").await.unwrap(), b"hello");

        driver.delete(&image).await.unwrap();
        assert!(driver.list().await.unwrap().is_empty());
        let err = read(&driver, "app:v1").await.unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::NotFound);

        assert_sessions_released(&store);
    }

    #[tokio::test]
    async fn overwrite_keeps_one_revision() {
        let store = MemoryBlobStore::new();
        let driver = DocumentDriver::open(store.clone()).await.unwrap();
        let image = ImageName::parse("app");

        driver.write(&image, &mut &b"first"[..]).await.unwrap();
        driver.write(&image, &mut &b"second"[..]).await.unwrap();

        assert_eq!(driver.list().await.unwrap(), vec!["app:latest"]);
        assert_eq!(read(&driver, "app:latest").await.unwrap(), b"second");
        assert_eq!(store.revisions("app:latest").await, 1);
    }

    #[tokio::test]
    async fn open_indexes_existing_blobs_once() {
        let store = MemoryBlobStore::new();
        store.insert("redis:latest", b"one".to_vec()).await;
        store.insert("redis:latest", b"two".to_vec()).await;
        store.insert("nginx:1.25", b"three".to_vec()).await;

        let driver = DocumentDriver::open(store.clone()).await.unwrap();
        let mut names = driver.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["nginx:1.25", "redis:latest"]);

        assert_eq!(read(&driver, "redis").await.unwrap(), b"two");
        assert_sessions_released(&store);
    }

    #[tokio::test]
    async fn failing_operations_release_sessions() {
        let store = MemoryBlobStore::new();
        let driver = DocumentDriver::open(store.clone()).await.unwrap();

        let err = driver
            .delete(&ImageName::parse("missing:v1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::NotFound);

        let err = read(&driver, "missing:v1").await.unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::NotFound);

        let err = driver
            .write(&ImageName::parse("broken:v1"), &mut interrupted(b"partial"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::Io);

        assert_eq!(store.sessions_opened(), 4);
        assert_sessions_released(&store);
        assert!(driver.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_overwrite_drops_the_name() {
        let store = MemoryBlobStore::new();
        let driver = DocumentDriver::open(store.clone()).await.unwrap();
        let image = ImageName::parse("app:v1");

        driver.write(&image, &mut &b"good"[..]).await.unwrap();
        let err = driver
            .write(&image, &mut interrupted(b"bad"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::Io);

        assert!(driver.list().await.unwrap().is_empty());
        let err = read(&driver, "app:v1").await.unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::NotFound);
        assert_sessions_released(&store);

        driver.write(&image, &mut &b"again"[..]).await.unwrap();
        assert_eq!(driver.list().await.unwrap(), vec!["app:v1"]);
        assert_eq!(read(&driver, "app:v1").await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn blobs_written_behind_the_index_are_deletable() {
        let store = MemoryBlobStore::new();
        let driver = DocumentDriver::open(store.clone()).await.unwrap();
        store.insert("late:v1", b"x".to_vec()).await;

        assert!(driver.list().await.unwrap().is_empty());
        driver.delete(&ImageName::parse("late:v1")).await.unwrap();
        assert_eq!(store.revisions("late:v1").await, 0);
    }
}
