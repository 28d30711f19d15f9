use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use image_driver::{ImageError, ImageErrorKind, Reader, Writer};

use crate::document::{BlobSession, BlobStore};

const ENGINE: &str = "memory-document";

#[derive(Debug)]
struct Revision {
    filename: String,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    revisions: Mutex<Vec<Revision>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// A blob store held in process memory.
///
/// Behaves like a document database's blob facility: uploads add revisions,
/// downloads read the latest one, and removal drops them all. Clones share the
/// same contents, and the store counts sessions so callers can check that each
/// one was closed.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Inner>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a revision directly, without a session.
    pub async fn insert(&self, filename: impl Into<String>, data: Vec<u8>) {
        self.inner.revisions.lock().await.push(Revision {
            filename: filename.into(),
            data,
        });
    }

    /// The number of revisions stored under `filename`.
    pub async fn revisions(&self, filename: &str) -> usize {
        self.inner
            .revisions
            .lock()
            .await
            .iter()
            .filter(|revision| revision.filename == filename)
            .count()
    }

    /// The number of sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// The number of sessions closed so far.
    pub fn sessions_closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    type Session = MemorySession;

    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn connect(&self) -> Result<MemorySession, ImageError> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            inner: self.inner.clone(),
        })
    }
}

/// A session on a [`MemoryBlobStore`].
#[derive(Debug)]
pub struct MemorySession {
    inner: Arc<Inner>,
}

fn not_found(name: &str) -> ImageError {
    ImageError::builder(
        ENGINE,
        ImageErrorKind::NotFound,
        format!("no blob named {name}"),
    )
    .identifier(name)
    .build()
}

#[async_trait::async_trait]
impl BlobSession for MemorySession {
    async fn filenames(&mut self) -> Result<Vec<String>, ImageError> {
        Ok(self
            .inner
            .revisions
            .lock()
            .await
            .iter()
            .map(|revision| revision.filename.clone())
            .collect())
    }

    async fn upload(&mut self, name: &str, reader: &mut Reader<'_>) -> Result<(), ImageError> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(ImageError::io(ENGINE))
            .map_err(|err| err.with_identifier(name).with_context("read upload"))?;

        self.inner.revisions.lock().await.push(Revision {
            filename: name.to_owned(),
            data,
        });
        Ok(())
    }

    async fn download(&mut self, name: &str, writer: &mut Writer<'_>) -> Result<(), ImageError> {
        let data = self
            .inner
            .revisions
            .lock()
            .await
            .iter()
            .rev()
            .find(|revision| revision.filename == name)
            .map(|revision| revision.data.clone())
            .ok_or_else(|| not_found(name))?;

        writer
            .write_all(&data)
            .await
            .map_err(ImageError::io(ENGINE))
            .map_err(|err| err.with_identifier(name).with_context("write download"))?;
        writer
            .flush()
            .await
            .map_err(ImageError::io(ENGINE))
            .map_err(|err| err.with_identifier(name).with_context("flush download"))
    }

    async fn remove(&mut self, name: &str) -> Result<(), ImageError> {
        let mut revisions = self.inner.revisions.lock().await;
        let before = revisions.len();
        revisions.retain(|revision| revision.filename != name);

        if revisions.len() == before {
            return Err(not_found(name));
        }
        Ok(())
    }

    async fn close(self) {
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_revision_wins() {
        let store = MemoryBlobStore::new();
        let mut session = store.connect().await.unwrap();

        session.upload("app:v1", &mut &b"one"[..]).await.unwrap();
        session.upload("app:v1", &mut &b"two"[..]).await.unwrap();
        assert_eq!(store.revisions("app:v1").await, 2);

        let mut data = Vec::new();
        session.download("app:v1", &mut data).await.unwrap();
        assert_eq!(data, b"two");

        session.remove("app:v1").await.unwrap();
        assert_eq!(store.revisions("app:v1").await, 0);

        let err = session.remove("app:v1").await.unwrap_err();
        assert!(err.is_not_found());

        session.close().await;
        assert_eq!(store.sessions_opened(), 1);
        assert_eq!(store.sessions_closed(), 1);
    }
}
