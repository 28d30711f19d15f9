use std::{fmt, ops::Deref, sync::Arc};

use tokio::io;

use crate::error::ImageError;
use crate::name::ImageName;

/// A reader stream for image contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + 'r;

/// A writer stream for image contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + 'w;

/// An image storage backend.
///
/// Every backend stores whole images under a [`ImageName`], and the same four
/// operations work against all of them, so callers can swap backends without
/// code changes. How a backend keeps track of its names (an in-memory index, or a
/// live query of a container runtime) is not visible through this trait.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Store an image, reading its contents from `reader` until the end of the
    /// stream. Writing an existing name replaces it.
    async fn write(&self, image: &ImageName, reader: &mut Reader<'_>) -> Result<(), ImageError>;

    /// Copy a stored image into `writer`.
    async fn get(&self, image: &ImageName, writer: &mut Writer<'_>) -> Result<(), ImageError>;

    /// Delete a stored image.
    async fn delete(&self, image: &ImageName) -> Result<(), ImageError>;

    /// List the names of all stored images, as `repository:tag` strings.
    ///
    /// The order is unspecified.
    async fn list(&self) -> Result<Vec<String>, ImageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn write(&self, image: &ImageName, reader: &mut Reader<'_>) -> Result<(), ImageError> {
        self.deref().write(image, reader).await
    }

    async fn get(&self, image: &ImageName, writer: &mut Writer<'_>) -> Result<(), ImageError> {
        self.deref().get(image, writer).await
    }

    async fn delete(&self, image: &ImageName) -> Result<(), ImageError> {
        self.deref().delete(image).await
    }

    async fn list(&self) -> Result<Vec<String>, ImageError> {
        self.deref().list().await
    }
}

#[async_trait::async_trait]
impl<D> Driver for &D
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn write(&self, image: &ImageName, reader: &mut Reader<'_>) -> Result<(), ImageError> {
        (**self).write(image, reader).await
    }

    async fn get(&self, image: &ImageName, writer: &mut Writer<'_>) -> Result<(), ImageError> {
        (**self).get(image, writer).await
    }

    async fn delete(&self, image: &ImageName) -> Result<(), ImageError> {
        (**self).delete(image).await
    }

    async fn list(&self) -> Result<Vec<String>, ImageError> {
        (**self).list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
}
