//! Backends which hand images to a container runtime.

use std::fmt;

use image_driver::{Driver, ImageError, ImageName, Reader, Writer};

/// An image as reported by a container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineImage {
    /// The runtime's image id.
    pub id: String,

    /// Every `repository:tag` alias of the image, including placeholders.
    pub repo_tags: Vec<String>,
}

/// The image-management interface of a container runtime.
#[async_trait::async_trait]
pub trait Engine: fmt::Debug + Send + Sync {
    /// The name of the runtime, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Load an image archive. The archive carries its own names.
    async fn load_image(&self, archive: &mut Reader<'_>) -> Result<(), ImageError>;

    /// Export `image` as an archive into `sink`.
    async fn export_image(&self, image: &str, sink: &mut Writer<'_>) -> Result<(), ImageError>;

    /// Remove `image` from the runtime.
    async fn remove_image(&self, image: &str) -> Result<(), ImageError>;

    /// List the images known to the runtime.
    async fn list_images(&self) -> Result<Vec<EngineImage>, ImageError>;
}

/// A backend which hands every operation to a container runtime.
///
/// The runtime is the source of truth for names, so there is no index here.
#[derive(Debug)]
pub struct EngineDriver<E> {
    engine: E,
}

impl<E: Engine> EngineDriver<E> {
    /// Wrap an engine handle.
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }
}

/// Runtimes tag dangling images and tag-less repositories with `<none>`.
fn is_placeholder(alias: &str) -> bool {
    alias == "<none>" || alias.starts_with("<none>:") || alias.ends_with(":<none>")
}

#[async_trait::async_trait]
impl<E: Engine> Driver for EngineDriver<E> {
    fn name(&self) -> &'static str {
        self.engine.name()
    }

    async fn write(&self, image: &ImageName, reader: &mut Reader<'_>) -> Result<(), ImageError> {
        tracing::debug!(%image, "Loading image archive");
        self.engine.load_image(reader).await
    }

    async fn get(&self, image: &ImageName, writer: &mut Writer<'_>) -> Result<(), ImageError> {
        self.engine.export_image(&image.to_string(), writer).await
    }

    async fn delete(&self, image: &ImageName) -> Result<(), ImageError> {
        self.engine.remove_image(&image.to_string()).await
    }

    async fn list(&self) -> Result<Vec<String>, ImageError> {
        let images = self.engine.list_images().await?;
        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .filter(|alias| !is_placeholder(alias))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use image_driver::ImageErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Mutex;

    use super::*;

    static_assertions::assert_obj_safe!(Engine);

    /// An engine which loads archives of the form `name\ncontents`.
    #[derive(Debug, Default)]
    struct FakeEngine {
        images: Mutex<HashMap<String, Vec<u8>>>,
        extra: Vec<EngineImage>,
    }

    impl FakeEngine {
        fn with_images(extra: Vec<EngineImage>) -> Self {
            Self {
                images: Mutex::default(),
                extra,
            }
        }
    }

    fn missing(image: &str) -> ImageError {
        ImageError::builder(
            "fake",
            ImageErrorKind::NotFound,
            eyre::eyre!("No such image: {image}"),
        )
        .identifier(image)
        .build()
    }

    #[async_trait::async_trait]
    impl Engine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn load_image(&self, archive: &mut Reader<'_>) -> Result<(), ImageError> {
            let mut data = Vec::new();
            archive
                .read_to_end(&mut data)
                .await
                .map_err(ImageError::io("fake"))?;

            let split = data.iter().position(|b| *b == b'\n').ok_or_else(|| {
                ImageError::new(
                    "fake",
                    ImageErrorKind::InvalidRequest,
                    eyre::eyre!("archive has no manifest"),
                )
            })?;
            let name = String::from_utf8_lossy(&data[..split]).into_owned();
            let contents = data[split + 1..].to_vec();
            self.images.lock().await.insert(name, contents);
            Ok(())
        }

        async fn export_image(
            &self,
            image: &str,
            sink: &mut Writer<'_>,
        ) -> Result<(), ImageError> {
            let data = self
                .images
                .lock()
                .await
                .get(image)
                .cloned()
                .ok_or_else(|| missing(image))?;
            sink.write_all(&data).await.map_err(ImageError::io("fake"))?;
            sink.flush().await.map_err(ImageError::io("fake"))?;
            Ok(())
        }

        async fn remove_image(&self, image: &str) -> Result<(), ImageError> {
            self.images
                .lock()
                .await
                .remove(image)
                .map(|_| ())
                .ok_or_else(|| missing(image))
        }

        async fn list_images(&self) -> Result<Vec<EngineImage>, ImageError> {
            let mut images: Vec<_> = self
                .images
                .lock()
                .await
                .keys()
                .enumerate()
                .map(|(n, name)| EngineImage {
                    id: format!("sha256:{n}"),
                    repo_tags: vec![name.clone()],
                })
                .collect();
            images.extend(self.extra.iter().cloned());
            Ok(images)
        }
    }

    #[test]
    fn placeholders() {
        assert!(is_placeholder("<none>"));
        assert!(is_placeholder("<none>:<none>"));
        assert!(is_placeholder("myrepo:<none>"));
        assert!(!is_placeholder("myrepo:v1"));
        assert!(!is_placeholder("none:latest"));
    }

    #[tokio::test]
    async fn list_filters_untagged_aliases() {
        let driver = EngineDriver::new(FakeEngine::with_images(vec![
            EngineImage {
                id: "sha256:a".into(),
                repo_tags: vec!["<none>:<none>".into()],
            },
            EngineImage {
                id: "sha256:b".into(),
                repo_tags: vec!["myrepo:<none>".into(), "myrepo:stable".into()],
            },
            EngineImage {
                id: "sha256:c".into(),
                repo_tags: vec![],
            },
        ]));

        assert_eq!(driver.list().await.unwrap(), vec!["myrepo:stable"]);
    }

    #[tokio::test]
    async fn operations_are_forwarded() {
        let driver = EngineDriver::new(FakeEngine::default());
        let image = ImageName::parse("busybox");

        driver
            .write(&image, &mut &b"busybox:latest\nlayers"[..])
            .await
            .unwrap();
        assert_eq!(driver.list().await.unwrap(), vec!["busybox:latest"]);

        let mut exported = Vec::new();
        driver.get(&image, &mut exported).await.unwrap();
        assert_eq!(exported, b"layers");

        driver.delete(&image).await.unwrap();
        let err = driver.delete(&image).await.unwrap_err();
        assert_eq!(err.kind(), ImageErrorKind::NotFound);
        assert_eq!(driver.name(), "fake");
    }
}
