use std::fs::FileType;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use image_driver::{
    Driver, ImageError, ImageErrorKind, ImageName, IndexError, NameIndex, Reader, Writer,
};

const ENGINE: &str = "filesystem";

/// Stores images as files: one directory per repository, one file per tag.
///
/// The names on disk are cached in a [`NameIndex`] built when the driver is
/// opened, and kept up to date by [`Driver::write`] and [`Driver::delete`].
#[derive(Debug)]
pub struct FilesystemDriver {
    root: Utf8PathBuf,
    index: NameIndex,
}

impl FilesystemDriver {
    /// Open a driver rooted at `root`, creating the directory if needed and
    /// indexing the images already present.
    #[tracing::instrument]
    pub async fn open(root: Utf8PathBuf) -> Result<Self, ImageError> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(ImageError::io(ENGINE))
            .map_err(|err| err.with_context(format!("create root directory {root}")))?;

        let scan = root.clone();
        let names = tokio::task::spawn_blocking(move || scan_images(&scan))
            .in_current_span()
            .await
            .wrap_err("task: scanning image directory")
            .map_err(ImageError::with(ENGINE, ImageErrorKind::Other))?
            .map_err(ImageError::io(ENGINE))
            .map_err(|err| err.with_context(format!("scan root directory {root}")))?;

        tracing::debug!("Found {} images", names.len());

        Ok(Self {
            root,
            index: names.into_iter().collect(),
        })
    }

    /// The directory holding the repositories.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, image: &ImageName) -> Result<Utf8PathBuf, ImageError> {
        for part in [image.repository(), image.tag()] {
            if !is_path_component(part) {
                return Err(ImageError::builder(
                    ENGINE,
                    ImageErrorKind::InvalidRequest,
                    eyre::eyre!("{part:?} can not be used as a file name"),
                )
                .identifier(image.to_string())
                .build());
            }
        }

        let mut path = self.root.join(image.repository());
        path.push(image.tag());
        Ok(path)
    }

    /// Remove the remains of a failed write. The file was truncated when the
    /// write began, so any earlier image of the same name is gone as well.
    async fn discard(&self, image: &ImageName, path: &Utf8Path) {
        if let Err(error) = tokio::fs::remove_file(path).await {
            tracing::warn!(%image, %path, %error, "Failed to remove partial image file");
        }
        if self.index.remove(&image.to_string()).is_ok() {
            tracing::debug!(%image, "Dropped image replaced by a failed write");
        }
    }
}

fn is_path_component(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && !part.contains('/')
        && !part.contains(std::path::MAIN_SEPARATOR)
}

fn failed(image: &ImageName, context: &'static str) -> impl FnOnce(io::Error) -> ImageError {
    let identifier = image.to_string();
    move |err| {
        ImageError::io(ENGINE)(err)
            .with_identifier(identifier)
            .with_context(context)
    }
}

/// Like [`failed`], for paths which are only looked up.
fn lookup_failed(
    image: &ImageName,
    context: &'static str,
) -> impl FnOnce(io::Error) -> ImageError {
    let identifier = image.to_string();
    move |err| {
        let kind = match err.kind() {
            // The repository is a file, so no tag can exist under it.
            io::ErrorKind::NotADirectory => ImageErrorKind::NotFound,
            _ => ImageErrorKind::from_io(&err),
        };
        ImageError::new(ENGINE, kind, err)
            .with_identifier(identifier)
            .with_context(context)
    }
}

#[async_trait::async_trait]
impl Driver for FilesystemDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn write(&self, image: &ImageName, reader: &mut Reader<'_>) -> Result<(), ImageError> {
        let path = self.path(image)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(failed(image, "create repository directory"))?;
        }

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .map_err(failed(image, "create image file"))?,
        );

        let copied = match tokio::io::copy(reader, &mut writer).await {
            Ok(_) => writer
                .shutdown()
                .await
                .map_err(failed(image, "shutdown image file")),
            Err(err) => Err(failed(image, "copy image into file")(err)),
        };
        drop(writer);

        if let Err(err) = copied {
            self.discard(image, &path).await;
            return Err(err);
        }

        if let Err(IndexError::Duplicate(name)) = self.index.add(image.to_string()) {
            tracing::trace!(%name, "Replaced existing image");
        }
        Ok(())
    }

    async fn get(&self, image: &ImageName, writer: &mut Writer<'_>) -> Result<(), ImageError> {
        let path = self.path(image)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(lookup_failed(image, "open image file"))?,
        );

        tokio::io::copy(&mut reader, writer)
            .await
            .map_err(failed(image, "copy image from file"))?;

        writer
            .flush()
            .await
            .map_err(failed(image, "flush writer"))?;

        Ok(())
    }

    async fn delete(&self, image: &ImageName) -> Result<(), ImageError> {
        let path = self.path(image)?;

        tokio::fs::remove_file(&path)
            .await
            .map_err(lookup_failed(image, "remove image file"))?;

        if let Err(IndexError::NotFound(name)) = self.index.remove(&image.to_string()) {
            tracing::debug!(%name, "Deleted an image which was not indexed");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, ImageError> {
        Ok(self.index.names())
    }
}

/// Whether a directory entry has the wanted type. An entry whose type can not
/// be read is skipped.
fn has_type(path: &Utf8Path, kind: io::Result<FileType>, wanted: fn(&FileType) -> bool) -> bool {
    match kind {
        Ok(kind) => wanted(&kind),
        Err(error) => {
            tracing::warn!(%path, %error, "Skipping entry of unknown type");
            false
        }
    }
}

/// Walk `root/<repository>/<tag>` and return the `repository:tag` names.
#[tracing::instrument]
fn scan_images(root: &Utf8Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in root.read_dir_utf8()? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(%error, "Skipping unreadable entry");
                continue;
            }
        };
        if !has_type(entry.path(), entry.file_type(), FileType::is_dir) {
            continue;
        }

        let repository = entry.file_name();
        let tags = match entry.path().read_dir_utf8() {
            Ok(tags) => tags,
            Err(error) => {
                tracing::warn!(%repository, %error, "Skipping unreadable repository");
                continue;
            }
        };

        for tag in tags {
            let tag = match tag {
                Ok(tag) => tag,
                Err(error) => {
                    tracing::warn!(%repository, %error, "Skipping unreadable tag");
                    continue;
                }
            };
            if has_type(tag.path(), tag.file_type(), FileType::is_file) {
                names.push(format!("{repository}:{}", tag.file_name()));
            }
        }
    }

    Ok(names)
}
