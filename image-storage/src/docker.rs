//! The Docker Engine, reached through its HTTP API.

use std::time::Duration;

use bollard::errors::Error as DockerError;
use bollard::query_parameters::{ImportImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use image_driver::{ImageError, ImageErrorKind, Reader, Writer};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::engine::{Engine, EngineImage};

const ENGINE: &str = "docker";

/// Timeout for requests to the daemon when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Size of the pipe between an uploaded archive and the daemon's request body.
const LOAD_PIPE_CAPACITY: usize = 64 * 1024;

/// A handle to a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to a daemon.
    ///
    /// Without a host, `DOCKER_HOST` or the platform's local socket is used.
    /// `tcp://` and `http://` hosts are reached over HTTP, anything else is a
    /// unix socket or named pipe path.
    #[tracing::instrument]
    pub fn connect(host: Option<&str>, timeout: Option<Duration>) -> Result<Self, ImageError> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let docker = match host {
            None => Docker::connect_with_defaults().map(|docker| docker.with_timeout(timeout)),
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, timeout.as_secs(), API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_local(host, timeout.as_secs(), API_DEFAULT_VERSION),
        }
        .map_err(|err| docker_error(err).with_context("connect to daemon"))?;

        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn docker_kind(err: &DockerError) -> ImageErrorKind {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => match status_code {
            404 => ImageErrorKind::NotFound,
            400 | 409 => ImageErrorKind::InvalidRequest,
            _ => ImageErrorKind::Other,
        },
        DockerError::IOError { err } => ImageErrorKind::from_io(err),
        DockerError::RequestTimeoutError
        | DockerError::HyperResponseError { .. }
        | DockerError::HyperLegacyError { .. }
        | DockerError::SocketNotFoundError(_)
        | DockerError::UnsupportedURISchemeError { .. } => ImageErrorKind::Connection,
        _ => ImageErrorKind::Other,
    }
}

#[track_caller]
fn docker_error(err: DockerError) -> ImageError {
    ImageError::new(ENGINE, docker_kind(&err), err)
}

fn failed(image: &str, context: &'static str) -> impl FnOnce(DockerError) -> ImageError {
    let identifier = image.to_owned();
    move |err| {
        docker_error(err)
            .with_identifier(identifier)
            .with_context(context)
    }
}

#[async_trait::async_trait]
impl Engine for DockerEngine {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn load_image(&self, archive: &mut Reader<'_>) -> Result<(), ImageError> {
        let (mut tx, rx) = tokio::io::duplex(LOAD_PIPE_CAPACITY);

        // The request body must be 'static, so the archive is fed through a pipe
        // whose other end the daemon client owns.
        let body = ReaderStream::new(rx).filter_map(|chunk| async move {
            match chunk {
                Ok(chunk) => Some(chunk),
                Err(error) => {
                    tracing::warn!(%error, "Image archive pipe failed");
                    None
                }
            }
        });

        let feed = async {
            let copied = tokio::io::copy(archive, &mut tx).await;
            let closed = tx.shutdown().await;
            drop(tx);
            copied.and(closed.map(|_| 0))
        };

        let import = async {
            let mut progress =
                self.docker
                    .import_image_stream(ImportImageOptions::default(), body, None);
            while let Some(info) = progress.next().await {
                let info = info.map_err(failed("<archive>", "load image"))?;
                if let Some(stream) = info.stream {
                    tracing::trace!(message = stream.trim_end(), "Docker load");
                }
            }
            Ok::<_, ImageError>(())
        };

        let (fed, imported) = tokio::join!(feed, import);
        imported?;
        fed.map_err(ImageError::io(ENGINE))
            .map_err(|err| err.with_context("send image archive"))?;
        Ok(())
    }

    async fn export_image(&self, image: &str, sink: &mut Writer<'_>) -> Result<(), ImageError> {
        let mut chunks = self.docker.export_image(image);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(failed(image, "export image"))?;
            sink.write_all(&chunk)
                .await
                .map_err(ImageError::io(ENGINE))
                .map_err(|err| err.with_identifier(image).with_context("write image archive"))?;
        }

        sink.flush()
            .await
            .map_err(ImageError::io(ENGINE))
            .map_err(|err| err.with_identifier(image).with_context("flush image archive"))
    }

    async fn remove_image(&self, image: &str) -> Result<(), ImageError> {
        let removed = self
            .docker
            .remove_image(image, None::<RemoveImageOptions>, None)
            .await
            .map_err(failed(image, "remove image"))?;
        tracing::debug!(%image, layers = removed.len(), "Removed image");
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<EngineImage>, ImageError> {
        let options = ListImagesOptions {
            all: false,
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(|err| docker_error(err).with_context("list images"))?;

        Ok(images
            .into_iter()
            .map(|summary| EngineImage {
                id: summary.id,
                repo_tags: summary.repo_tags,
            })
            .collect())
    }
}
