//! Service builder, router and handlers

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use futures::TryStreamExt;
use image_storage::{ImageName, Storage};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::error::ServiceResult;

/// Builder for the image service router
#[derive(Debug, Default)]
pub struct ImageServiceBuilder {
    storage: Option<Storage>,
}

impl ImageServiceBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Build the image service
    ///
    /// Each call returns an independent router, so several services (with
    /// different backends) can run side by side.
    pub fn build(self) -> Result<Router, MissingStorage> {
        let storage = self.storage.ok_or(MissingStorage)?;

        Ok(Router::new()
            .route("/image/get/{*name}", get(get_image))
            .route("/image/list", get(list_images))
            .route("/image/save/{repository}/{tag}", post(save_image))
            .route("/image/delete/{*name}", delete(delete_image))
            .with_state(storage))
    }
}

/// The builder was not given a storage backend.
#[derive(Debug, thiserror::Error)]
#[error("storage backend must be configured")]
pub struct MissingStorage;

/// Stream an image to the client
#[tracing::instrument(skip(storage))]
async fn get_image(
    State(storage): State<Storage>,
    Path(name): Path<String>,
) -> ServiceResult<Response> {
    let mut reader = storage.reader(ImageName::parse(&name));
    reader.ready().await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

/// List stored images
async fn list_images(State(storage): State<Storage>) -> ServiceResult<Json<Vec<String>>> {
    Ok(Json(storage.list().await?))
}

/// Store the request body as `repository:tag`
#[tracing::instrument(skip(storage, body))]
async fn save_image(
    State(storage): State<Storage>,
    Path((repository, tag)): Path<(String, String)>,
    body: Body,
) -> ServiceResult<Response> {
    let image = ImageName::new(repository, tag);
    let mut reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    storage.write(&image, &mut reader).await?;

    Ok((StatusCode::CREATED, format!("Saved image {image}\n")).into_response())
}

/// Delete an image
#[tracing::instrument(skip(storage))]
async fn delete_image(
    State(storage): State<Storage>,
    Path(name): Path<String>,
) -> ServiceResult<StatusCode> {
    storage.delete(&ImageName::parse(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}
