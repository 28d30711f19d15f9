//! # Image service
//!
//! A small HTTP front end for [`image_storage::Storage`]:
//!
//! | route | |
//! |---|---|
//! | `GET /image/get/{name}` | stream an image |
//! | `GET /image/list` | JSON array of `repository:tag` names |
//! | `POST /image/save/{repository}/{tag}` | store the request body |
//! | `DELETE /image/delete/{name}` | delete an image |
//!
//! ## Example
//!
//! ```no_run
//! use image_server::ImageServiceBuilder;
//! use image_storage::StorageConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = StorageConfig::MemoryDocument.build().await?;
//! let service = ImageServiceBuilder::new().storage(storage).build()?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, service).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod error;

pub use api::{ImageServiceBuilder, MissingStorage};
pub use error::{ServiceError, ServiceResult};
