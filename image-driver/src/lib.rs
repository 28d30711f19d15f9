//! # Image driver
//!
//! The contract shared by all image storage backends: image names, the
//! [`Driver`] trait, the error model and the in-memory [`NameIndex`].

mod driver;
mod error;
mod index;
mod name;

pub use driver::Driver;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{ImageError, ImageErrorBuilder, ImageErrorKind};
pub use index::{IndexError, NameIndex};
pub use name::{ImageName, DEFAULT_TAG};
