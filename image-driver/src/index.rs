//! In-memory index of the image names held by a backend.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

use crate::error::{ImageError, ImageErrorKind};

/// Errors reported by [`NameIndex`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// The name is already registered.
    #[error("{0} already exists")]
    Duplicate(String),

    /// The name is not registered.
    #[error("image {0} is not found")]
    NotFound(String),
}

impl IndexError {
    /// The [`ImageErrorKind`] matching this index error.
    pub fn kind(&self) -> ImageErrorKind {
        match self {
            IndexError::Duplicate(_) => ImageErrorKind::Duplicate,
            IndexError::NotFound(_) => ImageErrorKind::NotFound,
        }
    }

    /// Convert into an [`ImageError`] attributed to `engine`.
    pub fn into_image_error(self, engine: &'static str) -> ImageError {
        let name = match &self {
            IndexError::Duplicate(name) | IndexError::NotFound(name) => name.clone(),
        };
        ImageError::builder(engine, self.kind(), self)
            .identifier(name)
            .context("name index")
            .build()
    }
}

#[derive(Debug, Default)]
struct Names {
    order: Vec<String>,
    positions: HashMap<String, usize>,
}

/// A set of image names which remembers insertion order until the first removal.
///
/// Membership is answered from a map of name to position, so adding and removing
/// a name are both O(1). Removal moves the last name into the vacated slot, so
/// once anything has been removed the enumeration order is unspecified.
///
/// The index is a cache of what the storage medium holds: backends rebuild it from
/// the medium whenever they are constructed.
#[derive(Debug, Default)]
pub struct NameIndex {
    names: Mutex<Names>,
}

impl NameIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a name.
    pub fn add(&self, name: impl Into<String>) -> Result<(), IndexError> {
        let name = name.into();
        let mut names = self.names.lock();
        if names.positions.contains_key(&name) {
            return Err(IndexError::Duplicate(name));
        }

        let position = names.order.len();
        names.positions.insert(name.clone(), position);
        names.order.push(name);
        Ok(())
    }

    /// Forget a name.
    pub fn remove(&self, name: &str) -> Result<(), IndexError> {
        let mut names = self.names.lock();
        let Some(position) = names.positions.remove(name) else {
            return Err(IndexError::NotFound(name.to_owned()));
        };

        names.order.swap_remove(position);
        if let Some(moved) = names.order.get(position).cloned() {
            names.positions.insert(moved, position);
        }
        Ok(())
    }

    /// A snapshot of the registered names.
    pub fn names(&self) -> Vec<String> {
        self.names.lock().order.clone()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().positions.contains_key(name)
    }

    /// The number of registered names.
    pub fn len(&self) -> usize {
        self.names.lock().order.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: Into<String>> FromIterator<S> for NameIndex {
    /// Build an index from a scan of the medium, keeping the first occurrence of
    /// each name.
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let index = NameIndex::new();
        for name in iter {
            if let Err(IndexError::Duplicate(name)) = index.add(name) {
                tracing::trace!(%name, "skipping repeated name");
            }
        }
        index
    }
}
