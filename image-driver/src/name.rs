use std::{convert::Infallible, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The tag used when an image name does not carry one.
pub const DEFAULT_TAG: &str = "latest";

/// The name of an image, in the form `repository:tag`.
///
/// Parsing splits on the first `:`. Everything before it is the repository,
/// everything after it is the tag, and a name without a `:` gets the
/// [`DEFAULT_TAG`]. Neither half is validated.
///
/// ```rust
/// use image_driver::ImageName;
///
/// let name: ImageName = "redis".parse().unwrap();
/// assert_eq!(name.repository(), "redis");
/// assert_eq!(name.tag(), "latest");
/// assert_eq!(name.to_string(), "redis:latest");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ImageName {
    repository: String,
    tag: String,
}

impl ImageName {
    /// Create a name from its two halves.
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Parse a `repository[:tag]` string.
    pub fn parse(name: &str) -> Self {
        match name.split_once(':') {
            Some((repository, tag)) => Self::new(repository, tag),
            None => Self::new(name, DEFAULT_TAG),
        }
    }

    /// The repository half of the name.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag half of the name.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageName {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for ImageName {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for ImageName {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ImageName> for String {
    fn from(value: ImageName) -> Self {
        value.to_string()
    }
}
