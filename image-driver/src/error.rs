use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes image storage errors by their meaning, independent of the
/// backend that produced them.
///
/// Callers (the HTTP layer in particular) use the kind to decide how to report a
/// failure without inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageErrorKind {
    /// An image with the same name is already registered.
    Duplicate,

    /// The image does not exist, either in the name index or on the medium.
    NotFound,

    /// Reading or writing an image stream, a file or a socket failed.
    ///
    /// **Retryable:** Maybe - depends on whether the I/O issue is transient.
    Io,

    /// The backing service (document store, container runtime) could not be
    /// reached.
    ///
    /// **Retryable:** Yes - once the service is back.
    Connection,

    /// The request can not be expressed on this backend, e.g. an image name
    /// which does not map onto the filesystem layout.
    InvalidRequest,

    /// Anything else reported by the backend.
    Other,
}

impl ImageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    ///
    /// Backends never retry on their own; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ImageErrorKind::Io | ImageErrorKind::Connection)
    }

    /// Returns whether this error was caused by the request itself.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ImageErrorKind::Duplicate | ImageErrorKind::NotFound | ImageErrorKind::InvalidRequest
        )
    }

    /// Classify an I/O error.
    ///
    /// [`ImageErrorKind::Duplicate`] is left to the name index: an existing
    /// file in the way of a write is a storage problem, not a name collision.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ImageErrorKind::NotFound,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut => ImageErrorKind::Connection,
            _ => ImageErrorKind::Io,
        }
    }
}

impl fmt::Display for ImageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageErrorKind::Duplicate => write!(f, "duplicate identifier"),
            ImageErrorKind::NotFound => write!(f, "not found"),
            ImageErrorKind::Io => write!(f, "I/O error"),
            ImageErrorKind::Connection => write!(f, "connection failure"),
            ImageErrorKind::InvalidRequest => write!(f, "invalid request"),
            ImageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace, controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,

    /// The tracing span context where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// An error from an image storage backend.
///
/// Carries:
/// - the [`ImageErrorKind`]
/// - the backend (`engine`) which produced it
/// - the image name and operation, when known
/// - the underlying error
/// - a backtrace and a [`SpanTrace`]
///
/// # Example
///
/// ```rust
/// use image_driver::{ImageError, ImageErrorKind};
///
/// fn open_image() -> Result<(), ImageError> {
///     std::fs::File::open("missing/latest").map_err(|err| {
///         ImageError::builder("filesystem", ImageErrorKind::NotFound, err)
///             .identifier("missing:latest")
///             .context("open image file")
///             .build()
///     })?;
///     Ok(())
/// }
/// # assert!(open_image().is_err());
/// ```
#[derive(Debug)]
pub struct ImageError {
    kind: ImageErrorKind,
    engine: &'static str,
    identifier: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for ImageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl ImageError {
    /// Create a new error with the minimum required information.
    ///
    /// For more control, use [`ImageError::builder`].
    #[track_caller]
    pub fn new<E>(engine: &'static str, kind: ImageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            identifier: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for an error with full context.
    pub fn builder<E>(engine: &'static str, kind: ImageErrorKind, error: E) -> ImageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        ImageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            identifier: None,
            context: None,
        }
    }

    /// Returns a boxed closure which wraps a downstream error, for use with
    /// `.map_err()`.
    ///
    /// ```rust
    /// use image_driver::{ImageError, ImageErrorKind};
    ///
    /// fn operation() -> Result<(), ImageError> {
    ///     "x".parse::<u32>()
    ///         .map_err(ImageError::with("filesystem", ImageErrorKind::InvalidRequest))?;
    ///     Ok(())
    /// }
    /// # assert!(operation().is_err());
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: ImageErrorKind,
    ) -> Box<dyn FnOnce(E) -> ImageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| ImageError::new(engine, kind, error))
    }

    /// Returns a closure which wraps an [`io::Error`], picking the kind from the
    /// I/O error kind.
    pub fn io(engine: &'static str) -> impl FnOnce(io::Error) -> ImageError {
        move |error: io::Error| ImageError::new(engine, ImageErrorKind::from_io(&error), error)
    }

    /// Attach the image name this error concerns.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Attach the operation this error happened in.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ImageErrorKind {
        self.kind
    }

    /// Returns the backend name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the image name, if available.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Whether the error is [`ImageErrorKind::NotFound`].
    pub fn is_not_found(&self) -> bool {
        self.kind == ImageErrorKind::NotFound
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(identifier) = &self.identifier {
            write!(f, " (image: {})", identifier)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for [`ImageError`] with optional context fields.
#[derive(Debug)]
pub struct ImageErrorBuilder {
    kind: ImageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    identifier: Option<String>,
    context: Option<String>,
}

impl ImageErrorBuilder {
    /// Set the image name.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the [`ImageError`].
    #[track_caller]
    pub fn build(self) -> ImageError {
        ImageError {
            kind: self.kind,
            engine: self.engine,
            identifier: self.identifier,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(ImageError: Send, Sync);

    #[test]
    fn io_errors_are_classified() {
        let err = ImageError::io("test")(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ImageErrorKind::NotFound);

        let err = ImageError::io("test")(io::Error::new(io::ErrorKind::ConnectionRefused, "no"));
        assert_eq!(err.kind(), ImageErrorKind::Connection);
        assert!(err.is_retryable());

        let err = ImageError::io("test")(io::Error::other("disk on fire"));
        assert_eq!(err.kind(), ImageErrorKind::Io);
    }

    #[test]
    fn existing_files_are_not_duplicates() {
        let err = ImageError::io("test")(io::Error::new(io::ErrorKind::AlreadyExists, "in the way"));
        assert_eq!(err.kind(), ImageErrorKind::Io);
        assert!(!err.kind().is_client_fault());
    }

    #[test]
    fn display_includes_context() {
        let err = ImageError::builder(
            "filesystem",
            ImageErrorKind::NotFound,
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        )
        .identifier("app:v1")
        .context("open image file")
        .build();

        assert_eq!(
            err.to_string(),
            "Image storage error [not found] from filesystem (image: app:v1) (open image file): no such file"
        );
    }
}
