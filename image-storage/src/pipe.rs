use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadBuf,
};
use tokio::task::JoinHandle;

use image_driver::{ImageError, ImageErrorKind};

/// Capacity of the pipe between a streaming handle and its driver task.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

type Producer = JoinHandle<Result<(), ImageError>>;

fn join_failed(engine: &'static str, err: tokio::task::JoinError) -> ImageError {
    ImageError::builder(engine, ImageErrorKind::Other, err)
        .context("driver task")
        .build()
}

/// Reads an image while a driver task copies it out of storage.
///
/// Errors from the driver show up in two places: [`ImageReader::ready`] returns
/// them directly when the driver fails before producing any data, and reads
/// return them as [`io::Error`] at the end of the stream otherwise.
#[derive(Debug)]
pub struct ImageReader {
    engine: &'static str,
    pipe: BufReader<DuplexStream>,
    producer: Option<Producer>,
}

impl ImageReader {
    pub(crate) fn new(engine: &'static str, pipe: DuplexStream, producer: Producer) -> Self {
        Self {
            engine,
            pipe: BufReader::new(pipe),
            producer: Some(producer),
        }
    }

    /// Wait until the first bytes of the image are available, or the driver has
    /// finished.
    pub async fn ready(&mut self) -> Result<(), ImageError> {
        match self.pipe.fill_buf().await {
            Ok(buf) if !buf.is_empty() => return Ok(()),
            Ok(_) => {}
            Err(error) => tracing::debug!(%error, "Image pipe closed early"),
        }

        match self.producer.take() {
            Some(producer) => producer
                .await
                .map_err(|err| join_failed(self.engine, err))?,
            None => Ok(()),
        }
    }
}

impl AsyncRead for ImageReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.pipe).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // End of the pipe: report how the driver finished.
        if let Some(producer) = this.producer.as_mut() {
            let result = ready!(Pin::new(producer).poll(cx));
            this.producer = None;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
                Err(err) => return Poll::Ready(Err(io::Error::other(join_failed(this.engine, err)))),
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Writes an image while a driver task copies it into storage.
///
/// Call [`ImageWriter::finish`] to close the stream and learn whether the
/// driver stored it. A writer dropped or shut down without `finish` fails the
/// driver's copy, so nothing partial is stored.
#[derive(Debug)]
pub struct ImageWriter {
    engine: &'static str,
    pipe: DuplexStream,
    finished: Arc<AtomicBool>,
    producer: Producer,
}

impl ImageWriter {
    pub(crate) fn new(
        engine: &'static str,
        pipe: DuplexStream,
        finished: Arc<AtomicBool>,
        producer: Producer,
    ) -> Self {
        Self {
            engine,
            pipe,
            finished,
            producer,
        }
    }

    /// Close the stream and wait for the driver.
    pub async fn finish(self) -> Result<(), ImageError> {
        let Self {
            engine,
            mut pipe,
            finished,
            producer,
        } = self;

        // Must be visible before the driver sees the end of the pipe.
        finished.store(true, Ordering::Release);
        let closed = pipe.shutdown().await;
        drop(pipe);

        producer.await.map_err(|err| join_failed(engine, err))??;
        closed
            .map_err(ImageError::io(engine))
            .map_err(|err| err.with_context("close image pipe"))
    }
}

impl AsyncWrite for ImageWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().pipe).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_shutdown(cx)
    }
}

/// The driver's end of an [`ImageWriter`].
///
/// The end of the pipe reads as the end of the image only once the writer has
/// been finished. Otherwise it is an [`io::ErrorKind::UnexpectedEof`] error.
#[derive(Debug)]
pub(crate) struct WriterPipe {
    pipe: BufReader<DuplexStream>,
    finished: Arc<AtomicBool>,
}

impl WriterPipe {
    pub(crate) fn new(pipe: DuplexStream, finished: Arc<AtomicBool>) -> Self {
        Self {
            pipe: BufReader::new(pipe),
            finished,
        }
    }

    fn check_finished(&self) -> io::Result<()> {
        if self.finished.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "image writer closed before it was finished",
            ))
        }
    }
}

impl AsyncRead for WriterPipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.pipe).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        Poll::Ready(this.check_finished())
    }
}

impl AsyncBufRead for WriterPipe {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if let Err(err) = ready!(Pin::new(&mut this.pipe).poll_fill_buf(cx)) {
            return Poll::Ready(Err(err));
        }
        if this.pipe.buffer().is_empty() {
            this.check_finished()?;
        }
        Poll::Ready(Ok(this.pipe.buffer()))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().pipe).consume(amt)
    }
}
