//! Readers for exercising failed uploads.

use std::io;

use futures::stream::{self, Iter};
use tokio_util::io::StreamReader;

type Chunks = Iter<std::vec::IntoIter<io::Result<&'static [u8]>>>;

/// A reader which yields `data` and then fails, like a client which
/// disconnects halfway through an upload.
pub(crate) fn interrupted(data: &'static [u8]) -> StreamReader<Chunks, &'static [u8]> {
    StreamReader::new(stream::iter(vec![
        Ok(data),
        Err(io::Error::other("client went away")),
    ]))
}
