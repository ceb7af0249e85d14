//! HTTP response types handed back by handlers.

use std::error::Error;
use std::fmt;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use http::Response;

use crate::protocol::{FileRegion, SharedSlice};

/// Type alias for HTTP response headers.
///
/// The body is attached separately, once the head has been encoded.
pub type ResponseHead = Response<()>;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Represents the size information of an HTTP payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Payload with known length in bytes
    Length(u64),
    /// Payload using chunked transfer encoding
    Chunked,
    /// Empty payload (no body)
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }
}

/// The body of a response, in whichever form the handler has it.
///
/// The first four variants become a single write group; `Stream` is sent with
/// chunked transfer coding, one write group per item.
#[derive(Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Shared(SharedSlice),
    File(FileRegion),
    Stream(BoxStream<'static, Result<Bytes, BoxError>>),
}

impl ResponseBody {
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::Stream(stream.map(|item| item.map_err(Into::into)).boxed())
    }

    /// The payload size the head must announce.
    pub fn payload_size(&self) -> PayloadSize {
        match self {
            ResponseBody::Empty => PayloadSize::Empty,
            ResponseBody::Bytes(bytes) if bytes.is_empty() => PayloadSize::Empty,
            ResponseBody::Bytes(bytes) => PayloadSize::Length(bytes.len() as u64),
            ResponseBody::Shared(slice) if slice.is_empty() => PayloadSize::Empty,
            ResponseBody::Shared(slice) => PayloadSize::Length(slice.len() as u64),
            ResponseBody::File(region) => PayloadSize::Length(region.len()),
            ResponseBody::Stream(_) => PayloadSize::Chunked,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ResponseBody::Shared(slice) => f.debug_tuple("Shared").field(&slice.len()).finish(),
            ResponseBody::File(region) => f.debug_tuple("File").field(region).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<()> for ResponseBody {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<String> for ResponseBody {
    fn from(str: String) -> Self {
        Self::Bytes(str.into())
    }
}

impl From<&'static str> for ResponseBody {
    fn from(str: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(str.as_bytes()))
    }
}

impl From<SharedSlice> for ResponseBody {
    fn from(slice: SharedSlice) -> Self {
        Self::Shared(slice)
    }
}

impl From<FileRegion> for ResponseBody {
    fn from(region: FileRegion) -> Self {
        Self::File(region)
    }
}
