use crate::codec::chunked_encoder::ChunkedEncoder;
use crate::codec::header_encoder::HeaderEncoder;
use crate::protocol::{AfterWrite, BoxError, Buffer, PipelineError, ResponseBody, ResponseHead, WriteGroup};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use http::{HeaderMap, Response, StatusCode, header};
use std::fmt;
use tokio_util::codec::Encoder;

/// Turns handler responses into write groups.
///
/// The head is always rendered into one owned buffer. Bodies of known size ride
/// in the same group without being copied; streamed bodies are returned alongside
/// a [`ChunkedEncoder`] and framed item by item.
#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
}

/// A response rendered for the pipeline.
pub enum EncodedResponse {
    /// the whole response as one write group
    Complete(WriteGroup),
    /// the head group plus a body still to be produced
    Streaming(StreamingBody),
}

/// The pending part of a streamed response.
pub struct StreamingBody {
    pub head: WriteGroup,
    pub body: BoxStream<'static, Result<Bytes, BoxError>>,
    pub encoder: ChunkedEncoder,
    pub after_write: AfterWrite,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, response: Response<ResponseBody>) -> Result<EncodedResponse, PipelineError> {
        let (parts, body) = response.into_parts();
        let head = ResponseHead::from_parts(parts, ());
        let after_write = after_write_for(&head);
        let payload_size = body.payload_size();

        let mut dst = BytesMut::new();
        self.header_encoder.encode((head, payload_size), &mut dst)?;
        let head_buffer = Buffer::Owned(dst.freeze());

        let body_buffer = match body {
            ResponseBody::Empty => None,
            ResponseBody::Bytes(bytes) => Some(Buffer::Owned(bytes)),
            ResponseBody::Shared(slice) => Some(Buffer::Shared(slice)),
            ResponseBody::File(region) => Some(Buffer::File(region)),
            ResponseBody::Stream(body) => {
                let head = WriteGroup::new([head_buffer])?.with_last(false);
                return Ok(EncodedResponse::Streaming(StreamingBody { head, body, encoder: ChunkedEncoder::new(), after_write }));
            }
        };

        let group = WriteGroup::new(std::iter::once(head_buffer).chain(body_buffer))?.with_after_write(after_write);
        Ok(EncodedResponse::Complete(group))
    }
}

/// Decides what happens to the connection once this response is written.
pub fn after_write_for(head: &ResponseHead) -> AfterWrite {
    if head.status() == StatusCode::SWITCHING_PROTOCOLS {
        return AfterWrite::Upgrade;
    }

    if has_connection_token(head.headers(), b"close") { AfterWrite::Close } else { AfterWrite::KeepAlive }
}

/// Returns true if a `Connection` header lists `token`, compared case-insensitively.
pub fn has_connection_token(headers: &HeaderMap, token: &[u8]) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .any(|value| value.as_bytes().split(|b| *b == b',').any(|item| item.trim_ascii().eq_ignore_ascii_case(token)))
}

/// Builds a bodiless response, used where the engine answers on its own.
pub fn error_response(status_code: StatusCode, close: bool) -> WriteGroup {
    let mut builder = Response::builder().status(status_code);
    if close {
        builder = builder.header(header::CONNECTION, "close");
    }

    // both the builder and the encoder only fail on input we don't produce here
    let encoded = builder
        .body(ResponseBody::Empty)
        .map_err(|e| PipelineError::invalid_buffer(e.to_string()))
        .and_then(|response| ResponseEncoder::new().encode(response));

    match encoded {
        Ok(EncodedResponse::Complete(group)) => group,
        _ => WriteGroup::from_bytes(Bytes::from_static(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"))
            .with_after_write(AfterWrite::Close),
    }
}

impl fmt::Debug for EncodedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodedResponse::Complete(group) => f.debug_tuple("Complete").field(group).finish(),
            EncodedResponse::Streaming(body) => f.debug_tuple("Streaming").field(body).finish(),
        }
    }
}

impl fmt::Debug for StreamingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingBody")
            .field("head", &self.head)
            .field("encoder", &self.encoder)
            .field("after_write", &self.after_write)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileRegion, PayloadSize, SharedBytes};
    use std::sync::Arc;

    fn complete(response: Response<ResponseBody>) -> WriteGroup {
        match ResponseEncoder::new().encode(response).unwrap() {
            EncodedResponse::Complete(group) => group,
            other => panic!("expected complete response, got {other:?}"),
        }
    }

    #[test]
    fn bytes_body_shares_the_group() {
        let group = complete(Response::new(ResponseBody::from("hello")));

        assert_eq!(group.buffers().len(), 2);
        assert!(matches!(&group.buffers()[1], Buffer::Owned(bytes) if bytes.as_ref() == b"hello"));
        assert_eq!(group.after_write(), AfterWrite::KeepAlive);
        assert!(group.is_last());
    }

    #[test]
    fn shared_body_is_not_copied() {
        let storage = SharedBytes::from("cached body");
        let group = complete(Response::new(ResponseBody::from(storage.full())));

        assert!(matches!(&group.buffers()[1], Buffer::Shared(_)));
        assert_eq!(storage.ref_count(), 2);
        drop(group);
        assert_eq!(storage.ref_count(), 1);
    }

    #[test]
    fn file_body_announces_region_length() {
        let region = FileRegion::new(Arc::new(tempfile::tempfile().unwrap()), 0, 1000);
        let group = complete(Response::new(ResponseBody::from(region)));

        let Buffer::Owned(head) = &group.buffers()[0] else { panic!("head must be owned") };
        let head = std::str::from_utf8(head).unwrap();
        assert!(head.contains("content-length: 1000\r\n"));
        assert_eq!(group.total_bytes(), head.len() as u64 + 1000);
    }

    #[test]
    fn stream_body_is_chunked() {
        let body = ResponseBody::stream(futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"a"))]));
        assert_eq!(body.payload_size(), PayloadSize::Chunked);

        match ResponseEncoder::new().encode(Response::new(body)).unwrap() {
            EncodedResponse::Streaming(streaming) => assert!(!streaming.head.is_last()),
            other => panic!("expected streaming response, got {other:?}"),
        }
    }

    #[test]
    fn connection_close_and_upgrade_are_detected() {
        let close = Response::builder().header(header::CONNECTION, "keep-alive, Close").body(()).unwrap();
        assert_eq!(after_write_for(&close), AfterWrite::Close);

        let upgrade = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS).body(()).unwrap();
        assert_eq!(after_write_for(&upgrade), AfterWrite::Upgrade);

        let plain = Response::builder().body(()).unwrap();
        assert_eq!(after_write_for(&plain), AfterWrite::KeepAlive);
    }

    #[test]
    fn error_response_closes() {
        let group = error_response(StatusCode::BAD_REQUEST, true);
        assert_eq!(group.after_write(), AfterWrite::Close);

        let Buffer::Owned(head) = &group.buffers()[0] else { panic!("head must be owned") };
        assert!(head.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }
}
