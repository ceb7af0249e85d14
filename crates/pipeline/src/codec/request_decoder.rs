//! Minimal request framing.
//!
//! The request parser is a collaborator of the pipeline rather than part of it;
//! this decoder frames complete requests off the socket so the engine can run
//! end to end. It parses the head with `httparse` and collects `Content-Length`
//! bodies. Chunked request bodies are refused.
//!
//! # Limits
//!
//! - Maximum number of headers: 64
//! - Maximum header size: 8KB
//! - Maximum body size: configurable, see [`RequestDecoder::with_max_body_size`]

use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method, Request};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::ParseError;

/// Maximum number of headers allowed in a request
const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire header section
const MAX_HEADER_BYTES: usize = 8 * 1024;

const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Decodes complete requests, head and body, one per call.
#[derive(Debug)]
pub struct RequestDecoder {
    max_body_size: usize,
    /// head already parsed, waiting for `usize` body bytes
    pending: Option<(Request<()>, usize)>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_body_size(max_body_size: usize) -> Self {
        Self { max_body_size, pending: None }
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::with_max_body_size(DEFAULT_MAX_BODY_SIZE)
    }
}

impl Decoder for RequestDecoder {
    type Item = Request<Bytes>;
    type Error = ParseError;

    /// Attempts to decode a full request from the provided buffer
    ///
    /// # Returns
    ///
    /// - `Ok(Some(request))`: head and body are complete
    /// - `Ok(None)`: need more data to proceed
    /// - `Err(_)`: the bytes can't be framed as a request
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending.is_none() {
            match decode_head(src)? {
                Some((head, body_size)) => {
                    ensure!(body_size <= self.max_body_size, ParseError::too_large_body(body_size as u64, self.max_body_size));
                    self.pending = Some((head, body_size));
                }
                None => return Ok(None),
            }
        }

        match self.pending.take() {
            Some((head, body_size)) if src.len() >= body_size => {
                let body = src.split_to(body_size).freeze();
                trace!(body_size, "decoded request");
                Ok(Some(head.map(|()| body)))
            }
            Some(pending) => {
                src.reserve(pending.1 - src.len());
                self.pending = Some(pending);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Parses the request head and returns it with the announced body size.
fn decode_head(src: &mut BytesMut) -> Result<Option<(Request<()>, usize)>, ParseError> {
    // the shortest request line is "GET / HTTP/1.1\r\n\r\n"
    if src.len() < 14 {
        return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
    let mut req = httparse::Request::new(&mut headers);

    let parsed_result = req.parse(src).map_err(|e| match e {
        Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
        e => ParseError::invalid_header(e.to_string()),
    });

    let body_offset = match parsed_result? {
        Status::Complete(body_offset) => body_offset,
        Status::Partial => {
            ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
            return Ok(None);
        }
    };
    ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

    let version = match req.version {
        Some(0) => http::Version::HTTP_10,
        Some(1) => http::Version::HTTP_11,
        _ => return Err(ParseError::InvalidVersion(req.version)),
    };

    let method = Method::from_bytes(req.method.ok_or(ParseError::InvalidMethod)?.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;
    let mut builder = Request::builder().method(method).uri(req.path.ok_or(ParseError::InvalidUri)?).version(version);

    if let Some(header_map) = builder.headers_mut() {
        header_map.reserve(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(header.value).map_err(ParseError::invalid_header)?;
            header_map.append(name, value);
        }
    }

    let head = builder.body(()).map_err(|_| ParseError::InvalidUri)?;
    let body_size = body_size(&head)?;

    let _ = src.split_to(body_offset);
    Ok(Some((head, body_size)))
}

/// refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length
fn body_size(head: &Request<()>) -> Result<usize, ParseError> {
    if let Some(te_value) = head.headers().get(http::header::TRANSFER_ENCODING) {
        return Err(ParseError::unsupported_transfer_encoding(String::from_utf8_lossy(te_value.as_bytes())));
    }

    let mut values = head.headers().get_all(http::header::CONTENT_LENGTH).iter();
    let Some(cl_value) = values.next() else {
        return Ok(0);
    };
    ensure!(values.all(|other| other == cl_value), ParseError::invalid_content_length("conflicting values"));

    let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
    cl_str.trim().parse::<usize>().map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not usize")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Version;
    use indoc::indoc;

    fn buffer(str: &str) -> BytesMut {
        BytesMut::from(str.replace('\n', "\r\n").as_bytes())
    }

    #[test]
    fn decodes_pipelined_requests() {
        let mut src = buffer(indoc! {"
        GET /a HTTP/1.1
        Host: 127.0.0.1:8080

        POST /b HTTP/1.1
        Content-Length: 5

        helloGET /c HTTP/1.0

        "});

        let mut decoder = RequestDecoder::new();

        let a = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(a.uri().path(), "/a");
        assert_eq!(a.headers().get(http::header::HOST).unwrap(), "127.0.0.1:8080");
        assert!(a.body().is_empty());

        let b = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(b.method(), &Method::POST);
        assert_eq!(b.body().as_ref(), b"hello");

        let c = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(c.uri().path(), "/c");
        assert_eq!(c.version(), Version::HTTP_10);

        assert!(decoder.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn waits_for_the_whole_body() {
        let mut decoder = RequestDecoder::new();
        let mut src = buffer("PUT /x HTTP/1.1\nContent-Length: 10\n\n01234");

        assert!(decoder.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(b"56789");
        let request = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(request.body().as_ref(), b"0123456789");
        assert!(src.is_empty());
    }

    #[test]
    fn refuses_oversized_body() {
        let mut decoder = RequestDecoder::with_max_body_size(4);
        let mut src = buffer("PUT /x HTTP/1.1\nContent-Length: 10\n\n");

        assert!(matches!(decoder.decode(&mut src), Err(ParseError::TooLargeBody { current_size: 10, max_size: 4 })));
    }

    #[test]
    fn refuses_chunked_body() {
        let mut decoder = RequestDecoder::new();
        let mut src = buffer("POST /x HTTP/1.1\nTransfer-Encoding: chunked\n\n");

        assert!(matches!(decoder.decode(&mut src), Err(ParseError::UnsupportedTransferEncoding { .. })));
    }

    #[test]
    fn refuses_garbage() {
        let mut decoder = RequestDecoder::new();
        let mut src = BytesMut::from(&b"\x01\x02 not http at all\r\n\r\n"[..]);

        assert!(decoder.decode(&mut src).is_err());
    }
}
