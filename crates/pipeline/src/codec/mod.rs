//! Encoding and decoding at the edges of the pipeline.
//!
//! - [`RequestDecoder`]: frames complete requests off the socket
//! - [`ResponseEncoder`]: renders handler responses into [`WriteGroup`]s,
//!   using [`HeaderEncoder`] for the head and [`ChunkedEncoder`] for streamed
//!   bodies
//!
//! # Example
//!
//! ```no_run
//! use micro_pipeline::codec::{EncodedResponse, ResponseEncoder};
//! use micro_pipeline::protocol::ResponseBody;
//! use http::Response;
//!
//! let mut encoder = ResponseEncoder::new();
//! let encoded = encoder.encode(Response::new(ResponseBody::from("hello"))).unwrap();
//! assert!(matches!(encoded, EncodedResponse::Complete(_)));
//! ```
//!
//! [`WriteGroup`]: crate::protocol::WriteGroup

mod chunked_encoder;
mod header_encoder;
mod request_decoder;
mod response_encoder;

pub use chunked_encoder::ChunkedEncoder;
pub use header_encoder::HeaderEncoder;
pub use request_decoder::RequestDecoder;
pub use response_encoder::{EncodedResponse, ResponseEncoder, StreamingBody, after_write_for, error_response, has_connection_token};
