//! Connection handling.
//!
//! # Components
//!
//! - [`HttpConnection`]: drives one pipelined connection:
//!   - reads and frames requests, pausing at the pipeline depth
//!   - dispatches each request to its own task
//!   - releases responses in request order through the [`OutputWriter`]
//!   - enforces response, write and idle deadlines
//!   - hands the socket over on protocol upgrade
//! - [`OutputWriter`]: the write loop state machine
//! - [`Transport`]: the byte sink, with [`IoTransport`] for any `AsyncWrite`
//!   and, on Linux, `SendfileTransport` for TCP streams

mod http_connection;
mod output_writer;
mod transport;

pub use http_connection::{ConnectionOutcome, HttpConnection, Upgraded};
pub use output_writer::{OutputWriter, WriterEvent, WriterState};
pub use transport::{IoTransport, Transport};

#[cfg(target_os = "linux")]
pub use transport::{AsTcpStream, SendfileTransport};
