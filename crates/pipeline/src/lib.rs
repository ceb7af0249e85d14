//! An HTTP/1.1 pipelining output engine
//!
//! Clients may send several requests on one connection before reading any
//! response. Handlers then finish in whatever order their work dictates, but
//! the responses must go out in request order. This crate keeps that promise
//! without serializing the handlers: requests run concurrently, finished
//! responses are buffered in per-request slots, and a single writer per
//! connection drains them strictly head first.
//!
//! # Features
//!
//! - In-order release of out-of-order responses
//! - Bounded pipeline depth with read back-pressure
//! - Scatter/gather writes for in-memory buffers, `sendfile(2)` for file regions
//! - Reference-counted shared bodies, released as soon as they are written
//! - Streamed response bodies with chunked transfer coding
//! - Response, write and keep-alive deadlines on a single timer
//! - Protocol upgrade handoff
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use std::error::Error;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tracing::{error, info, warn, Level};
//! use tracing_subscriber::FmtSubscriber;
//! use micro_pipeline::config::PipelineConfig;
//! use micro_pipeline::connection::{HttpConnection, IoTransport};
//! use micro_pipeline::handler::make_handler;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize logging
//!     let subscriber = FmtSubscriber::builder()
//!         .with_max_level(Level::INFO)
//!         .finish();
//!     tracing::subscriber::set_global_default(subscriber)
//!         .expect("setting default subscriber failed");
//!
//!     let config = PipelineConfig::from_env().expect("invalid PIPELINE_* environment");
//!
//!     info!(port = 8080, "start listening");
//!     let tcp_listener = match TcpListener::bind("127.0.0.1:8080").await {
//!         Ok(tcp_listener) => tcp_listener,
//!         Err(e) => {
//!             error!(cause = %e, "bind server error");
//!             return;
//!         }
//!     };
//!
//!     let handler = Arc::new(make_handler(hello_world));
//!
//!     loop {
//!         let (tcp_stream, _remote_addr) = match tcp_listener.accept().await {
//!             Ok(stream_and_addr) => stream_and_addr,
//!             Err(e) => {
//!                 warn!(cause = %e, "failed to accept");
//!                 continue;
//!             }
//!         };
//!
//!         let handler = Arc::clone(&handler);
//!         let config = config.clone();
//!
//!         tokio::spawn(async move {
//!             let (reader, writer) = tcp_stream.into_split();
//!             let connection = HttpConnection::with_config(reader, IoTransport::new(writer), config);
//!             match connection.process(handler).await {
//!                 Ok(_) => info!("finished process, connection shutdown"),
//!                 Err(e) => error!("service has error, cause {}, connection shutdown", e),
//!             }
//!         });
//!     }
//! }
//!
//! async fn hello_world(request: Request<Bytes>) -> Result<Response<String>, Box<dyn Error + Send + Sync>> {
//!     info!(path = request.uri().path(), "request received");
//!     Ok(Response::new("Hello World!\r\n".to_string()))
//! }
//! ```
//!
//! # Architecture
//!
//! - [`protocol`]: buffers, write groups, response types and errors
//! - [`pipeline`]: the ordering core, [`pipeline::ResponseCoordinator`] and
//!   [`pipeline::TimeoutManager`]
//! - [`connection`]: the connection loop, the output writer and transports
//! - [`codec`]: request framing and response encoding
//! - [`handler`]: handler traits and the [`handler::Responder`]
//! - [`config`]: [`config::PipelineConfig`]
//!
//! ## Write path
//!
//! A request is framed, registered as a slot and dispatched to its own task.
//! The handler's response is encoded into a [`protocol::WriteGroup`] and posted
//! back to the connection, which attaches it to the slot. The writer only ever
//! takes groups from the head slot, so a fast response waits behind a slow
//! one instead of overtaking it.
//!
//! ## Error Handling
//!
//! - [`protocol::HttpError`]: Top-level error type
//! - [`protocol::ParseError`]: Request framing errors
//! - [`protocol::PipelineError`]: Ordering, timeout and transport errors
//! - [`protocol::ConfigError`]: Invalid configuration
//!
//! A timed-out slot is never skipped: skipping would hand its client the next
//! response in its place. Any response or write timeout aborts the connection.
//!
//! # Limitations
//!
//! - HTTP/1.x only
//! - No TLS support (use a reverse proxy for HTTPS)
//! - Request bodies need a `Content-Length`; chunked request bodies are refused
//! - Maximum header size: 8KB
//! - Maximum number of headers: 64

pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod pipeline;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
