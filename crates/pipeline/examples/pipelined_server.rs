//! A small server answering pipelined requests out of order internally and in
//! order on the wire.
//!
//! Try it with several requests on one connection:
//!
//! ```text
//! printf 'GET /slow HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\nGET /stream HTTP/1.1\r\n\r\n' | nc 127.0.0.1 8080
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use http::{Request, Response, StatusCode};
use micro_pipeline::config::PipelineConfig;
use micro_pipeline::connection::{HttpConnection, Transport};
use micro_pipeline::handler::Handler;
use micro_pipeline::protocol::{BoxError, FileRegion, ResponseBody};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = PipelineConfig::from_env()?;
    info!(?config, "pipeline config");

    info!(port = 8080, "start listening");
    let tcp_listener = match TcpListener::bind("127.0.0.1:8080").await {
        Ok(tcp_listener) => tcp_listener,
        Err(e) => {
            error!(cause = %e, "bind server error");
            return Err(e.into());
        }
    };

    let handler = Arc::new(DemoHandler);
    loop {
        let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
            Ok(stream_and_addr) => stream_and_addr,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let config = config.clone();

        tokio::spawn(async move {
            let (reader, writer) = tcp_stream.into_split();
            let connection = HttpConnection::with_config(reader, transport(writer), config);
            match connection.process(handler).await {
                Ok(outcome) => info!(%remote_addr, ?outcome, "connection finished"),
                Err(e) => warn!(%remote_addr, cause = %e, "connection aborted"),
            }
        });
    }
}

/// File regions go out with `sendfile(2)` where the platform has it.
#[cfg(target_os = "linux")]
fn transport(writer: OwnedWriteHalf) -> impl Transport + fmt::Debug {
    micro_pipeline::connection::SendfileTransport::new(writer)
}

#[cfg(not(target_os = "linux"))]
fn transport(writer: OwnedWriteHalf) -> impl Transport + fmt::Debug {
    micro_pipeline::connection::IoTransport::new(writer)
}

struct DemoHandler;

#[async_trait]
impl Handler for DemoHandler {
    type RespBody = ResponseBody;
    type Error = BoxError;

    async fn call(&self, request: Request<Bytes>) -> Result<Response<Self::RespBody>, Self::Error> {
        let body = match request.uri().path() {
            "/slow" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                ResponseBody::from("slow\r\n")
            }
            "/fast" => ResponseBody::from("fast\r\n"),
            "/stream" => {
                let chunks = (0..3).map(|i| Ok::<_, BoxError>(Bytes::from(format!("chunk {i}\r\n"))));
                ResponseBody::stream(stream::iter(chunks))
            }
            "/file" => {
                let file = std::fs::File::open(file!())?;
                ResponseBody::from(FileRegion::whole(file)?)
            }
            _ => return Ok(Response::builder().status(StatusCode::NOT_FOUND).body(ResponseBody::from("not found\r\n"))?),
        };

        Ok(Response::builder().status(StatusCode::OK).body(body)?)
    }
}
