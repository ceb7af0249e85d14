//! Request dispatch and the way back into the pipeline.
//!
//! Handlers run as their own tasks and never touch the connection state.
//! Every request comes with a [`Responder`] that posts `(sequence, WriteGroup)`
//! messages into the owning connection's queue; the connection attaches them
//! to the coordinator on its own task.
//!
//! - [`Handler`]: an async function from request to response, the common case
//! - [`Dispatch`]: the lower level hook, receiving the [`Responder`] itself

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::codec::{EncodedResponse, ResponseEncoder, StreamingBody, error_response};
use crate::ensure;
use crate::protocol::{AfterWrite, BoxError, PipelineError, ResponseBody, WriteGroup, WriteOutcome};

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type RespBody: Into<ResponseBody> + Send;
    type Error: Into<BoxError> + Send;

    async fn call(&self, req: Request<Bytes>) -> Result<Response<Self::RespBody>, Self::Error>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<RespBody, Err, F, Fut> Handler for HandlerFn<F>
where
    RespBody: Into<ResponseBody> + Send,
    F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
    Err: Into<BoxError> + Send,
    Fut: Future<Output = Result<Response<RespBody>, Err>> + Send,
{
    type RespBody = RespBody;
    type Error = Err;

    async fn call(&self, req: Request<Bytes>) -> Result<Response<Self::RespBody>, Self::Error> {
        (self.f)(req).await
    }
}

pub fn make_handler<F, RespBody, Err, Ret>(f: F) -> HandlerFn<F>
where
    RespBody: Into<ResponseBody>,
    Err: Into<BoxError>,
    Ret: Future<Output = Result<Response<RespBody>, Err>>,
    F: Fn(Request<Bytes>) -> Ret,
{
    HandlerFn { f }
}

/// Starts the work for one request.
///
/// The returned future is spawned onto the connection's task set and aborted
/// if the connection goes away first. It must eventually use the responder,
/// or drop it: a responder dropped unused answers `500 Internal Server Error`.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, request: Request<Bytes>, responder: Responder) -> BoxFuture<'static, ()>;
}

impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    fn dispatch(&self, request: Request<Bytes>, responder: Responder) -> BoxFuture<'static, ()> {
        (**self).dispatch(request, responder)
    }
}

/// Runs a [`Handler`] for each request and sends whatever it returns.
#[derive(Debug)]
pub struct HandlerDispatch<H> {
    handler: Arc<H>,
}

impl<H: Handler> HandlerDispatch<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

impl<H: Handler> Dispatch for HandlerDispatch<H> {
    fn dispatch(&self, request: Request<Bytes>, responder: Responder) -> BoxFuture<'static, ()> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let sequence = responder.sequence();
            match handler.call(request).await {
                Ok(response) => {
                    if let Err(e) = responder.send(response.map(Into::into)).await {
                        debug!(sequence, cause = %e, "response not delivered");
                    }
                }
                Err(e) => {
                    let e: BoxError = e.into();
                    error!(sequence, cause = %e, "handler failed");
                    if let Err(e) = responder.send_error(StatusCode::INTERNAL_SERVER_ERROR) {
                        debug!(sequence, cause = %e, "error response not delivered");
                    }
                }
            }
        })
    }
}

/// A response group on its way from a handler task to the connection.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) sequence: u64,
    pub(crate) group: WriteGroup,
}

pub(crate) type ReplySender = mpsc::UnboundedSender<Reply>;

/// The write path of one request back into its connection.
///
/// A responder is `Send` and may be moved to any task. Groups posted through it
/// are attached in the connection task, in posting order.
#[derive(Debug)]
pub struct Responder {
    sequence: u64,
    sender: ReplySender,
    started: bool,
    finished: bool,
}

impl Responder {
    pub(crate) fn new(sequence: u64, sender: ReplySender) -> Self {
        Self { sequence, sender, started: false, finished: false }
    }

    /// Sequence number of the slot this responder answers.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Encodes and sends a whole response.
    ///
    /// A streamed body is sent chunk by chunk, waiting for each chunk to drain
    /// before pulling the next one, so at most one chunk per response is
    /// buffered in the pipeline.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Closed`] once the connection is gone; encoding errors
    /// are answered with `500` and returned.
    pub async fn send(mut self, response: Response<ResponseBody>) -> Result<(), PipelineError> {
        match ResponseEncoder::new().encode(response) {
            Ok(EncodedResponse::Complete(group)) => self.send_part(group),
            Ok(EncodedResponse::Streaming(streaming)) => self.pump(streaming).await,
            Err(e) => {
                error!(sequence = self.sequence, cause = %e, "can't encode response");
                self.send_part(error_response(StatusCode::INTERNAL_SERVER_ERROR, false))?;
                Err(e)
            }
        }
    }

    /// Answers with a bodiless status, keeping the connection open.
    pub fn send_error(mut self, status: StatusCode) -> Result<(), PipelineError> {
        self.send_part(error_response(status, false))
    }

    /// Posts one group of the response.
    ///
    /// Groups with [`WriteGroup::is_last`] unset leave the response open for
    /// more; the last one finishes it.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::DuplicateResponse`] after the last group was posted
    /// - [`PipelineError::Closed`] once the connection is gone
    pub fn send_part(&mut self, group: WriteGroup) -> Result<(), PipelineError> {
        ensure!(!self.finished, PipelineError::DuplicateResponse { sequence: self.sequence });

        let last = group.is_last();
        self.sender.send(Reply { sequence: self.sequence, group }).map_err(|_closed| PipelineError::Closed)?;
        self.started = true;
        self.finished = last;
        Ok(())
    }

    async fn pump(&mut self, streaming: StreamingBody) -> Result<(), PipelineError> {
        let StreamingBody { mut head, mut body, mut encoder, after_write } = streaming;

        let drained = head.with_completion();
        self.send_part(head)?;
        wait_drained(drained).await?;

        while let Some(item) = body.next().await {
            match item {
                Ok(bytes) => {
                    let Some(mut group) = encoder.encode_chunk(bytes) else {
                        continue;
                    };
                    let drained = group.with_completion();
                    self.send_part(group)?;
                    wait_drained(drained).await?;
                }
                Err(e) => {
                    // the head is out, so the only honest signal left is closing early
                    error!(sequence = self.sequence, cause = %e, sent = encoder.send_size(), "response body failed");
                    return self.send_part(close_group());
                }
            }
        }

        self.send_part(encoder.finish(after_write))
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let group = if self.started {
            close_group()
        } else {
            warn!(sequence = self.sequence, "responder dropped without a response");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, false)
        };
        // the connection may be gone already
        let _ = self.sender.send(Reply { sequence: self.sequence, group });
    }
}

/// An empty final group that closes the connection once reached.
fn close_group() -> WriteGroup {
    WriteGroup::from_bytes(Bytes::new()).with_after_write(AfterWrite::Close)
}

async fn wait_drained(drained: oneshot::Receiver<WriteOutcome>) -> Result<(), PipelineError> {
    match drained.await {
        Ok(WriteOutcome::Complete { .. }) => Ok(()),
        Ok(WriteOutcome::Abandoned { .. }) | Err(_) => Err(PipelineError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::convert::Infallible;

    fn channel() -> (ReplySender, mpsc::UnboundedReceiver<Reply>) {
        mpsc::unbounded_channel()
    }

    fn wire(group: &WriteGroup) -> Vec<u8> {
        group.buffers().iter().flat_map(|buffer| buffer.memory().unwrap_or_default().to_vec()).collect()
    }

    #[tokio::test]
    async fn handler_response_is_posted_for_its_sequence() {
        let (sender, mut replies) = channel();
        let dispatch = HandlerDispatch::new(Arc::new(make_handler(|request: Request<Bytes>| async move {
            Ok::<_, Infallible>(Response::new(format!("echo {}", request.uri().path())))
        })));

        dispatch.dispatch(Request::get("/ping").body(Bytes::new()).unwrap(), Responder::new(7, sender)).await;

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.sequence, 7);
        assert!(reply.group.is_last());
        assert!(String::from_utf8(wire(&reply.group)).unwrap().ends_with("\r\n\r\necho /ping"));
    }

    #[tokio::test]
    async fn handler_error_becomes_500() {
        let (sender, mut replies) = channel();
        let dispatch = HandlerDispatch::new(Arc::new(make_handler(|_request: Request<Bytes>| async move {
            Err::<Response<String>, _>("boom")
        })));

        dispatch.dispatch(Request::new(Bytes::new()), Responder::new(1, sender)).await;

        let reply = replies.recv().await.unwrap();
        assert!(String::from_utf8(wire(&reply.group)).unwrap().starts_with("HTTP/1.1 500"));
    }

    #[test]
    fn dropped_responder_answers_500() {
        let (sender, mut replies) = channel();
        drop(Responder::new(3, sender));

        let reply = replies.try_recv().unwrap();
        assert_eq!(reply.sequence, 3);
        assert!(String::from_utf8(wire(&reply.group)).unwrap().starts_with("HTTP/1.1 500"));
    }

    #[test]
    fn responder_refuses_parts_after_the_last() {
        let (sender, mut replies) = channel();
        let mut responder = Responder::new(2, sender);

        responder.send_part(WriteGroup::from_bytes("partial").with_last(false)).unwrap();
        responder.send_part(WriteGroup::from_bytes("done")).unwrap();
        assert!(matches!(
            responder.send_part(WriteGroup::from_bytes("again")),
            Err(PipelineError::DuplicateResponse { sequence: 2 })
        ));

        drop(responder);
        assert_eq!(replies.try_recv().unwrap().group.total_bytes(), 7);
        assert_eq!(replies.try_recv().unwrap().group.total_bytes(), 4);
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn streamed_body_waits_for_each_chunk_to_drain() {
        let (sender, mut replies) = channel();
        let body = ResponseBody::stream(stream::iter([Ok::<_, Infallible>(Bytes::from("ab")), Ok(Bytes::new()), Ok(Bytes::from("cde"))]));
        let task = tokio::spawn(Responder::new(1, sender).send(Response::new(body)));

        let mut wire_bytes = Vec::new();
        loop {
            let Reply { mut group, .. } = replies.recv().await.unwrap();
            let last = group.is_last();
            wire_bytes.extend(wire(&group));
            // nothing else is posted until this group drains
            assert!(replies.try_recv().is_err());
            group.advance(group.remaining());
            group.notify_complete();
            if last {
                break;
            }
        }

        task.await.unwrap().unwrap();
        let text = String::from_utf8(wire_bytes).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n\r\n2\r\nab\r\n3\r\ncde\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn failing_stream_closes_after_the_head() {
        let (sender, mut replies) = channel();
        let body = ResponseBody::stream(stream::iter([Ok(Bytes::from("ok")), Err("broken")]));
        let task = tokio::spawn(Responder::new(1, sender).send(Response::new(body)));

        let mut groups = Vec::new();
        while let Some(Reply { mut group, .. }) = replies.recv().await {
            let last = group.is_last();
            group.advance(group.remaining());
            group.notify_complete();
            groups.push(group);
            if last {
                break;
            }
        }

        task.await.unwrap().unwrap();
        let last = groups.last().unwrap();
        assert_eq!(last.after_write(), AfterWrite::Close);
        assert_eq!(last.total_bytes(), 0);
    }

    #[tokio::test]
    async fn stream_stops_when_connection_goes_away() {
        let (sender, mut replies) = channel();
        let body = ResponseBody::stream(stream::iter([Ok::<_, Infallible>(Bytes::from("never sent"))]));
        let task = tokio::spawn(Responder::new(1, sender).send(Response::new(body)));

        // the connection drops the head group unwritten
        drop(replies.recv().await.unwrap());
        assert!(matches!(task.await.unwrap(), Err(PipelineError::Closed)));
    }
}
