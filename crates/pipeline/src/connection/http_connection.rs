use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{Request, StatusCode, Version, header};
use tokio::io::AsyncRead;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::codec::{RequestDecoder, error_response, has_connection_token};
use crate::config::PipelineConfig;
use crate::connection::{OutputWriter, Transport, WriterEvent, WriterState};
use crate::handler::{Dispatch, Handler, HandlerDispatch, Reply, Responder};
use crate::pipeline::{Attached, Expired, ResponseCoordinator, SlotState, TimeoutManager};
use crate::protocol::{AfterWrite, EvictReason, HttpError, ParseError, PipelineError};

/// Upper bound for shutting the transport down during teardown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A pipelined HTTP/1.x connection.
///
/// `HttpConnection` reads requests as fast as the pipeline depth allows, hands
/// each one to a [`Dispatch`] running on its own task, and writes the answers
/// back strictly in request order, whatever order the handlers finish in.
///
/// Everything that mutates pipeline state runs on the connection task: handler
/// replies arrive as messages, and the coordinator, writer and timers are
/// driven from a single `select!` loop.
///
/// # Type Parameters
///
/// * `R`: The async readable stream type
/// * `T`: The [`Transport`] responses are written to
pub struct HttpConnection<R, T> {
    framed_read: FramedRead<R, RequestDecoder>,
    transport: T,
    config: PipelineConfig,
}

impl<R, T> fmt::Debug for HttpConnection<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("buffered", &self.framed_read.read_buffer().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// How a connection ended without error.
#[derive(Debug)]
pub enum ConnectionOutcome<R, T> {
    /// the transport was shut down
    Closed,
    /// a `101 Switching Protocols` response was written; the socket now
    /// belongs to the upgraded protocol
    Upgraded(Upgraded<R, T>),
}

/// The socket of an upgraded connection, handed back to the caller.
#[derive(Debug)]
pub struct Upgraded<R, T> {
    pub reader: R,
    pub transport: T,
    /// bytes read past the upgrade request, already belonging to the new protocol
    pub read_buf: BytesMut,
}

/// What the writer branch of the loop reports.
enum WriterTick {
    /// bytes moved while the writer is draining; the write deadline restarts
    Progress,
    /// everything was written and nothing is left in the pipeline
    Drained,
    Finished(WriterEvent),
}

enum Exit {
    Closed,
    Upgrade,
    Failed(HttpError),
}

impl<R, T> HttpConnection<R, T>
where
    R: AsyncRead + Unpin,
    T: Transport,
{
    pub fn new(reader: R, transport: T) -> Self {
        Self::with_config(reader, transport, PipelineConfig::default())
    }

    pub fn with_config(reader: R, transport: T, config: PipelineConfig) -> Self {
        let decoder = RequestDecoder::with_max_body_size(config.max_body_size());
        Self { framed_read: FramedRead::with_capacity(reader, decoder, config.read_buffer_size()), transport, config }
    }

    /// Serves the connection with a [`Handler`].
    pub async fn process<H: Handler>(self, handler: Arc<H>) -> Result<ConnectionOutcome<R, T>, HttpError> {
        self.process_with(HandlerDispatch::new(handler)).await
    }

    /// Serves the connection until the peer is done, a fatal error happens, or
    /// the protocol is upgraded.
    ///
    /// # Errors
    ///
    /// - [`HttpError::RequestError`] if a request can't be framed; the peer got
    ///   a `400 Bad Request` in order, after every earlier response
    /// - [`HttpError::PipelineError`] for a response timeout, a write timeout or
    ///   a transport failure; the connection was aborted
    pub async fn process_with<D: Dispatch>(self, dispatch: D) -> Result<ConnectionOutcome<R, T>, HttpError> {
        let HttpConnection { mut framed_read, mut transport, config } = self;

        let mut coordinator = ResponseCoordinator::new(config.max_pipeline_depth());
        let mut writer = OutputWriter::new(config.write_fairness_cap());
        let mut timeouts = TimeoutManager::new(&config);
        let mut tasks = JoinSet::new();
        let (reply_sender, mut replies) = mpsc::unbounded_channel::<Reply>();

        let mut reading = true;
        let mut awaiting_upgrade: Option<u64> = None;
        let mut parse_error: Option<ParseError> = None;
        let mut write_mark = 0u64;

        let exit = loop {
            let now = Instant::now();

            if !reading && coordinator.is_empty() && writer.is_idle() {
                break Exit::Closed;
            }

            if writer.state() == WriterState::Draining {
                if !timeouts.is_write_armed() || writer.bytes_written() != write_mark {
                    write_mark = writer.bytes_written();
                    timeouts.arm_write(now);
                }
            } else {
                timeouts.clear_write();
            }

            if reading && coordinator.is_empty() && writer.is_idle() {
                if !timeouts.is_idle_armed() {
                    timeouts.arm_idle(now);
                }
            } else {
                timeouts.clear_idle();
            }

            let can_read = reading && awaiting_upgrade.is_none() && coordinator.has_capacity();
            let writer_active = !coordinator.is_empty() || !writer.is_idle();

            select! {
                biased;

                Some(Reply { sequence, group }) = replies.recv() => {
                    let upgrade = group.is_last() && group.after_write() == AfterWrite::Upgrade;
                    match coordinator.attach_response(sequence, group) {
                        Ok(Attached::Complete) => {
                            timeouts.clear_response(sequence);
                            if awaiting_upgrade == Some(sequence) {
                                if upgrade {
                                    reading = false;
                                    coordinator.seal();
                                } else {
                                    awaiting_upgrade = None;
                                }
                            }
                        }
                        Ok(Attached::Partial) => {
                            let deadline = timeouts.body_deadline(now);
                            coordinator.set_deadline(sequence, Some(deadline));
                            timeouts.schedule(sequence, deadline);
                            if awaiting_upgrade == Some(sequence) {
                                awaiting_upgrade = None;
                            }
                        }
                        Err(e) => warn!(sequence, cause = %e, "dropping response group"),
                    }
                }

                tick = poll_fn(|cx| poll_writer(cx, &mut writer, &mut transport, &mut coordinator, write_mark)), if writer_active => {
                    match tick {
                        Ok(WriterTick::Progress | WriterTick::Drained) => {}
                        Ok(WriterTick::Finished(WriterEvent::Upgrade)) => break Exit::Upgrade,
                        Ok(WriterTick::Finished(_)) => break Exit::Closed,
                        Err(e) => break Exit::Failed(e.into()),
                    }
                }

                expired = timeouts.next_expired() => {
                    match expired {
                        Expired::Response { sequence } => match check_deadline(&coordinator, sequence, now) {
                            SlotDeadline::Missed => {
                                error!(sequence, "response deadline passed, aborting connection");
                                let _ = coordinator.evict(sequence, EvictReason::Timeout);
                                let timeout = config.response_timeout();
                                break Exit::Failed(PipelineError::Timeout { sequence, timeout }.into());
                            }
                            SlotDeadline::Streaming => {
                                let deadline = timeouts.body_deadline(now);
                                coordinator.set_deadline(sequence, Some(deadline));
                                timeouts.schedule(sequence, deadline);
                            }
                            SlotDeadline::Later(deadline) => timeouts.schedule(sequence, deadline),
                            SlotDeadline::Cleared => {}
                        },
                        Expired::Write => {
                            if writer.state() == WriterState::Draining {
                                if writer.bytes_written() == write_mark {
                                    let timeout = config.write_timeout().unwrap_or_default();
                                    error!(?timeout, written = write_mark, "transport stalled, aborting connection");
                                    break Exit::Failed(PipelineError::WriteTimeout { timeout }.into());
                                }
                                write_mark = writer.bytes_written();
                                timeouts.arm_write(now);
                            }
                        }
                        Expired::Idle => {
                            if coordinator.is_empty() && writer.is_idle() {
                                info!("keep-alive connection idle, closing");
                                break Exit::Closed;
                            }
                        }
                    }
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!(cause = %e, "handler task panicked");
                    }
                }

                request = framed_read.next(), if can_read => {
                    match request {
                        Some(Ok(request)) => {
                            let deadline = timeouts.response_deadline(now);
                            let sequence = match coordinator.register_slot(Some(deadline)) {
                                Ok(sequence) => sequence,
                                Err(e) => {
                                    warn!(cause = %e, "can't register request");
                                    reading = false;
                                    continue;
                                }
                            };
                            timeouts.schedule(sequence, deadline);

                            if wants_close(&request) {
                                debug!(sequence, "last request of the connection");
                                reading = false;
                                coordinator.seal();
                            }
                            if request.headers().contains_key(header::UPGRADE) {
                                awaiting_upgrade = Some(sequence);
                            }

                            debug!(sequence, method = %request.method(), uri = %request.uri(), "request received");
                            tasks.spawn(dispatch.dispatch(request, Responder::new(sequence, reply_sender.clone())));
                        }

                        Some(Err(e)) => {
                            warn!(cause = %e, "can't decode request, answering 400");
                            reading = false;
                            match coordinator.register_slot(None) {
                                Ok(sequence) => {
                                    let _ = coordinator.attach_response(sequence, error_response(StatusCode::BAD_REQUEST, true));
                                }
                                Err(e) => warn!(cause = %e, "no slot left for the 400 response"),
                            }
                            coordinator.seal();
                            parse_error = Some(e);
                        }

                        None => {
                            debug!("peer finished sending requests");
                            reading = false;
                            coordinator.seal();
                        }
                    }
                }
            }
        };

        match exit {
            Exit::Upgrade => {
                if !coordinator.is_empty() {
                    warn!(dropped = coordinator.depth(), "requests pipelined behind an upgrade are dropped");
                }
                coordinator.abort();
                timeouts.clear_all();
                tasks.abort_all();

                let read_buf = framed_read.read_buffer_mut().split();
                info!(pending = read_buf.len(), "connection upgraded");
                Ok(ConnectionOutcome::Upgraded(Upgraded { reader: framed_read.into_inner(), transport, read_buf }))
            }
            Exit::Closed => {
                teardown(&mut coordinator, &mut writer, &mut timeouts, &mut tasks, &mut transport).await;
                match parse_error {
                    Some(e) => Err(e.into()),
                    None => Ok(ConnectionOutcome::Closed),
                }
            }
            Exit::Failed(e) => {
                teardown(&mut coordinator, &mut writer, &mut timeouts, &mut tasks, &mut transport).await;
                Err(e)
            }
        }
    }
}

/// What the deadline of a slot says when its wake-up fires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotDeadline {
    /// still waiting for its response past the deadline
    Missed,
    /// a streamed response past its deadline, waiting for its turn or for the writer
    Streaming,
    /// the slot was given more time
    Later(Instant),
    /// gone, or no deadline anymore
    Cleared,
}

fn check_deadline(coordinator: &ResponseCoordinator, sequence: u64, now: Instant) -> SlotDeadline {
    let Some(slot) = coordinator.slot(sequence) else {
        return SlotDeadline::Cleared;
    };
    match slot.deadline() {
        None => SlotDeadline::Cleared,
        Some(deadline) if deadline > now => SlotDeadline::Later(deadline),
        Some(_) if slot.state() == SlotState::Pending => SlotDeadline::Missed,
        Some(_) => SlotDeadline::Streaming,
    }
}

/// Polls the writer for the connection loop.
///
/// An idle writer with slots still in the pipeline stays pending: the next
/// reply wakes the loop anyway.
fn poll_writer<T: Transport + ?Sized>(
    cx: &mut Context<'_>,
    writer: &mut OutputWriter,
    transport: &mut T,
    coordinator: &mut ResponseCoordinator,
    write_mark: u64,
) -> Poll<Result<WriterTick, PipelineError>> {
    match writer.poll_drive(cx, transport, coordinator) {
        Poll::Ready(Ok(WriterEvent::Idle)) if coordinator.is_empty() => Poll::Ready(Ok(WriterTick::Drained)),
        Poll::Ready(Ok(WriterEvent::Idle)) => Poll::Pending,
        Poll::Ready(Ok(event)) => Poll::Ready(Ok(WriterTick::Finished(event))),
        Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        Poll::Pending if writer.state() == WriterState::Draining && writer.bytes_written() != write_mark => {
            Poll::Ready(Ok(WriterTick::Progress))
        }
        Poll::Pending => Poll::Pending,
    }
}

/// The single exit path of a failed or finished connection.
///
/// Drops every slot and buffered group, aborts outstanding handlers and shuts
/// the transport down.
async fn teardown<T: Transport + ?Sized>(
    coordinator: &mut ResponseCoordinator,
    writer: &mut OutputWriter,
    timeouts: &mut TimeoutManager,
    tasks: &mut JoinSet<()>,
    transport: &mut T,
) {
    let dropped = coordinator.abort();
    writer.close();
    timeouts.clear_all();
    tasks.abort_all();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, poll_fn(|cx| transport.poll_shutdown(cx))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(cause = %e, "transport shutdown failed"),
        Err(_) => debug!("transport shutdown timed out"),
    }
    debug!(dropped, written = writer.bytes_written(), "connection torn down");
}

/// HTTP/1.1 keeps the connection unless told otherwise, HTTP/1.0 only when asked.
fn wants_close(request: &Request<Bytes>) -> bool {
    match request.version() {
        Version::HTTP_10 => !has_connection_token(request.headers(), b"keep-alive"),
        _ => has_connection_token(request.headers(), b"close"),
    }
}
