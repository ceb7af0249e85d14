use std::io;
use std::task::{Context, Poll};

use tracing::{debug, trace, warn};

use crate::connection::Transport;
use crate::pipeline::ResponseCoordinator;
use crate::protocol::{AfterWrite, MAX_IO_SLICES, PipelineError, Transfer, WriteGroup};

/// Where the writer stands between two polls.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriterState {
    /// nothing released, everything written was flushed
    Idle,
    /// a group is being written
    Writing,
    /// the transport asked to try later; the cursor holds the position
    Draining,
    /// a transport error or the final group ended the writer
    Closed,
}

/// Why [`OutputWriter::poll_drive`] returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    /// nothing releasable is left, the transport is flushed
    Idle,
    /// a response asking to close the connection was written
    Close,
    /// a `101 Switching Protocols` response was written
    Upgrade,
}

/// The per-connection write loop.
///
/// The writer pulls released groups from the [`ResponseCoordinator`] and drains
/// them into a [`Transport`], one group at a time. In-memory buffers go out as
/// vectored writes, file regions through [`Transport::poll_send_file`]. A
/// fully drained group fires its completion token and is reported back with
/// [`ResponseCoordinator::mark_done`] before the next one is pulled.
#[derive(Debug)]
pub struct OutputWriter {
    state: WriterState,
    current: Option<WriteGroup>,
    /// groups released back to back before yielding
    fairness_cap: usize,
    /// the event to report once the transport is flushed
    finishing: Option<WriterEvent>,
    needs_flush: bool,
    bytes_written: u64,
    groups_written: u64,
}

impl OutputWriter {
    pub fn new(fairness_cap: usize) -> Self {
        Self {
            state: WriterState::Idle,
            current: None,
            fairness_cap: fairness_cap.max(1),
            finishing: None,
            needs_flush: false,
            bytes_written: 0,
            groups_written: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> WriterState {
        self.state
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == WriterState::Idle
    }

    /// Total bytes accepted by the transport.
    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of groups fully drained.
    #[inline]
    pub fn groups_written(&self) -> u64 {
        self.groups_written
    }

    /// The group currently being written.
    pub fn current(&self) -> Option<&WriteGroup> {
        self.current.as_ref()
    }

    /// Drives released groups into `transport` until nothing is releasable,
    /// the transport pushes back, or the fairness cap is reached.
    ///
    /// After `fairness_cap` groups in one call the writer wakes its own task
    /// and returns `Poll::Pending`, letting other tasks on the same worker run.
    ///
    /// # Errors
    ///
    /// A transport failure closes the writer and is returned as
    /// [`PipelineError::Transport`]; the abandoned group reports its progress
    /// through its completion token. Polling a closed writer returns
    /// [`PipelineError::Closed`].
    pub fn poll_drive<T>(
        &mut self,
        cx: &mut Context<'_>,
        transport: &mut T,
        coordinator: &mut ResponseCoordinator,
    ) -> Poll<Result<WriterEvent, PipelineError>>
    where
        T: Transport + ?Sized,
    {
        if self.state == WriterState::Closed {
            return Poll::Ready(Err(PipelineError::Closed));
        }

        let mut released = 0;
        loop {
            if let Some(event) = self.finishing {
                return match self.poll_flush(cx, transport) {
                    Poll::Ready(Ok(())) => {
                        self.finishing = None;
                        self.state = WriterState::Closed;
                        debug!(?event, "writer finished");
                        Poll::Ready(Ok(event))
                    }
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                    Poll::Pending => Poll::Pending,
                };
            }

            if self.current.is_none() {
                if released >= self.fairness_cap {
                    trace!(released, "fairness cap reached, yielding");
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }

                match coordinator.poll_releasable() {
                    Some(group) => {
                        trace!(sequence = group.sequence(), bytes = group.total_bytes(), "writing group");
                        self.current = Some(group);
                        self.state = WriterState::Writing;
                        released += 1;
                    }
                    None => {
                        return match self.poll_flush(cx, transport) {
                            Poll::Ready(Ok(())) => {
                                self.state = WriterState::Idle;
                                Poll::Ready(Ok(WriterEvent::Idle))
                            }
                            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                            Poll::Pending => Poll::Pending,
                        };
                    }
                }
            }

            match self.poll_write_current(cx, transport) {
                Poll::Ready(Ok(())) => self.finish_current(coordinator),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Drops the group in flight and stops the writer.
    pub fn close(&mut self) {
        if let Some(group) = self.current.take() {
            debug!(sequence = group.sequence(), written = group.bytes_written(), "abandoning group in flight");
        }
        self.finishing = None;
        self.state = WriterState::Closed;
    }

    fn poll_write_current<T>(&mut self, cx: &mut Context<'_>, transport: &mut T) -> Poll<Result<(), PipelineError>>
    where
        T: Transport + ?Sized,
    {
        let Some(group) = self.current.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        loop {
            let result = match group.transfer(MAX_IO_SLICES) {
                Transfer::Complete => return Poll::Ready(Ok(())),
                Transfer::Vectored(slices) => transport.poll_write_buffers(cx, &slices).map_ok(|n| n as u64),
                Transfer::File { file, offset, length } => transport.poll_send_file(cx, file, offset, length),
            };

            match result {
                Poll::Ready(Ok(0)) => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "transport accepted no bytes");
                    return Poll::Ready(Err(self.fail(e)));
                }
                Poll::Ready(Ok(n)) => {
                    group.advance(n);
                    self.bytes_written += n;
                    self.needs_flush = true;
                    self.state = WriterState::Writing;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(self.fail(e))),
                Poll::Pending => {
                    self.state = WriterState::Draining;
                    return Poll::Pending;
                }
            }
        }
    }

    fn finish_current(&mut self, coordinator: &mut ResponseCoordinator) {
        let Some(mut group) = self.current.take() else {
            return;
        };

        self.groups_written += 1;
        let sequence = group.sequence();
        let finishing = match (group.is_last(), group.after_write()) {
            (true, AfterWrite::Close) => Some(WriterEvent::Close),
            (true, AfterWrite::Upgrade) => Some(WriterEvent::Upgrade),
            _ => None,
        };
        group.notify_complete();
        // releases shared storage and file handles before the slot goes away
        drop(group);

        if let Some(sequence) = sequence
            && let Err(e) = coordinator.mark_done(sequence)
        {
            warn!(sequence, cause = %e, "drained group has no released slot");
        }

        if finishing.is_some() {
            coordinator.seal();
            self.finishing = finishing;
        }
    }

    fn poll_flush<T>(&mut self, cx: &mut Context<'_>, transport: &mut T) -> Poll<Result<(), PipelineError>>
    where
        T: Transport + ?Sized,
    {
        if !self.needs_flush {
            return Poll::Ready(Ok(()));
        }

        match transport.poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                self.needs_flush = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(self.fail(e))),
            Poll::Pending => {
                self.state = WriterState::Draining;
                Poll::Pending
            }
        }
    }

    fn fail(&mut self, e: io::Error) -> PipelineError {
        warn!(cause = %e, written = self.bytes_written, "transport failed, closing writer");
        self.close();
        PipelineError::transport(e)
    }
}
