//! Atomic transmission units.
//!
//! A [`WriteGroup`] is an ordered list of [`Buffer`]s that goes to the wire as
//! one unit, typically status line + headers + body. It is immutable apart from
//! its write cursor, which only moves forward through [`WriteGroup::advance`].

use std::fs::File;
use std::io::IoSlice;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::protocol::{Buffer, FileRegion, PipelineError};

/// Upper bound of slices handed to a single vectored write.
pub const MAX_IO_SLICES: usize = 64;

/// What the connection does once a group has fully drained.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum AfterWrite {
    /// keep serving the pipeline
    #[default]
    KeepAlive,
    /// close the connection, no later response may be written
    Close,
    /// hand the socket over to the upgraded protocol
    Upgrade,
}

/// Delivered through the completion token of a [`WriteGroup`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// every byte of the group reached the transport
    Complete { written: u64 },
    /// the group was dropped before it fully drained
    Abandoned { written: u64 },
}

impl WriteOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, WriteOutcome::Complete { .. })
    }
}

/// The piece of a group that the cursor currently points at.
#[derive(Debug)]
pub enum Pending<'a> {
    Memory(&'a [u8]),
    File { region: &'a FileRegion, offset: u64, length: u64 },
}

/// The next transport operation needed to drain a group.
#[derive(Debug)]
pub enum Transfer<'a> {
    /// adjacent in-memory buffers, coalesced for one scatter/gather write
    Vectored(Vec<IoSlice<'a>>),
    /// a file region, always issued on its own
    File { file: &'a File, offset: u64, length: u64 },
    /// nothing left to write
    Complete,
}

#[derive(Debug)]
pub struct WriteGroup {
    buffers: Vec<Buffer>,
    total_bytes: u64,
    bytes_written: u64,
    index: usize,
    offset: u64,
    last: bool,
    after_write: AfterWrite,
    completion: Option<oneshot::Sender<WriteOutcome>>,
    pub(crate) sequence: Option<u64>,
}

impl WriteGroup {
    /// Builds a group from `buffers`, keeping their order.
    ///
    /// Empty in-memory buffers are dropped. A file region with a zero length, or
    /// one whose end overflows, is rejected with [`PipelineError::InvalidBuffer`].
    pub fn new<I>(buffers: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = Buffer>,
    {
        let iter = buffers.into_iter();
        let mut kept = Vec::with_capacity(iter.size_hint().0);
        let mut total_bytes = 0u64;

        for buffer in iter {
            match &buffer {
                Buffer::File(region) => region.validate()?,
                memory if memory.is_empty() => continue,
                _ => {}
            }

            total_bytes = total_bytes
                .checked_add(buffer.len())
                .ok_or_else(|| PipelineError::invalid_buffer("write group size overflows u64"))?;
            kept.push(buffer);
        }

        Ok(Self {
            buffers: kept,
            total_bytes,
            bytes_written: 0,
            index: 0,
            offset: 0,
            last: true,
            after_write: AfterWrite::KeepAlive,
            completion: None,
            sequence: None,
        })
    }

    /// A group holding a single owned buffer.
    pub fn from_bytes<B: Into<Bytes>>(bytes: B) -> Self {
        let bytes = bytes.into();
        let total_bytes = bytes.len() as u64;
        let buffers = if bytes.is_empty() { Vec::new() } else { vec![Buffer::Owned(bytes)] };
        Self {
            buffers,
            total_bytes,
            bytes_written: 0,
            index: 0,
            offset: 0,
            last: true,
            after_write: AfterWrite::KeepAlive,
            completion: None,
            sequence: None,
        }
    }

    /// Marks whether this group finishes its response. Groups of a streamed
    /// response are all `last == false` except the final one.
    #[must_use]
    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    #[must_use]
    pub fn with_after_write(mut self, after_write: AfterWrite) -> Self {
        self.after_write = after_write;
        self
    }

    /// Registers a completion token and returns its receiving end.
    ///
    /// The receiver gets [`WriteOutcome::Complete`] once the group fully drains,
    /// or [`WriteOutcome::Abandoned`] if the group is dropped first.
    pub fn with_completion(&mut self) -> oneshot::Receiver<WriteOutcome> {
        let (sender, receiver) = oneshot::channel();
        self.completion = Some(sender);
        receiver
    }

    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.total_bytes - self.bytes_written
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.bytes_written == self.total_bytes
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.last
    }

    #[inline]
    pub fn after_write(&self) -> AfterWrite {
        self.after_write
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Sequence number of the slot this group was attached to, if any.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// The piece still pending at the cursor, or `None` once complete.
    pub fn current(&self) -> Option<Pending<'_>> {
        let buffer = self.buffers.get(self.index)?;
        let pending = match buffer {
            Buffer::File(region) => Pending::File { region, offset: region.offset() + self.offset, length: region.len() - self.offset },
            Buffer::Owned(_) | Buffer::Shared(_) => {
                let memory = buffer.memory().unwrap_or_default();
                #[allow(clippy::cast_possible_truncation, reason = "offset is bounded by an in-memory buffer length")]
                let start = self.offset as usize;
                Pending::Memory(&memory[start..])
            }
        };
        Some(pending)
    }

    /// Consumes `n` bytes at the cursor, crossing buffer boundaries as needed.
    ///
    /// `n` is clamped to [`remaining`](Self::remaining) so the cursor never moves
    /// past the end. Returns the piece still pending, or `None` once complete.
    pub fn advance(&mut self, n: u64) -> Option<Pending<'_>> {
        let mut n = n.min(self.remaining());
        self.bytes_written += n;

        while n > 0 {
            let left = self.buffers[self.index].len() - self.offset;
            if n < left {
                self.offset += n;
                n = 0;
            } else {
                n -= left;
                self.index += 1;
                self.offset = 0;
            }
        }

        self.current()
    }

    /// Plans the next transport operation from the cursor.
    ///
    /// In-memory buffers following the cursor are coalesced, up to `max_slices`,
    /// until a file region or the end of the group. A file region always stands
    /// alone.
    pub fn transfer(&self, max_slices: usize) -> Transfer<'_> {
        match self.current() {
            None => Transfer::Complete,
            Some(Pending::File { region, offset, length }) => Transfer::File { file: region.file(), offset, length },
            Some(Pending::Memory(first)) => {
                let max_slices = max_slices.clamp(1, MAX_IO_SLICES);
                let mut slices = Vec::with_capacity(max_slices.min(self.buffers.len() - self.index));
                slices.push(IoSlice::new(first));

                for buffer in &self.buffers[self.index + 1..] {
                    if slices.len() >= max_slices {
                        break;
                    }
                    match buffer.memory() {
                        Some(memory) => slices.push(IoSlice::new(memory)),
                        None => break,
                    }
                }

                Transfer::Vectored(slices)
            }
        }
    }

    /// Fires the completion token with a successful outcome.
    pub(crate) fn notify_complete(&mut self) {
        if let Some(sender) = self.completion.take() {
            // the receiver may have lost interest, which is fine
            let _ = sender.send(WriteOutcome::Complete { written: self.bytes_written });
        }
    }
}

impl Drop for WriteGroup {
    fn drop(&mut self) {
        if let Some(sender) = self.completion.take() {
            let _ = sender.send(WriteOutcome::Abandoned { written: self.bytes_written });
        }
    }
}
