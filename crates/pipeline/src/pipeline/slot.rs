use std::collections::VecDeque;

use tokio::time::Instant;

use crate::protocol::{PipelineError, WriteGroup};

/// Lifecycle of one pipelined request.
///
/// `Pending → Ready → Released → Done`. A streamed response loops
/// `Released → Pending/Ready` until its last group has drained.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotState {
    /// request parsed, no response group waiting
    Pending,
    /// at least one response group waiting for its turn
    Ready,
    /// a group was handed to the writer
    Released,
    /// the last group fully drained
    Done,
}

/// Bookkeeping for one request of the pipeline.
#[derive(Debug)]
pub struct PipelineSlot {
    sequence: u64,
    state: SlotState,
    groups: VecDeque<WriteGroup>,
    deadline: Option<Instant>,
    finished: bool,
    released_last: bool,
}

impl PipelineSlot {
    pub(crate) fn new(sequence: u64, deadline: Option<Instant>) -> Self {
        Self { sequence, state: SlotState::Pending, groups: VecDeque::new(), deadline, finished: false, released_last: false }
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// The instant by which the next response group must arrive.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once the final group of the response was attached.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of groups buffered behind the head of the pipeline.
    #[inline]
    pub fn queued_groups(&self) -> usize {
        self.groups.len()
    }

    pub(crate) fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub(crate) fn attach(&mut self, mut group: WriteGroup) -> Result<(), PipelineError> {
        if self.finished {
            return Err(PipelineError::DuplicateResponse { sequence: self.sequence });
        }

        if group.is_last() {
            self.finished = true;
            self.deadline = None;
        }

        group.sequence = Some(self.sequence);
        self.groups.push_back(group);
        if self.state == SlotState::Pending {
            self.state = SlotState::Ready;
        }
        Ok(())
    }

    pub(crate) fn release(&mut self) -> Option<WriteGroup> {
        if self.state != SlotState::Ready {
            return None;
        }

        let group = self.groups.pop_front()?;
        self.released_last = group.is_last();
        self.state = SlotState::Released;
        Some(group)
    }

    /// Records that the released group drained. Returns true if the slot is done.
    pub(crate) fn complete_release(&mut self) -> bool {
        self.state = if self.released_last {
            SlotState::Done
        } else if self.groups.is_empty() {
            SlotState::Pending
        } else {
            SlotState::Ready
        };
        self.state == SlotState::Done
    }
}
