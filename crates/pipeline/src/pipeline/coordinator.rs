//! In-order release of out-of-order responses.
//!
//! Handlers finish in whatever order their latencies dictate, while HTTP/1.1
//! requires responses in request order. The coordinator keeps one
//! [`PipelineSlot`] per request and enforces a single rule: a group is released
//! only from the head slot, and only when that slot is `Ready`. Everything
//! `Ready` behind the head stays buffered, bounded by the pipeline depth.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::{PipelineSlot, SlotState};
use crate::protocol::{EvictReason, PipelineError, WriteGroup};

/// Result of a successful [`ResponseCoordinator::attach_response`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Attached {
    /// the final group of the response is in, the slot has no deadline anymore
    Complete,
    /// more groups of a streamed response will follow
    Partial,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// no more registrations, existing slots still drain
    Sealed,
    /// torn down, every operation is a no-op
    Closed,
}

#[derive(Debug)]
pub struct ResponseCoordinator {
    slots: VecDeque<PipelineSlot>,
    next_sequence: u64,
    max_depth: usize,
    lifecycle: Lifecycle,
}

impl ResponseCoordinator {
    /// Creates a coordinator holding at most `max_depth` live slots. A depth of
    /// zero is raised to one.
    pub fn new(max_depth: usize) -> Self {
        let max_depth = max_depth.max(1);
        Self { slots: VecDeque::with_capacity(max_depth), next_sequence: 1, max_depth, lifecycle: Lifecycle::Open }
    }

    /// Appends a `Pending` slot for a freshly parsed request.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::BackpressureBlocked`] once `max_depth` slots are live;
    ///   the caller must stop reading until the head advances
    /// - [`PipelineError::Closed`] after [`seal`](Self::seal) or teardown
    pub fn register_slot(&mut self, deadline: Option<Instant>) -> Result<u64, PipelineError> {
        if self.lifecycle != Lifecycle::Open {
            return Err(PipelineError::Closed);
        }
        if !self.has_capacity() {
            return Err(PipelineError::BackpressureBlocked { depth: self.slots.len() });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.slots.push_back(PipelineSlot::new(sequence, deadline));
        debug!(sequence, depth = self.slots.len(), "slot registered");
        Ok(sequence)
    }

    /// Attaches a response group to the slot `sequence`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::UnknownSlot`] if the slot is gone, e.g. evicted by a
    ///   timeout the handler raced with; the group is dropped
    /// - [`PipelineError::DuplicateResponse`] if the slot already got its final group
    /// - [`PipelineError::Closed`] after teardown
    pub fn attach_response(&mut self, sequence: u64, group: WriteGroup) -> Result<Attached, PipelineError> {
        if self.lifecycle == Lifecycle::Closed {
            return Err(PipelineError::Closed);
        }

        let slot = self.slot_mut(sequence).ok_or_else(|| PipelineError::unknown_slot(sequence))?;
        slot.attach(group)?;
        debug!(sequence, state = ?slot.state(), "response attached");

        Ok(if slot.is_finished() { Attached::Complete } else { Attached::Partial })
    }

    /// Releases the next group to write, if the head slot has one.
    ///
    /// This is the only way groups leave the coordinator, so no group is ever
    /// released out of turn even when later slots are already `Ready`.
    pub fn poll_releasable(&mut self) -> Option<WriteGroup> {
        if self.lifecycle == Lifecycle::Closed {
            return None;
        }

        let head = self.slots.front_mut()?;
        let group = head.release()?;
        debug!(sequence = head.sequence(), "response released");
        Some(group)
    }

    /// Records that the released group of slot `sequence` fully drained, and
    /// drops the slot from the head if its response is complete.
    ///
    /// # Errors
    ///
    /// [`PipelineError::UnknownSlot`] if `sequence` is not the released head.
    pub fn mark_done(&mut self, sequence: u64) -> Result<(), PipelineError> {
        if self.lifecycle == Lifecycle::Closed {
            return Ok(());
        }

        let head = match self.slots.front_mut() {
            Some(head) if head.sequence() == sequence && head.state() == SlotState::Released => head,
            _ => return Err(PipelineError::unknown_slot(sequence)),
        };

        if head.complete_release() {
            self.slots.pop_front();
            debug!(sequence, depth = self.slots.len(), "slot done");
        }

        while self.slots.front().is_some_and(|slot| slot.state() == SlotState::Done) {
            self.slots.pop_front();
        }
        Ok(())
    }

    /// Removes a slot that hasn't been released and tears the pipeline down.
    ///
    /// Skipping a request would let a later response go out in its place, so
    /// eviction never continues the pipeline: every slot is dropped and the
    /// coordinator closes. The caller then aborts the connection.
    ///
    /// # Errors
    ///
    /// [`PipelineError::UnknownSlot`] if there is no such slot, or if it was
    /// already released: its response is on the wire and can't be taken back.
    pub fn evict(&mut self, sequence: u64, reason: EvictReason) -> Result<(), PipelineError> {
        if self.lifecycle == Lifecycle::Closed {
            return Ok(());
        }

        let index = self.index_of(sequence).ok_or_else(|| PipelineError::unknown_slot(sequence))?;
        if matches!(self.slots[index].state(), SlotState::Released | SlotState::Done) {
            return Err(PipelineError::unknown_slot(sequence));
        }

        self.slots.remove(index);
        debug!(sequence, ?reason, "slot evicted, aborting pipeline");
        self.abort();
        Ok(())
    }

    /// Drops every slot and buffered group and closes the coordinator.
    ///
    /// Dropping the groups releases their shared buffers and file handles and
    /// reports them as abandoned. Returns the number of slots dropped.
    pub fn abort(&mut self) -> usize {
        let dropped = self.slots.len();
        self.slots.clear();
        self.lifecycle = Lifecycle::Closed;
        dropped
    }

    /// Refuses further registrations while letting existing slots drain.
    pub fn seal(&mut self) {
        if self.lifecycle == Lifecycle::Open {
            self.lifecycle = Lifecycle::Sealed;
        }
    }

    /// Number of live slots, in any state.
    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    #[inline]
    pub fn has_capacity(&self) -> bool {
        self.slots.len() < self.max_depth
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.lifecycle == Lifecycle::Sealed
    }

    /// Sequence number of the oldest slot not yet done.
    pub fn head_sequence(&self) -> Option<u64> {
        self.slots.front().map(PipelineSlot::sequence)
    }

    pub fn slot(&self, sequence: u64) -> Option<&PipelineSlot> {
        self.index_of(sequence).map(|index| &self.slots[index])
    }

    pub fn slots(&self) -> impl Iterator<Item = &PipelineSlot> {
        self.slots.iter()
    }

    /// Moves the deadline of a slot, e.g. when a streamed response made progress.
    pub fn set_deadline(&mut self, sequence: u64, deadline: Option<Instant>) {
        if let Some(slot) = self.slot_mut(sequence) {
            slot.set_deadline(deadline);
        }
    }

    fn slot_mut(&mut self, sequence: u64) -> Option<&mut PipelineSlot> {
        self.index_of(sequence).map(|index| &mut self.slots[index])
    }

    fn index_of(&self, sequence: u64) -> Option<usize> {
        self.slots.binary_search_by_key(&sequence, PipelineSlot::sequence).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SharedBytes, WriteOutcome};
    use proptest::prelude::*;

    fn group(tag: &'static str) -> WriteGroup {
        WriteGroup::from_bytes(tag)
    }

    fn tag(group: &WriteGroup) -> Vec<u8> {
        match group.current() {
            Some(crate::protocol::Pending::Memory(bytes)) => bytes.to_vec(),
            other => panic!("unexpected pending piece {other:?}"),
        }
    }

    /// Releases and completes everything currently releasable.
    fn drain(coordinator: &mut ResponseCoordinator) -> Vec<Vec<u8>> {
        let mut written = Vec::new();
        while let Some(group) = coordinator.poll_releasable() {
            written.push(tag(&group));
            coordinator.mark_done(group.sequence().unwrap()).unwrap();
        }
        written
    }

    #[test]
    fn sequences_are_monotonic() {
        let mut coordinator = ResponseCoordinator::new(4);

        assert_eq!(coordinator.register_slot(None).unwrap(), 1);
        assert_eq!(coordinator.register_slot(None).unwrap(), 2);
        assert_eq!(coordinator.head_sequence(), Some(1));
        assert_eq!(coordinator.depth(), 2);
    }

    #[test]
    fn out_of_order_completion_is_released_in_order() {
        let mut coordinator = ResponseCoordinator::new(8);
        let s1 = coordinator.register_slot(None).unwrap();
        let s2 = coordinator.register_slot(None).unwrap();
        let s3 = coordinator.register_slot(None).unwrap();

        coordinator.attach_response(s3, group("G3")).unwrap();
        assert!(coordinator.poll_releasable().is_none());
        assert_eq!(coordinator.slot(s3).unwrap().state(), SlotState::Ready);

        coordinator.attach_response(s1, group("G1")).unwrap();
        assert_eq!(drain(&mut coordinator), vec![b"G1".to_vec()]);

        coordinator.attach_response(s2, group("G2")).unwrap();
        assert_eq!(drain(&mut coordinator), vec![b"G2".to_vec(), b"G3".to_vec()]);
        assert!(coordinator.is_empty());
    }

    #[test]
    fn head_is_not_released_twice() {
        let mut coordinator = ResponseCoordinator::new(2);
        let s1 = coordinator.register_slot(None).unwrap();
        let s2 = coordinator.register_slot(None).unwrap();
        coordinator.attach_response(s1, group("G1")).unwrap();
        coordinator.attach_response(s2, group("G2")).unwrap();

        let g1 = coordinator.poll_releasable().unwrap();
        // head is Released but not Done yet, so nothing behind it may go
        assert!(coordinator.poll_releasable().is_none());
        assert_eq!(coordinator.slot(s1).unwrap().state(), SlotState::Released);

        coordinator.mark_done(g1.sequence().unwrap()).unwrap();
        assert_eq!(coordinator.poll_releasable().unwrap().sequence(), Some(s2));
    }

    #[test]
    fn backpressure_until_head_is_done() {
        let mut coordinator = ResponseCoordinator::new(2);
        let s1 = coordinator.register_slot(None).unwrap();
        coordinator.register_slot(None).unwrap();

        assert!(matches!(coordinator.register_slot(None), Err(PipelineError::BackpressureBlocked { depth: 2 })));
        assert!(!coordinator.has_capacity());

        coordinator.attach_response(s1, group("G1")).unwrap();
        let g1 = coordinator.poll_releasable().unwrap();
        // released but still writing: the slot still counts
        assert!(coordinator.register_slot(None).is_err());

        coordinator.mark_done(g1.sequence().unwrap()).unwrap();
        assert_eq!(coordinator.register_slot(None).unwrap(), 3);
    }

    #[test]
    fn attach_to_unknown_slot_is_not_fatal() {
        let mut coordinator = ResponseCoordinator::new(2);
        let mut late = group("late");
        let outcome = late.with_completion();

        let err = coordinator.attach_response(42, late).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownSlot { sequence: 42 }));
        assert!(!err.is_fatal());
        assert_eq!(outcome.blocking_recv().unwrap(), WriteOutcome::Abandoned { written: 0 });
    }

    #[test]
    fn duplicate_final_response_is_refused() {
        let mut coordinator = ResponseCoordinator::new(2);
        let s1 = coordinator.register_slot(None).unwrap();

        assert_eq!(coordinator.attach_response(s1, group("a")).unwrap(), Attached::Complete);
        assert!(matches!(coordinator.attach_response(s1, group("b")), Err(PipelineError::DuplicateResponse { sequence: 1 })));
    }

    #[test]
    fn streamed_response_holds_the_head() {
        let mut coordinator = ResponseCoordinator::new(4);
        let s1 = coordinator.register_slot(None).unwrap();
        let s2 = coordinator.register_slot(None).unwrap();

        coordinator.attach_response(s2, group("B")).unwrap();
        assert_eq!(coordinator.attach_response(s1, group("A-head").with_last(false)).unwrap(), Attached::Partial);
        assert_eq!(drain(&mut coordinator), vec![b"A-head".to_vec()]);
        assert_eq!(coordinator.slot(s1).unwrap().state(), SlotState::Pending);

        coordinator.attach_response(s1, group("A-chunk").with_last(false)).unwrap();
        coordinator.attach_response(s1, group("A-end")).unwrap();
        assert_eq!(drain(&mut coordinator), vec![b"A-chunk".to_vec(), b"A-end".to_vec(), b"B".to_vec()]);
    }

    #[test]
    fn evict_aborts_everything() {
        let mut coordinator = ResponseCoordinator::new(4);
        let storage = SharedBytes::from("cached");
        let s1 = coordinator.register_slot(None).unwrap();
        let s2 = coordinator.register_slot(None).unwrap();

        let buffered = WriteGroup::new([crate::protocol::Buffer::Shared(storage.full())]).unwrap();
        coordinator.attach_response(s2, buffered).unwrap();
        assert_eq!(storage.ref_count(), 2);

        coordinator.evict(s1, EvictReason::Timeout).unwrap();
        assert!(coordinator.is_closed());
        assert!(coordinator.is_empty());
        // s2 must never be written in place of s1
        assert!(coordinator.poll_releasable().is_none());
        assert_eq!(storage.ref_count(), 1);

        assert!(matches!(coordinator.register_slot(None), Err(PipelineError::Closed)));
        assert!(matches!(coordinator.attach_response(s2, group("x")), Err(PipelineError::Closed)));
        assert!(coordinator.mark_done(s2).is_ok());
    }

    #[test]
    fn released_slot_can_not_be_evicted() {
        let mut coordinator = ResponseCoordinator::new(4);
        let s1 = coordinator.register_slot(None).unwrap();
        coordinator.attach_response(s1, group("G1")).unwrap();
        let _g1 = coordinator.poll_releasable().unwrap();

        assert!(matches!(coordinator.evict(s1, EvictReason::Timeout), Err(PipelineError::UnknownSlot { .. })));
        assert!(!coordinator.is_closed());
    }

    #[test]
    fn sealed_coordinator_drains_but_refuses_new_slots() {
        let mut coordinator = ResponseCoordinator::new(4);
        let s1 = coordinator.register_slot(None).unwrap();
        coordinator.seal();

        assert!(matches!(coordinator.register_slot(None), Err(PipelineError::Closed)));
        coordinator.attach_response(s1, group("upgrade")).unwrap();
        assert_eq!(drain(&mut coordinator), vec![b"upgrade".to_vec()]);
    }

    proptest! {
        #[test]
        fn release_order_is_registration_order(order in Just((1u64..=12).collect::<Vec<_>>()).prop_shuffle()) {
            let mut coordinator = ResponseCoordinator::new(12);
            for _ in 0..order.len() {
                coordinator.register_slot(None).unwrap();
            }

            let mut written = Vec::new();
            for sequence in order {
                coordinator.attach_response(sequence, WriteGroup::from_bytes(sequence.to_string())).unwrap();
                written.extend(drain(&mut coordinator));
            }

            let expected: Vec<Vec<u8>> = (1u64..=12).map(|sequence| sequence.to_string().into_bytes()).collect();
            prop_assert_eq!(written, expected);
            prop_assert!(coordinator.is_empty());
        }
    }
}
