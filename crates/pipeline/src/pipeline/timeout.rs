//! Deadlines of one connection, driven by a single timer.

use std::collections::{BTreeSet, HashMap};
use std::future::poll_fn;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep_until};
use tracing::trace;

use crate::config::PipelineConfig;

/// A deadline that passed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Expired {
    /// the handler of `sequence` didn't produce its next response group in time
    Response { sequence: u64 },
    /// the transport made no progress for the write timeout
    Write,
    /// nothing was in flight for the idle timeout
    Idle,
}

/// Tracks response, write and idle deadlines.
///
/// A slot's deadline lives in its [`PipelineSlot`](crate::pipeline::PipelineSlot);
/// the manager only schedules a wake-up for it, and whoever handles
/// [`Expired::Response`] checks the slot to decide. Response wake-ups are ordered in a `BTreeSet` so the nearest is found in
/// `O(log n)`. Only one [`Sleep`] exists per connection; it is reset to the
/// nearest deadline whenever that changes. The sleep is created on first poll
/// since building one needs a running runtime.
pub struct TimeoutManager {
    response_timeout: Duration,
    body_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    responses: BTreeSet<(Instant, u64)>,
    by_sequence: HashMap<u64, Instant>,
    write_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl TimeoutManager {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            response_timeout: config.response_timeout(),
            body_timeout: config.body_timeout(),
            write_timeout: config.write_timeout(),
            idle_timeout: config.idle_timeout(),
            responses: BTreeSet::new(),
            by_sequence: HashMap::new(),
            write_deadline: None,
            idle_deadline: None,
            sleep: None,
        }
    }

    /// Deadline of a request registered at `now`.
    #[inline]
    pub fn response_deadline(&self, now: Instant) -> Instant {
        now + self.response_timeout
    }

    /// Deadline for the next group of a streamed response, counted from `now`.
    #[inline]
    pub fn body_deadline(&self, now: Instant) -> Instant {
        now + self.body_timeout.unwrap_or(self.response_timeout)
    }

    /// Schedules a wake-up for slot `sequence` at `deadline`, replacing any
    /// earlier one for the same slot.
    pub fn schedule(&mut self, sequence: u64, deadline: Instant) {
        if let Some(previous) = self.by_sequence.insert(sequence, deadline) {
            self.responses.remove(&(previous, sequence));
        }
        self.responses.insert((deadline, sequence));
    }

    pub fn clear_response(&mut self, sequence: u64) {
        if let Some(deadline) = self.by_sequence.remove(&sequence) {
            self.responses.remove(&(deadline, sequence));
        }
    }

    /// (Re)starts the write deadline; called whenever a write makes progress.
    pub fn arm_write(&mut self, now: Instant) {
        self.write_deadline = self.write_timeout.map(|timeout| now + timeout);
    }

    pub fn clear_write(&mut self) {
        self.write_deadline = None;
    }

    pub fn arm_idle(&mut self, now: Instant) {
        self.idle_deadline = self.idle_timeout.map(|timeout| now + timeout);
    }

    pub fn clear_idle(&mut self) {
        self.idle_deadline = None;
    }

    pub fn clear_all(&mut self) {
        self.responses.clear();
        self.by_sequence.clear();
        self.write_deadline = None;
        self.idle_deadline = None;
    }

    #[inline]
    pub fn is_write_armed(&self) -> bool {
        self.write_deadline.is_some()
    }

    #[inline]
    pub fn is_idle_armed(&self) -> bool {
        self.idle_deadline.is_some()
    }

    /// Number of slots with a running response deadline.
    #[inline]
    pub fn armed_responses(&self) -> usize {
        self.by_sequence.len()
    }

    /// The nearest of all running deadlines.
    pub fn next_deadline(&self) -> Option<Instant> {
        let response = self.responses.first().map(|(deadline, _)| *deadline);
        [response, self.write_deadline, self.idle_deadline].into_iter().flatten().min()
    }

    /// Pops one deadline that passed at `now`, response deadlines first.
    ///
    /// A popped deadline is disarmed, so it is reported once.
    pub fn expired(&mut self, now: Instant) -> Option<Expired> {
        if let Some(&(deadline, sequence)) = self.responses.first()
            && deadline <= now
        {
            self.responses.remove(&(deadline, sequence));
            self.by_sequence.remove(&sequence);
            return Some(Expired::Response { sequence });
        }

        if self.write_deadline.is_some_and(|deadline| deadline <= now) {
            self.write_deadline = None;
            return Some(Expired::Write);
        }

        if self.idle_deadline.is_some_and(|deadline| deadline <= now) {
            self.idle_deadline = None;
            return Some(Expired::Idle);
        }

        None
    }

    /// Resolves once a deadline passes. Pending forever while nothing is armed.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Expired> {
        loop {
            if let Some(expired) = self.expired(Instant::now()) {
                trace!(?expired, "deadline passed");
                return Poll::Ready(expired);
            }

            let Some(deadline) = self.next_deadline() else {
                return Poll::Pending;
            };

            let sleep = self.sleep.get_or_insert_with(|| Box::pin(sleep_until(deadline)));
            if sleep.deadline() != deadline {
                sleep.as_mut().reset(deadline);
            }
            ready!(sleep.as_mut().poll(cx));
        }
    }

    /// Cancel safe: all state lives in the manager.
    pub async fn next_expired(&mut self) -> Expired {
        poll_fn(|cx| self.poll_expired(cx)).await
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("responses", &self.responses.len())
            .field("write_deadline", &self.write_deadline)
            .field("idle_deadline", &self.idle_deadline)
            .finish_non_exhaustive()
    }
}
