//! Ordering core of the engine.
//!
//! [`ResponseCoordinator`] owns one [`PipelineSlot`] per in-flight request and
//! decides which [`WriteGroup`](crate::protocol::WriteGroup) may go to the wire
//! next. [`TimeoutManager`] watches the deadlines of those slots and of the
//! connection itself.

mod coordinator;
mod slot;
mod timeout;

pub use coordinator::{Attached, ResponseCoordinator};
pub use slot::{PipelineSlot, SlotState};
pub use timeout::{Expired, TimeoutManager};
