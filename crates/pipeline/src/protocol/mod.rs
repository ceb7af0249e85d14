//! Core data types of the output pipeline.
//!
//! - **Buffers** ([`buffer`]): [`Buffer`] over owned bytes, [`SharedBytes`]
//!   slices and [`FileRegion`]s
//! - **Write groups** ([`write_group`]): [`WriteGroup`], the ordered unit the
//!   writer drains, with its cursor and completion token
//! - **Responses** ([`response`]): [`ResponseHead`], [`ResponseBody`] and
//!   [`PayloadSize`] as produced by handlers
//! - **Errors** ([`error`]): [`HttpError`], [`PipelineError`], [`ParseError`]
//!   and [`ConfigError`]

mod buffer;
pub use buffer::Buffer;
pub use buffer::FileRegion;
pub use buffer::SharedBytes;
pub use buffer::SharedSlice;

mod write_group;
pub use write_group::AfterWrite;
pub use write_group::MAX_IO_SLICES;
pub use write_group::Pending;
pub use write_group::Transfer;
pub use write_group::WriteGroup;
pub use write_group::WriteOutcome;

mod response;
pub use response::BoxError;
pub use response::PayloadSize;
pub use response::ResponseBody;
pub use response::ResponseHead;

mod error;
pub use error::ConfigError;
pub use error::EvictReason;
pub use error::HttpError;
pub use error::ParseError;
pub use error::PipelineError;
