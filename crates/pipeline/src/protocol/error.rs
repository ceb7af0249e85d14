use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("pipeline error: {source}")]
    PipelineError {
        #[from]
        source: PipelineError,
    },

    #[error("config error: {source}")]
    ConfigError {
        #[from]
        source: ConfigError,
    },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("unsupported transfer-encoding: {value}")]
    UnsupportedTransferEncoding { value: String },

    #[error("body size {current_size} exceed the limit {max_size}")]
    TooLargeBody { current_size: u64, max_size: usize },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn unsupported_transfer_encoding<S: ToString>(str: S) -> Self {
        Self::UnsupportedTransferEncoding { value: str.to_string() }
    }

    pub fn too_large_body(current_size: u64, max_size: usize) -> Self {
        Self::TooLargeBody { current_size, max_size }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Why a slot was removed from the pipeline before its response was written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EvictReason {
    /// the response deadline elapsed while the slot was still waiting
    Timeout,
}

/// Errors raised by the output pipeline.
///
/// Only some of them end the connection, see [`PipelineError::is_fatal`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no pipeline slot with sequence {sequence}")]
    UnknownSlot { sequence: u64 },

    #[error("slot {sequence} already received its final response")]
    DuplicateResponse { sequence: u64 },

    #[error("invalid buffer: {reason}")]
    InvalidBuffer { reason: String },

    #[error("pipeline depth {depth} reached, stop reading requests")]
    BackpressureBlocked { depth: usize },

    #[error("response for slot {sequence} not produced within {timeout:?}")]
    Timeout { sequence: u64, timeout: Duration },

    #[error("transport stayed unwritable for {timeout:?}")]
    WriteTimeout { timeout: Duration },

    #[error("pipeline is closed")]
    Closed,

    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn unknown_slot(sequence: u64) -> Self {
        Self::UnknownSlot { sequence }
    }

    pub fn invalid_buffer<S: ToString>(str: S) -> Self {
        Self::InvalidBuffer { reason: str.to_string() }
    }

    pub fn transport<E: Into<io::Error>>(e: E) -> Self {
        Self::Transport { source: e.into() }
    }

    /// Returns true if the error must tear the connection down.
    ///
    /// `UnknownSlot`, `DuplicateResponse` and `BackpressureBlocked` are expected
    /// while a connection is healthy; `InvalidBuffer` is the caller's bug and is
    /// rejected before anything reaches the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::WriteTimeout { .. } | Self::Transport { .. } | Self::Closed)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall { field: &'static str, min: usize, value: usize },

    #[error("{field} must be a non-zero duration")]
    ZeroDuration { field: &'static str },

    #[error("can't parse env {name}={value}: {reason}")]
    InvalidEnv { name: String, value: String, reason: String },
}

impl ConfigError {
    pub fn invalid_env<N: ToString, V: ToString, R: ToString>(name: N, value: V, reason: R) -> Self {
        Self::InvalidEnv { name: name.to_string(), value: value.to_string(), reason: reason.to_string() }
    }
}
