//! Error types shared across the toolkit substrate.
//!
//! Every layer reports its own enum so callers can match on the failure that
//! matters to them: the pool allocator, the buffer backends, the transport
//! and the display/event-loop context. Configuration and the demo binary use
//! `anyhow` instead.

use crate::protocol::BufferId;
use crate::window::WindowId;

pub type ToolkitResult<T> = Result<T, ToolkitError>;

/// Failures of the shared-memory pool allocator.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("pool allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },

    #[error("pool out of space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: usize, available: usize },
}

impl PoolError {
    pub fn allocation(size: usize, reason: impl ToString) -> Self {
        Self::AllocationFailed {
            size,
            reason: reason.to_string(),
        }
    }
}

/// Failures of the display protocol transport.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("display connection hung up")]
    Hangup,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Failures of a buffer backend (shared memory or GPU).
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("backing storage unavailable: {0}")]
    AllocationFailed(#[from] PoolError),

    #[error("all {leaves} buffers are held by the server")]
    ExhaustedBuffers { leaves: usize },

    #[error("a drawable is already prepared for this surface")]
    AlreadyPrepared,

    #[error("no drawable has been prepared")]
    NotPrepared,

    #[error("invalid buffer size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("surface has no rendering device")]
    NoDevice,

    #[error("release for unknown buffer {0:?}")]
    UnknownBuffer(BufferId),

    #[error("gpu presentation failed: {0}")]
    Present(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BackendError {
    /// Whether the error leaves the backend unusable for the rest of the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ExhaustedBuffers { .. } | Self::Transport(_))
    }
}

/// Failures surfaced by the display context and its event loop.
#[derive(thiserror::Error, Debug)]
pub enum ToolkitError {
    #[error("event loop error: {0}")]
    EventLoop(#[from] calloop::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{count} window(s) still alive at shutdown")]
    LeakedWindows { count: usize },

    #[error("unknown window {0:?}")]
    UnknownWindow(WindowId),

    #[error("unknown surface")]
    UnknownSurface,

    #[error("window has no usable buffer size (server allocation is 0x0)")]
    NoUsableBuffer,

    #[error("descriptor {0} is already watched")]
    AlreadyWatched(i32),

    #[error("event loop is already running")]
    LoopReentered,

    #[error("descriptor error: {0}")]
    Descriptor(#[from] std::io::Error),
}
