//! # Vellum Rendering Substrate
//!
//! The part of a client windowing toolkit that turns "I have new pixels"
//! into a correctly synchronized buffer submission to a display server,
//! while multiplexing socket I/O, timers and deferred work on one thread.
//!
//! ## Architecture
//!
//! Vellum is built from the leaves up:
//! - `buffer::pool`: bump allocator over shared memory handed to the server
//! - `buffer`: shared-memory and GPU buffer backends
//! - `window`: per-surface dirty tracking and the frame-gated redraw task
//! - `event_loop`: socket, timer and descriptor multiplexing plus deferred tasks
//! - `display`: the context owning all of the above
//! - `protocol`: the transport boundary and an in-process headless server
//! - `config`: configuration parsing and management
//!
//! ## Usage
//!
//! ```rust,no_run
//! use vellum::protocol::headless::HeadlessTransport;
//! use vellum::{Display, Frame, VellumConfig, WindowHandler};
//!
//! struct Solid;
//!
//! impl WindowHandler for Solid {
//!     fn draw(&mut self, frame: &mut Frame<'_>) {
//!         if let vellum::buffer::DrawTarget::Shm(target) = frame.target() {
//!             target.fill(0xff20_4080);
//!         }
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let transport = HeadlessTransport::new()?;
//!     let mut display = Display::connect(Box::new(transport), VellumConfig::default())?;
//!     let window = display.create_window(640, 480, Solid)?;
//!     display.defer(|display| display.exit_loop());
//!     display.run()?;
//!     display.destroy_window(window)?;
//!     display.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod display;
pub mod error;
pub mod event_loop;
pub mod output;
pub mod protocol;
pub mod window;

// Re-export main types for easy access
pub use buffer::{BufferBackend, BufferType, GpuContext, GpuDevice, Pool, ShmBackend, MAX_LEAVES};
pub use config::VellumConfig;
pub use display::Display;
pub use error::{BackendError, PoolError, ToolkitError, ToolkitResult, TransportError};
pub use event_loop::{Interest, Readiness, TaskId, TimerFd};
pub use output::Output;
pub use protocol::Transport;
pub use window::{
    Frame, FrameStats, Layout, SubsurfaceMode, SurfaceHandle, WindowHandler, WindowId,
};

/// Version information for Vellum
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
