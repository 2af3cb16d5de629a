//! Display protocol boundary
//!
//! The toolkit never encodes wire messages itself. Everything it needs from
//! the display server goes through the [`Transport`] trait: object creation,
//! surface requests, flushing, and a pollable descriptor the event loop can
//! watch. Incoming events are delivered as plain [`Event`] values and routed
//! to their owners through the listener traits below, one per protocol
//! object kind.
//!
//! # Objects
//!
//! - **Surface / Subsurface**: renderable units and their parent links
//! - **Pool / Buffer**: shared-memory storage handed to the server
//! - **Callback**: one-shot frame-completion notifications
//! - **Output**: monitors announced by the server
//!
//! [`headless::HeadlessTransport`] is an in-process server used by the test
//! suite and the demo binary.

pub mod headless;

use std::os::fd::BorrowedFd;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

macro_rules! object_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

object_id!(
    /// Server-side surface object
    SurfaceId,
    /// Sub-surface role object linking a surface to its parent
    SubsurfaceId,
    /// Shared-memory pool object
    PoolId,
    /// Buffer object carved out of a pool
    BufferId,
    /// Frame-completion callback object
    CallbackId,
    /// Output (monitor) object
    OutputId,
);

/// Pixel layouts accepted for shared-memory buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Argb8888,
    Xrgb8888,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }

    /// Row stride in bytes, padded to a four byte boundary. `None` if the
    /// row does not fit in 32 bits.
    pub fn stride(self, width: u32) -> Option<u32> {
        let row = width.checked_mul(self.bytes_per_pixel())?;
        Some(row.checked_add(3)? & !3)
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Argb8888)
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Axis aligned rectangle in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

/// Buffer transform applied by the server when presenting a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferTransform {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl BufferTransform {
    /// Whether the transform swaps the width and height axes.
    pub fn swaps_axes(self) -> bool {
        matches!(
            self,
            BufferTransform::Rotate90
                | BufferTransform::Rotate270
                | BufferTransform::Flipped90
                | BufferTransform::Flipped270
        )
    }
}

/// Converts a surface-coordinate size to the buffer size that backs it.
/// Returns `None` if the scaled size overflows.
pub fn surface_to_buffer_size(size: Size, transform: BufferTransform, scale: u32) -> Option<Size> {
    let scale = scale.max(1);
    let (w, h) = if transform.swaps_axes() {
        (size.height, size.width)
    } else {
        (size.width, size.height)
    };
    Some(Size::new(w.checked_mul(scale)?, h.checked_mul(scale)?))
}

/// Inverse of [`surface_to_buffer_size`].
pub fn buffer_to_surface_size(size: Size, transform: BufferTransform, scale: u32) -> Size {
    let scale = scale.max(1);
    let (w, h) = if transform.swaps_axes() {
        (size.height, size.width)
    } else {
        (size.width, size.height)
    };
    Size::new(w / scale, h / scale)
}

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Every queued request reached the socket.
    Done,
    /// The socket buffer is full; retry once it becomes writable.
    WouldBlock,
}

/// Output description events, delivered in order and terminated by `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Geometry {
        x: i32,
        y: i32,
        physical_width: i32,
        physical_height: i32,
        make: String,
        model: String,
        transform: BufferTransform,
    },
    Mode {
        current: bool,
        width: i32,
        height: i32,
        refresh: i32,
    },
    Scale(i32),
    Done,
}

/// Events delivered by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BufferRelease(BufferId),
    FrameDone { callback: CallbackId, time: u32 },
    Output { output: OutputId, event: OutputEvent },
    OutputRemoved(OutputId),
    SurfaceEnter { surface: SurfaceId, output: OutputId },
    SurfaceLeave { surface: SurfaceId, output: OutputId },
    Configure { surface: SurfaceId, width: u32, height: u32 },
}

/// Receives buffer events for the buffers an object owns.
pub trait BufferListener {
    fn owns_buffer(&self, buffer: BufferId) -> bool;

    fn buffer_released(
        &mut self,
        transport: &mut dyn Transport,
        buffer: BufferId,
    ) -> Result<(), crate::error::BackendError>;
}

/// Receives frame-completion callbacks.
pub trait CallbackListener {
    fn owns_callback(&self, callback: CallbackId) -> bool;

    fn frame_done(&mut self, callback: CallbackId, time: u32);
}

/// Receives output description events.
pub trait OutputListener {
    fn geometry(&mut self, x: i32, y: i32, make: &str, model: &str, transform: BufferTransform);
    fn mode(&mut self, current: bool, width: i32, height: i32, refresh: i32);
    fn scale(&mut self, factor: i32);
    fn done(&mut self);
}

/// Client side of the display protocol.
///
/// Requests are queued and may only reach the server on [`Transport::flush`].
/// Events arrive on [`Transport::read_events`] and are handed out by
/// [`Transport::dispatch_pending`].
pub trait Transport {
    /// Descriptor that becomes readable when events are waiting.
    fn socket(&self) -> BorrowedFd<'_>;

    /// Reads whatever the socket holds without blocking. Returns the number
    /// of events made pending.
    fn read_events(&mut self) -> Result<usize, TransportError>;

    /// Hands out events already read from the socket.
    fn dispatch_pending(&mut self) -> Result<Vec<Event>, TransportError>;

    fn flush(&mut self) -> Result<FlushStatus, TransportError>;

    fn create_surface(&mut self) -> Result<SurfaceId, TransportError>;
    fn destroy_surface(&mut self, surface: SurfaceId);

    fn create_subsurface(
        &mut self,
        surface: SurfaceId,
        parent: SurfaceId,
    ) -> Result<SubsurfaceId, TransportError>;
    fn set_subsurface_sync(&mut self, subsurface: SubsurfaceId, sync: bool);
    fn set_subsurface_position(&mut self, subsurface: SubsurfaceId, x: i32, y: i32);
    fn destroy_subsurface(&mut self, subsurface: SubsurfaceId);

    /// Shares `size` bytes behind `fd` with the server.
    fn create_pool(&mut self, fd: BorrowedFd<'_>, size: usize) -> Result<PoolId, TransportError>;
    fn destroy_pool(&mut self, pool: PoolId);

    fn create_buffer(
        &mut self,
        pool: PoolId,
        offset: usize,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> Result<BufferId, TransportError>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferId>);
    fn damage(&mut self, surface: SurfaceId, region: Rect);
    fn set_buffer_scale(&mut self, surface: SurfaceId, scale: u32);
    fn set_buffer_transform(&mut self, surface: SurfaceId, transform: BufferTransform);
    fn frame(&mut self, surface: SurfaceId) -> Result<CallbackId, TransportError>;
    fn destroy_callback(&mut self, callback: CallbackId);
    fn commit(&mut self, surface: SurfaceId);
}
