//! Windows, surfaces and the redraw scheduler
//!
//! A [`Window`] owns a main surface and any number of auxiliary
//! sub-surfaces. Every surface carries a `dirty` flag and at most one
//! outstanding frame-completion callback. Dirty signals are coalesced into a
//! single deferred redraw task per window; the task itself lives in
//! [`scheduler`].
//!
//! Callers plug in through [`WindowHandler`]: `resize` lays out the
//! auxiliary surfaces for a new window size, `draw` paints one surface into
//! the [`Frame`] it is handed.

pub mod frame_clock;
mod scheduler;

#[cfg(test)]
mod tests;

use log::{debug, trace};

use crate::buffer::{BufferBackend, BufferType, DrawTarget};
use crate::config::VellumConfig;
use crate::error::BackendError;
use crate::protocol::{
    buffer_to_surface_size, BufferTransform, CallbackId, CallbackListener, OutputId, PixelFormat,
    Rect, Size, SubsurfaceId, SurfaceId, Transport,
};

pub use frame_clock::{FrameClock, FrameStats};
pub(crate) use scheduler::{RedrawContext, RedrawOutcome};

/// Identifier of a toolkit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

/// Names one surface of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle {
    pub window: WindowId,
    pub surface: SurfaceId,
}

/// Commit mode of a sub-surface outside of resizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubsurfaceMode {
    /// Commits apply together with the parent's next commit.
    Synchronized,
    /// Commits apply on their own.
    #[default]
    Desynchronized,
}

/// Caller side of a window.
pub trait WindowHandler {
    /// Paints one surface. Called once per redraw of that surface.
    fn draw(&mut self, frame: &mut Frame<'_>);

    /// Lays out auxiliary surfaces for a new window size.
    fn resize(&mut self, _layout: &mut Layout<'_>) {}

    /// The window entered (`true`) or left an output.
    fn output_changed(&mut self, _output: OutputId, _entered: bool) {}
}

/// A prepared drawable handed to [`WindowHandler::draw`].
pub struct Frame<'a> {
    surface: SurfaceHandle,
    main: bool,
    allocation: Rect,
    scale: u32,
    time: u32,
    target: DrawTarget<'a>,
    next_frame: bool,
}

impl<'a> Frame<'a> {
    pub fn surface(&self) -> SurfaceHandle {
        self.surface
    }

    /// Whether this is the window's main surface.
    pub fn is_main(&self) -> bool {
        self.main
    }

    /// Allocation in surface coordinates, relative to the main surface.
    pub fn allocation(&self) -> Rect {
        self.allocation
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Server timestamp of the last presented frame, 0 before the first.
    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn target(&mut self) -> &mut DrawTarget<'a> {
        &mut self.target
    }

    /// Keeps the surface dirty so it is drawn again after this frame is
    /// presented.
    pub fn request_next_frame(&mut self) {
        self.next_frame = true;
    }
}

/// Allocation editor handed to [`WindowHandler::resize`].
pub struct Layout<'a> {
    size: Size,
    surfaces: &'a mut [Surface],
}

impl Layout<'_> {
    /// New size of the main surface.
    pub fn size(&self) -> Size {
        self.size
    }

    /// Auxiliary surfaces in creation order.
    pub fn auxiliary(&self) -> Vec<SurfaceId> {
        self.surfaces.iter().skip(1).map(|s| s.id).collect()
    }

    pub fn allocation(&self, surface: SurfaceId) -> Option<Rect> {
        self.surfaces
            .iter()
            .find(|s| s.id == surface)
            .map(|s| s.allocation)
    }

    /// Sets an auxiliary surface's allocation. The main surface always
    /// covers the window and cannot be placed.
    pub fn place(&mut self, surface: SurfaceId, allocation: Rect) -> bool {
        match self.surfaces.iter_mut().skip(1).find(|s| s.id == surface) {
            Some(s) => {
                s.allocation = allocation;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Subsurface {
    pub(crate) id: SubsurfaceId,
    pub(crate) mode: SubsurfaceMode,
}

/// One renderable unit of a window.
pub(crate) struct Surface {
    pub(crate) id: SurfaceId,
    pub(crate) subsurface: Option<Subsurface>,
    pub(crate) backend: Option<Box<dyn BufferBackend>>,
    pub(crate) allocation: Rect,
    /// Size of the last committed buffer, in surface coordinates.
    pub(crate) server_allocation: Size,
    pub(crate) dirty: bool,
    pub(crate) frame_cb: Option<CallbackId>,
    pub(crate) applied_scale: u32,
    pub(crate) applied_transform: BufferTransform,
    pub(crate) clock: FrameClock,
}

impl Surface {
    pub(crate) fn new(id: SurfaceId, subsurface: Option<Subsurface>, history: usize) -> Self {
        Self {
            id,
            subsurface,
            backend: None,
            allocation: Rect::default(),
            server_allocation: Size::default(),
            dirty: false,
            frame_cb: None,
            applied_scale: 1,
            applied_transform: BufferTransform::Normal,
            clock: FrameClock::new(history),
        }
    }

    pub(crate) fn frame_in_flight(&self) -> bool {
        self.frame_cb.is_some()
    }

    /// Pushes scale and transform changes, then submits the prepared
    /// drawable.
    pub(crate) fn swap(
        &mut self,
        transport: &mut dyn Transport,
        scale: u32,
        transform: BufferTransform,
    ) -> Result<(), BackendError> {
        let backend = self.backend.as_mut().ok_or(BackendError::NotPrepared)?;
        if self.applied_scale != scale {
            transport.set_buffer_scale(self.id, scale);
            self.applied_scale = scale;
        }
        if self.applied_transform != transform {
            transport.set_buffer_transform(self.id, transform);
            self.applied_transform = transform;
        }
        let committed = backend.swap(transport, self.id)?;
        self.server_allocation = buffer_to_surface_size(committed, transform, scale);
        Ok(())
    }

    /// Cancels the outstanding frame callback, if any.
    pub(crate) fn cancel_frame(&mut self, transport: &mut dyn Transport) {
        if let Some(callback) = self.frame_cb.take() {
            transport.destroy_callback(callback);
        }
    }

    pub(crate) fn destroy(&mut self, transport: &mut dyn Transport) {
        self.cancel_frame(transport);
        if let Some(mut backend) = self.backend.take() {
            backend.destroy(transport);
        }
        if let Some(subsurface) = self.subsurface.take() {
            transport.destroy_subsurface(subsurface.id);
        }
        transport.destroy_surface(self.id);
    }
}

impl CallbackListener for Surface {
    fn owns_callback(&self, callback: CallbackId) -> bool {
        self.frame_cb == Some(callback)
    }

    fn frame_done(&mut self, callback: CallbackId, time: u32) {
        trace!("Frame {:?} done on {:?} at {}", callback, self.id, time);
        self.frame_cb = None;
        self.clock.record(time);
    }
}

/// A toplevel window: main surface at index 0, auxiliary surfaces after.
pub struct Window {
    pub(crate) id: WindowId,
    pub(crate) surfaces: Vec<Surface>,
    pub(crate) handler: Box<dyn WindowHandler>,
    pub(crate) redraw_needed: bool,
    pub(crate) resize_needed: bool,
    pub(crate) pending_allocation: Size,
    pub(crate) min_allocation: Size,
    pub(crate) buffer_scale: u32,
    pub(crate) buffer_transform: BufferTransform,
    pub(crate) resizing: bool,
    pub(crate) preferred: BufferType,
    pub(crate) format: PixelFormat,
    pub(crate) timers: Vec<std::os::fd::RawFd>,
    pub(crate) outputs: Vec<OutputId>,
}

impl Window {
    pub(crate) fn new(
        id: WindowId,
        main: SurfaceId,
        handler: Box<dyn WindowHandler>,
        config: &VellumConfig,
    ) -> Self {
        let preferred = if config.gpu.preferred() {
            BufferType::Gpu
        } else {
            BufferType::Shm
        };
        Self {
            id,
            surfaces: vec![Surface::new(main, None, config.general.frame_history)],
            handler,
            redraw_needed: false,
            resize_needed: false,
            pending_allocation: Size::default(),
            min_allocation: Size::new(config.window.min_width, config.window.min_height),
            buffer_scale: 1,
            buffer_transform: BufferTransform::Normal,
            resizing: false,
            preferred,
            format: config.shm.format,
            timers: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub(crate) fn main_surface(&self) -> SurfaceId {
        self.surfaces[0].id
    }

    /// Current allocation of the main surface.
    pub fn allocation(&self) -> Rect {
        self.surfaces[0].allocation
    }

    pub(crate) fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.id == id)
    }

    pub(crate) fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.iter_mut().find(|s| s.id == id)
    }

    pub(crate) fn frame_in_flight(&self) -> bool {
        self.surfaces.iter().any(Surface::frame_in_flight)
    }

    /// Whether the redraw task has work to do.
    pub(crate) fn needs_redraw(&self) -> bool {
        self.redraw_needed || self.resize_needed || self.surfaces.iter().any(|s| s.dirty)
    }

    /// Marks every surface dirty.
    pub(crate) fn schedule_redraw(&mut self) {
        for surface in &mut self.surfaces {
            surface.dirty = true;
        }
    }

    /// Requests a new main-surface size, clamped to the window minimum.
    pub(crate) fn schedule_resize(&mut self, width: u32, height: u32) {
        let size = Size::new(
            width.max(self.min_allocation.width),
            height.max(self.min_allocation.height),
        );
        debug!("📐 Window {:?} resize to {}x{}", self.id, size.width, size.height);
        self.pending_allocation = size;
        self.resize_needed = true;
        self.schedule_redraw();
    }

    /// Lays the window out at `pending_allocation`: the main surface covers
    /// it, the handler places auxiliary surfaces, moved sub-surfaces are
    /// repositioned and the whole window is marked for redraw.
    pub(crate) fn apply_resize(&mut self, transport: &mut dyn Transport) {
        self.resize_needed = false;
        self.redraw_needed = true;

        let before: Vec<Rect> = self.surfaces.iter().map(|s| s.allocation).collect();
        let size = self.pending_allocation;
        self.surfaces[0].allocation = Rect::from_size(size);

        let mut layout = Layout {
            size,
            surfaces: &mut self.surfaces,
        };
        self.handler.resize(&mut layout);

        for (surface, old) in self.surfaces.iter_mut().zip(before) {
            if surface.allocation.size() != old.size() {
                surface.dirty = true;
            }
            if let Some(sub) = surface.subsurface {
                if (surface.allocation.x, surface.allocation.y) != (old.x, old.y) {
                    transport.set_subsurface_position(
                        sub.id,
                        surface.allocation.x,
                        surface.allocation.y,
                    );
                }
            }
        }
    }

    /// Restores the committed main-surface size after a failed resize.
    pub(crate) fn undo_resize(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<(), crate::error::ToolkitError> {
        let committed = self.surfaces[0].server_allocation;
        if committed.is_empty() {
            log::error!(
                "Window {:?} has no usable buffer; check free space in XDG_RUNTIME_DIR",
                self.id
            );
            return Err(crate::error::ToolkitError::NoUsableBuffer);
        }
        debug!(
            "↩️ Rolling window {:?} back to {}x{}",
            self.id, committed.width, committed.height
        );
        self.pending_allocation = committed;
        self.apply_resize(transport);
        Ok(())
    }

    /// Switches every sub-surface to synchronized (`true`) or back to its
    /// default mode.
    pub(crate) fn set_synchronized(&self, transport: &mut dyn Transport, synchronized: bool) {
        for sub in self.surfaces.iter().filter_map(|s| s.subsurface) {
            let sync = synchronized || sub.mode == SubsurfaceMode::Synchronized;
            transport.set_subsurface_sync(sub.id, sync);
        }
    }

    pub(crate) fn remove_surface(
        &mut self,
        transport: &mut dyn Transport,
        surface: SurfaceId,
    ) -> bool {
        match self.surfaces.iter().skip(1).position(|s| s.id == surface) {
            Some(index) => {
                let mut removed = self.surfaces.remove(index + 1);
                removed.destroy(transport);
                true
            }
            None => false,
        }
    }

    /// Destroys callbacks, backends and surfaces, auxiliary ones first.
    pub(crate) fn destroy(mut self, transport: &mut dyn Transport) {
        while let Some(mut surface) = self.surfaces.pop() {
            surface.destroy(transport);
        }
        debug!("🗑️ Window {:?} destroyed", self.id);
    }
}
