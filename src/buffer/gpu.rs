//! GPU-backed buffer backend
//!
//! The toolkit does not issue GPU commands itself. A [`GpuDevice`] creates a
//! [`GpuWindowSurface`] per protocol surface; the surface owns its swap
//! chain, presents by committing through the transport, and reports the
//! size the presenter actually attached. [`GpuBackend`] adapts such a
//! surface to the [`BufferBackend`] cycle.
//!
//! [`HeadlessGpu`] simulates a device for tests and the demo binary.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};

use super::{BufferBackend, BufferType, DrawTarget, PrepareRequest};
use crate::error::BackendError;
use crate::protocol::{BufferId, BufferListener, Size, SurfaceId, Transport};

/// Opaque handle to a GPU rendering context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuContext(pub u64);

/// Source of GPU window surfaces.
pub trait GpuDevice {
    /// Creates a window surface presenting to `surface`, or `None` if the
    /// device cannot drive it.
    fn create_window_surface(
        &mut self,
        surface: SurfaceId,
        size: Size,
    ) -> Option<Box<dyn GpuWindowSurface>>;
}

/// A presentable GPU surface bound to one protocol surface.
pub trait GpuWindowSurface {
    /// Resizes the swap chain in buffer pixels.
    fn resize(&mut self, size: Size);

    /// Presents the current back buffer.
    fn swap_buffers(&mut self, transport: &mut dyn Transport) -> Result<(), BackendError>;

    /// Size of the buffer the presenter attached on the last swap.
    fn attached_size(&self) -> Size;

    /// Makes the surface current with `context`, or the device default.
    fn make_current(&mut self, context: Option<&GpuContext>) -> Result<(), BackendError>;

    fn release_current(&mut self);

    fn destroy(&mut self, transport: &mut dyn Transport);
}

/// Backend drawing through a GPU window surface.
pub struct GpuBackend {
    surface: Box<dyn GpuWindowSurface>,
    prepared: Option<Size>,
    bound: bool,
}

impl GpuBackend {
    pub fn new(surface: Box<dyn GpuWindowSurface>) -> Self {
        Self {
            surface,
            prepared: None,
            bound: false,
        }
    }
}

impl BufferListener for GpuBackend {
    fn owns_buffer(&self, _buffer: BufferId) -> bool {
        false
    }

    // The presenter recycles its own buffers.
    fn buffer_released(
        &mut self,
        _transport: &mut dyn Transport,
        buffer: BufferId,
    ) -> Result<(), BackendError> {
        Err(BackendError::UnknownBuffer(buffer))
    }
}

impl BufferBackend for GpuBackend {
    fn kind(&self) -> BufferType {
        BufferType::Gpu
    }

    fn prepare(
        &mut self,
        _transport: &mut dyn Transport,
        request: &PrepareRequest,
    ) -> Result<(), BackendError> {
        if self.prepared.is_some() {
            return Err(BackendError::AlreadyPrepared);
        }
        let size = request.buffer_size()?;
        if size.is_empty() {
            return Err(BackendError::InvalidSize {
                width: size.width,
                height: size.height,
            });
        }
        self.surface.resize(size);
        self.prepared = Some(size);
        Ok(())
    }

    fn target(&mut self) -> Option<DrawTarget<'_>> {
        self.prepared.map(|size| DrawTarget::Gpu { size })
    }

    fn swap(
        &mut self,
        transport: &mut dyn Transport,
        _surface: SurfaceId,
    ) -> Result<Size, BackendError> {
        self.prepared.take().ok_or(BackendError::NotPrepared)?;
        self.surface.swap_buffers(transport)?;
        Ok(self.surface.attached_size())
    }

    fn discard(&mut self) {
        self.prepared = None;
    }

    fn acquire(&mut self, context: Option<&GpuContext>) -> Result<(), BackendError> {
        self.surface.make_current(context)?;
        self.bound = true;
        Ok(())
    }

    fn release(&mut self) {
        if self.bound {
            self.surface.release_current();
            self.bound = false;
        }
    }

    fn busy_buffers(&self) -> usize {
        0
    }

    fn destroy(&mut self, transport: &mut dyn Transport) {
        self.release();
        self.surface.destroy(transport);
        self.prepared = None;
    }
}

#[derive(Debug, Default)]
struct HeadlessGpuState {
    max_size: Option<Size>,
    lost: bool,
    refuse_surfaces: bool,
    live_surfaces: usize,
    swaps: u64,
    current: Option<(SurfaceId, GpuContext)>,
}

/// Simulated GPU device.
///
/// Clones share state, so a test can keep one clone for inspection after
/// handing another to the display.
#[derive(Debug, Clone, Default)]
pub struct HeadlessGpu {
    state: Rc<RefCell<HeadlessGpuState>>,
}

impl HeadlessGpu {
    /// Context used when a caller acquires without naming one.
    pub const DEFAULT_CONTEXT: GpuContext = GpuContext(1);

    pub fn new() -> Self {
        Self::default()
    }

    /// Presenter coerces swap chains larger than `size` down to it.
    pub fn with_max_size(self, size: Size) -> Self {
        self.state.borrow_mut().max_size = Some(size);
        self
    }

    /// Simulates a lost device: surfaces can no longer be made current.
    pub fn lose_device(&self) {
        self.state.borrow_mut().lost = true;
    }

    /// Makes window surface creation fail.
    pub fn refuse_surfaces(&self, refuse: bool) {
        self.state.borrow_mut().refuse_surfaces = refuse;
    }

    pub fn live_surfaces(&self) -> usize {
        self.state.borrow().live_surfaces
    }

    pub fn swaps(&self) -> u64 {
        self.state.borrow().swaps
    }

    pub fn current(&self) -> Option<(SurfaceId, GpuContext)> {
        self.state.borrow().current
    }
}

impl GpuDevice for HeadlessGpu {
    fn create_window_surface(
        &mut self,
        surface: SurfaceId,
        size: Size,
    ) -> Option<Box<dyn GpuWindowSurface>> {
        let mut state = self.state.borrow_mut();
        if state.refuse_surfaces || state.lost {
            return None;
        }
        state.live_surfaces += 1;
        debug!("🎮 Headless GPU surface for {:?}", surface);
        Some(Box::new(HeadlessGpuSurface {
            state: Rc::clone(&self.state),
            surface,
            size,
            attached: Size::default(),
            destroyed: false,
        }))
    }
}

struct HeadlessGpuSurface {
    state: Rc<RefCell<HeadlessGpuState>>,
    surface: SurfaceId,
    size: Size,
    attached: Size,
    destroyed: bool,
}

impl GpuWindowSurface for HeadlessGpuSurface {
    fn resize(&mut self, size: Size) {
        self.size = match self.state.borrow().max_size {
            Some(max) => Size::new(size.width.min(max.width), size.height.min(max.height)),
            None => size,
        };
    }

    fn swap_buffers(&mut self, transport: &mut dyn Transport) -> Result<(), BackendError> {
        if self.state.borrow().lost {
            return Err(BackendError::Present("device lost".to_string()));
        }
        transport.commit(self.surface);
        self.attached = self.size;
        self.state.borrow_mut().swaps += 1;
        Ok(())
    }

    fn attached_size(&self) -> Size {
        self.attached
    }

    fn make_current(&mut self, context: Option<&GpuContext>) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        if state.lost {
            return Err(BackendError::NoDevice);
        }
        let context = context.copied().unwrap_or(HeadlessGpu::DEFAULT_CONTEXT);
        state.current = Some((self.surface, context));
        Ok(())
    }

    fn release_current(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.current.map(|(s, _)| s) == Some(self.surface) {
            state.current = None;
        }
    }

    fn destroy(&mut self, _transport: &mut dyn Transport) {
        if !self.destroyed {
            self.destroyed = true;
            self.state.borrow_mut().live_surfaces -= 1;
        }
    }
}

impl Drop for HeadlessGpuSurface {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!("GPU surface for {:?} dropped without destroy", self.surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::headless::HeadlessTransport;

    fn backend(gpu: &mut HeadlessGpu, transport: &mut HeadlessTransport) -> (GpuBackend, SurfaceId) {
        let surface = transport.create_surface().unwrap();
        let window = gpu
            .create_window_surface(surface, Size::new(10, 10))
            .unwrap();
        (GpuBackend::new(window), surface)
    }

    #[test]
    fn swap_reports_the_coerced_size() {
        let mut transport = HeadlessTransport::new().unwrap();
        let mut gpu = HeadlessGpu::new().with_max_size(Size::new(100, 50));
        let (mut backend, surface) = backend(&mut gpu, &mut transport);

        backend
            .prepare(&mut transport, &PrepareRequest::new(Size::new(300, 40)))
            .unwrap();
        assert!(matches!(
            backend.target(),
            Some(DrawTarget::Gpu { size }) if size == Size::new(300, 40)
        ));
        let committed = backend.swap(&mut transport, surface).unwrap();

        assert_eq!(committed, Size::new(100, 40));
        assert_eq!(gpu.swaps(), 1);
        assert_eq!(transport.handle().commits(surface), 1);
        backend.destroy(&mut transport);
    }

    #[test]
    fn acquire_binds_and_release_unbinds() {
        let mut transport = HeadlessTransport::new().unwrap();
        let mut gpu = HeadlessGpu::new();
        let (mut backend, surface) = backend(&mut gpu, &mut transport);

        backend.acquire(None).unwrap();
        assert_eq!(gpu.current(), Some((surface, HeadlessGpu::DEFAULT_CONTEXT)));
        backend.release();
        assert_eq!(gpu.current(), None);

        backend.acquire(Some(&GpuContext(7))).unwrap();
        assert_eq!(gpu.current(), Some((surface, GpuContext(7))));
        backend.destroy(&mut transport);
        assert_eq!(gpu.current(), None);
        assert_eq!(gpu.live_surfaces(), 0);
    }

    #[test]
    fn lost_device_fails_acquire_with_no_device() {
        let mut transport = HeadlessTransport::new().unwrap();
        let mut gpu = HeadlessGpu::new();
        let (mut backend, _surface) = backend(&mut gpu, &mut transport);

        gpu.lose_device();
        assert!(matches!(backend.acquire(None), Err(BackendError::NoDevice)));
        backend.destroy(&mut transport);
    }

    #[test]
    fn prepare_twice_is_rejected() {
        let mut transport = HeadlessTransport::new().unwrap();
        let mut gpu = HeadlessGpu::new();
        let (mut backend, _surface) = backend(&mut gpu, &mut transport);
        let request = PrepareRequest::new(Size::new(20, 20));

        backend.prepare(&mut transport, &request).unwrap();
        assert!(matches!(
            backend.prepare(&mut transport, &request),
            Err(BackendError::AlreadyPrepared)
        ));
        backend.discard();
        backend.prepare(&mut transport, &request).unwrap();
        backend.destroy(&mut transport);
    }
}
