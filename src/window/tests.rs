//! Unit tests for the redraw scheduler
//!
//! These drive `Window::redraw` directly against the headless server and
//! complete frame callbacks by hand.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::*;
use crate::buffer::gpu::HeadlessGpu;
use crate::buffer::{GpuContext, PrepareRequest};
use crate::error::ToolkitError;
use crate::protocol::headless::{HeadlessHandle, HeadlessTransport, Injection};
use crate::protocol::{BufferId, BufferListener, Transport};

#[derive(Default)]
struct Log {
    draws: Vec<(SurfaceId, Rect)>,
    resizes: Vec<Size>,
}

struct Recorder {
    log: Rc<RefCell<Log>>,
    aux_margin: i32,
    keep_animating: bool,
}

impl WindowHandler for Recorder {
    fn draw(&mut self, frame: &mut Frame<'_>) {
        if let DrawTarget::Shm(target) = frame.target() {
            target.fill(0xff33_6699);
        }
        if self.keep_animating {
            frame.request_next_frame();
        }
        self.log
            .borrow_mut()
            .draws
            .push((frame.surface().surface, frame.allocation()));
    }

    fn resize(&mut self, layout: &mut Layout<'_>) {
        let size = layout.size();
        self.log.borrow_mut().resizes.push(size);
        let margin = self.aux_margin;
        for surface in layout.auxiliary() {
            layout.place(
                surface,
                Rect::new(
                    margin,
                    margin,
                    size.width - 2 * margin as u32,
                    size.height - 2 * margin as u32,
                ),
            );
        }
    }
}

struct Fixture {
    transport: HeadlessTransport,
    server: HeadlessHandle,
    config: VellumConfig,
    window: Window,
    log: Rc<RefCell<Log>>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_handler(|log| Recorder {
            log,
            aux_margin: 10,
            keep_animating: false,
        })
    }

    fn with_handler(make: impl FnOnce(Rc<RefCell<Log>>) -> Recorder) -> Self {
        let mut transport = HeadlessTransport::new().unwrap();
        let server = transport.handle();
        server.set_auto_present(false);
        let mut config = VellumConfig::default();
        config.gpu.enabled = false;

        let log = Rc::new(RefCell::new(Log::default()));
        let main = transport.create_surface().unwrap();
        let mut window = Window::new(WindowId(1), main, Box::new(make(log.clone())), &config);
        window.schedule_resize(300, 300);
        Self {
            transport,
            server,
            config,
            window,
            log,
        }
    }

    fn redraw(&mut self) -> Result<RedrawOutcome, ToolkitError> {
        let mut ctx = RedrawContext {
            transport: &mut self.transport,
            gpu: None,
            config: &self.config,
        };
        self.window.redraw(&mut ctx)
    }

    fn add_subsurface(&mut self, mode: SubsurfaceMode) -> (SurfaceId, SubsurfaceId) {
        let surface = self.transport.create_surface().unwrap();
        let sub = self
            .transport
            .create_subsurface(surface, self.window.main_surface())
            .unwrap();
        self.window.surfaces.push(Surface::new(
            surface,
            Some(Subsurface { id: sub, mode }),
            16,
        ));
        (surface, sub)
    }

    /// Completes every outstanding frame callback.
    fn complete_frames(&mut self, time: u32) {
        for surface in &mut self.window.surfaces {
            if let Some(callback) = surface.frame_cb {
                surface.frame_done(callback, time);
            }
        }
    }

    fn teardown(self) {
        let Fixture {
            mut transport,
            window,
            server,
            ..
        } = self;
        window.destroy(&mut transport);
        assert_eq!(server.live_surfaces(), 0);
        assert_eq!(server.live_pools(), 0);
    }
}

#[test]
fn resize_is_applied_before_the_first_draw() {
    let mut fx = Fixture::new();
    fx.window.schedule_resize(320, 240);

    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));

    let main = fx.window.main_surface();
    assert_eq!(fx.window.allocation().size(), Size::new(320, 240));
    assert_eq!(fx.server.attached_size(main), Some(Size::new(320, 240)));
    assert_eq!(fx.window.surfaces[0].server_allocation, Size::new(320, 240));
    assert_eq!(fx.log.borrow().resizes, vec![Size::new(320, 240)]);
    assert!(!fx.window.surfaces[0].dirty);
    assert!(fx.window.surfaces[0].frame_in_flight());
    fx.teardown();
}

#[test]
fn resize_waits_while_a_frame_is_in_flight() {
    let mut fx = Fixture::new();
    fx.redraw().unwrap();

    fx.window.schedule_resize(500, 400);
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Throttled);
    assert_eq!(fx.window.allocation().size(), Size::new(300, 300));
    assert!(fx.window.needs_redraw());

    fx.complete_frames(16);
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));
    assert_eq!(fx.window.allocation().size(), Size::new(500, 400));
    fx.teardown();
}

#[test]
fn at_most_one_frame_callback_per_surface() {
    let mut fx = Fixture::with_handler(|log| Recorder {
        log,
        aux_margin: 0,
        keep_animating: true,
    });

    fx.redraw().unwrap();
    let first = fx.window.surfaces[0].frame_cb;
    assert!(first.is_some());

    // Still dirty from the animation request, but waiting.
    assert!(fx.window.surfaces[0].dirty);
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Throttled);
    assert_eq!(fx.window.surfaces[0].frame_cb, first);
    assert_eq!(fx.server.outstanding_callbacks(), 1);

    fx.complete_frames(16);
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));
    assert_ne!(fx.window.surfaces[0].frame_cb, first);
    assert_eq!(fx.log.borrow().draws.len(), 2);
    fx.teardown();
}

#[test]
fn subsurfaces_are_laid_out_and_restored_to_their_mode() {
    let mut fx = Fixture::new();
    let (aux, sub) = fx.add_subsurface(SubsurfaceMode::Desynchronized);
    fx.window.schedule_resize(300, 300);

    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(2));

    let main = fx.window.main_surface();
    assert_eq!(fx.server.subsurface_position(sub), Some((10, 10)));
    assert_eq!(fx.server.subsurface_sync(sub), Some(false));
    assert_eq!(fx.server.attached_size(aux), Some(Size::new(280, 280)));
    assert_eq!(fx.server.commits(aux), 1);
    assert_eq!(fx.server.commits(main), 1);

    let log = fx.log.borrow();
    assert_eq!(log.draws[0].0, main);
    assert_eq!(log.draws[1], (aux, Rect::new(10, 10, 280, 280)));
    drop(log);
    fx.teardown();
}

#[test]
fn dirty_aux_surface_draws_alone() {
    let mut fx = Fixture::new();
    let (aux, _) = fx.add_subsurface(SubsurfaceMode::Synchronized);
    fx.redraw().unwrap();
    fx.complete_frames(16);

    fx.window.surface_mut(aux).unwrap().dirty = true;
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));
    assert_eq!(fx.server.commits(aux), 2);
    assert_eq!(fx.server.commits(fx.window.main_surface()), 1);
    fx.teardown();
}

#[test]
fn failed_resize_rolls_back_to_the_committed_size() {
    let mut fx = Fixture::new();
    fx.redraw().unwrap();
    fx.complete_frames(16);

    fx.server.inject(Injection::RefusePools(1));
    fx.window.schedule_resize(640, 480);
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Retry);
    assert_eq!(fx.window.allocation().size(), Size::new(300, 300));
    assert!(fx.window.redraw_needed);

    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));
    assert_eq!(
        fx.log.borrow().resizes,
        vec![Size::new(300, 300), Size::new(640, 480), Size::new(300, 300)]
    );
    fx.teardown();
}

#[test]
fn failure_without_any_committed_frame_is_fatal() {
    let mut fx = Fixture::new();
    fx.server.inject(Injection::RefusePools(1));

    assert!(matches!(fx.redraw(), Err(ToolkitError::NoUsableBuffer)));
    fx.teardown();
}

#[test]
fn failed_redraw_keeps_the_surface_dirty() {
    let mut fx = Fixture::new();
    fx.redraw().unwrap();
    fx.complete_frames(16);

    fx.server.inject(Injection::RefusePools(1));
    fx.window.surfaces[0].dirty = true;
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Failed);
    assert!(fx.window.surfaces[0].dirty);
    assert!(!fx.window.surfaces[0].frame_in_flight());

    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));
    fx.teardown();
}

#[test]
fn oversized_resize_rolls_back_instead_of_overflowing() {
    let mut fx = Fixture::new();
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));
    fx.complete_frames(16);

    fx.window.schedule_resize(0x4000_0001, 300);
    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Retry);
    assert_eq!(fx.window.allocation().size(), Size::new(300, 300));
    assert!(!fx.window.frame_in_flight());

    assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));
    let main = fx.window.main_surface();
    assert_eq!(fx.server.attached_size(main), Some(Size::new(300, 300)));
    fx.teardown();
}

/// Prepares successfully but never yields anything to draw into.
struct Blank {
    prepares: Rc<Cell<u32>>,
    prepared: bool,
}

impl BufferListener for Blank {
    fn owns_buffer(&self, _buffer: BufferId) -> bool {
        false
    }

    fn buffer_released(
        &mut self,
        _transport: &mut dyn Transport,
        buffer: BufferId,
    ) -> Result<(), BackendError> {
        Err(BackendError::UnknownBuffer(buffer))
    }
}

impl BufferBackend for Blank {
    fn kind(&self) -> BufferType {
        BufferType::Shm
    }

    fn prepare(
        &mut self,
        _transport: &mut dyn Transport,
        _request: &PrepareRequest,
    ) -> Result<(), BackendError> {
        if self.prepared {
            return Err(BackendError::AlreadyPrepared);
        }
        self.prepared = true;
        self.prepares.set(self.prepares.get() + 1);
        Ok(())
    }

    fn target(&mut self) -> Option<DrawTarget<'_>> {
        None
    }

    fn swap(
        &mut self,
        _transport: &mut dyn Transport,
        _surface: SurfaceId,
    ) -> Result<Size, BackendError> {
        Err(BackendError::NotPrepared)
    }

    fn discard(&mut self) {
        self.prepared = false;
    }

    fn acquire(&mut self, _context: Option<&GpuContext>) -> Result<(), BackendError> {
        Err(BackendError::NoDevice)
    }

    fn release(&mut self) {}

    fn busy_buffers(&self) -> usize {
        0
    }

    fn destroy(&mut self, _transport: &mut dyn Transport) {}
}

#[test]
fn missing_drawable_does_not_wedge_the_backend() {
    let mut fx = Fixture::new();
    let prepares = Rc::new(Cell::new(0));
    fx.window.surfaces[0].backend = Some(Box::new(Blank {
        prepares: prepares.clone(),
        prepared: false,
    }));

    for _ in 0..2 {
        assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(0));
        assert!(fx.window.surfaces[0].dirty);
        assert!(!fx.window.surfaces[0].frame_in_flight());
    }
    assert_eq!(prepares.get(), 2);
    assert_eq!(fx.server.outstanding_callbacks(), 0);
    assert!(fx.log.borrow().draws.is_empty());
    fx.teardown();
}

#[test]
fn exhausted_buffers_are_fatal() {
    let mut fx = Fixture::new();
    fx.server.inject(Injection::HoldBuffers(true));

    for frame in 0..3 {
        assert_eq!(fx.redraw().unwrap(), RedrawOutcome::Drawn(1));
        fx.complete_frames(frame * 16);
        fx.window.surfaces[0].dirty = true;
    }

    assert!(matches!(
        fx.redraw(),
        Err(ToolkitError::Backend(crate::error::BackendError::ExhaustedBuffers { leaves: 3 }))
    ));
    fx.teardown();
}

#[test]
fn buffer_scale_is_pushed_before_the_commit() {
    let mut fx = Fixture::new();
    fx.window.buffer_scale = 2;
    fx.redraw().unwrap();

    let main = fx.window.main_surface();
    assert_eq!(fx.server.buffer_scale(main), Some(2));
    assert_eq!(fx.server.attached_size(main), Some(Size::new(600, 600)));
    assert_eq!(fx.window.surfaces[0].server_allocation, Size::new(300, 300));
    fx.teardown();
}

#[test]
fn gpu_surfaces_report_the_presented_size() {
    let mut fx = Fixture::new();
    fx.config.gpu.enabled = true;
    fx.window.preferred = crate::buffer::BufferType::Gpu;
    let mut gpu = HeadlessGpu::new().with_max_size(Size::new(256, 256));

    let mut ctx = RedrawContext {
        transport: &mut fx.transport,
        gpu: Some(&mut gpu),
        config: &fx.config,
    };
    assert_eq!(fx.window.redraw(&mut ctx).unwrap(), RedrawOutcome::Drawn(1));

    let backend = fx.window.surfaces[0].backend.as_ref().unwrap();
    assert_eq!(backend.kind(), crate::buffer::BufferType::Gpu);
    assert_eq!(fx.window.surfaces[0].server_allocation, Size::new(256, 256));
    assert_eq!(gpu.swaps(), 1);

    let Fixture {
        mut transport,
        window,
        ..
    } = fx;
    window.destroy(&mut transport);
    assert_eq!(gpu.live_surfaces(), 0);
}

#[test]
fn minimum_size_is_enforced() {
    let mut fx = Fixture::new();
    fx.window.schedule_resize(10, 1000);
    fx.redraw().unwrap();

    assert_eq!(
        fx.window.allocation().size(),
        Size::new(fx.config.window.min_width, 1000)
    );
    fx.teardown();
}
