//! The process-wide display context
//!
//! [`Display`] owns the transport, the event loop registration state, the
//! deferred queue, every window and the known outputs. All toolkit
//! operations take it by `&mut`, and every task the loop runs receives it
//! the same way, so no state is shared behind locks.
//!
//! Events read from the transport are routed here: buffer releases to the
//! backend that owns the buffer, frame callbacks to the surface that
//! requested them, output and configure events to the windows they concern.
//! Events for objects that no longer exist find no owner and are dropped.

use std::collections::BTreeMap;

use log::{debug, error, info, trace, warn};

use crate::buffer::{BufferType, GpuContext, GpuDevice};
use crate::config::VellumConfig;
use crate::error::{BackendError, ToolkitError, ToolkitResult, TransportError};
use crate::event_loop::{DeferredQueue, Reactor, TaskId};
use crate::output::Output;
use crate::protocol::{
    BufferId, BufferTransform, CallbackId, Event, OutputEvent, OutputId, OutputListener, Rect,
    Size, SurfaceId, Transport,
};
use crate::protocol::{BufferListener, CallbackListener};
use crate::window::{
    FrameStats, RedrawContext, RedrawOutcome, Subsurface, SubsurfaceMode, Surface,
    SurfaceHandle, Window, WindowHandler, WindowId,
};

/// Toolkit connection to a display server.
pub struct Display {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) gpu: Option<Box<dyn GpuDevice>>,
    pub(crate) config: VellumConfig,
    pub(crate) windows: BTreeMap<WindowId, Window>,
    pub(crate) outputs: Vec<Output>,
    pub(crate) deferred: DeferredQueue,
    pub(crate) reactor: Reactor,
    pub(crate) running: bool,
    pub(crate) fatal: Option<ToolkitError>,
    pub(crate) next_task: u64,
    next_window: u64,
}

impl Display {
    /// Wraps a connected transport and registers its socket with a new
    /// event loop.
    pub fn connect(transport: Box<dyn Transport>, config: VellumConfig) -> ToolkitResult<Self> {
        let reactor = Reactor::new(transport.socket())?;
        info!(
            "🔌 Display connected (gpu {}, format {:?})",
            if config.gpu.preferred() { "preferred" } else { "off" },
            config.shm.format
        );
        Ok(Self {
            transport,
            gpu: None,
            config,
            windows: BTreeMap::new(),
            outputs: Vec::new(),
            deferred: DeferredQueue::new(),
            reactor,
            running: false,
            fatal: None,
            next_task: 0,
            next_window: 0,
        })
    }

    /// Installs the GPU device used for windows preferring GPU buffers.
    pub fn with_gpu(mut self, device: Box<dyn GpuDevice>) -> Self {
        self.gpu = Some(device);
        self
    }

    pub fn config(&self) -> &VellumConfig {
        &self.config
    }

    /// Creates a window of the given size and queues its first redraw. A
    /// zero dimension takes the configured default.
    pub fn create_window<H>(&mut self, width: u32, height: u32, handler: H) -> ToolkitResult<WindowId>
    where
        H: WindowHandler + 'static,
    {
        let width = if width == 0 { self.config.window.default_width } else { width };
        let height = if height == 0 { self.config.window.default_height } else { height };

        let surface = self.transport.create_surface()?;
        self.next_window += 1;
        let id = WindowId(self.next_window);
        let mut window = Window::new(id, surface, Box::new(handler), &self.config);
        window.schedule_resize(width, height);
        self.windows.insert(id, window);
        info!("🪟 Window {:?} created on {:?}", id, surface);

        self.queue_redraw(id);
        Ok(id)
    }

    /// Destroys a window and everything it owns. Its pending redraw is
    /// cancelled and its timers are unwatched.
    pub fn destroy_window(&mut self, id: WindowId) -> ToolkitResult<()> {
        let window = self
            .windows
            .remove(&id)
            .ok_or(ToolkitError::UnknownWindow(id))?;
        self.deferred.cancel(TaskId::Redraw(id));
        for &fd in &window.timers {
            self.unwatch_descriptor(fd);
        }
        window.destroy(self.transport.as_mut());
        Ok(())
    }

    /// Adds an auxiliary sub-surface to a window and re-runs its layout.
    pub fn add_subsurface(
        &mut self,
        id: WindowId,
        mode: SubsurfaceMode,
    ) -> ToolkitResult<SurfaceHandle> {
        let window = self
            .windows
            .get_mut(&id)
            .ok_or(ToolkitError::UnknownWindow(id))?;
        let surface = self.transport.create_surface()?;
        let subsurface = self
            .transport
            .create_subsurface(surface, window.main_surface())?;
        self.transport
            .set_subsurface_sync(subsurface, mode == SubsurfaceMode::Synchronized);

        window.surfaces.push(Surface::new(
            surface,
            Some(Subsurface {
                id: subsurface,
                mode,
            }),
            self.config.general.frame_history,
        ));
        let size = window.pending_allocation;
        window.schedule_resize(size.width, size.height);
        debug!("Window {:?} gained sub-surface {:?}", id, surface);

        self.queue_redraw(id);
        Ok(SurfaceHandle {
            window: id,
            surface,
        })
    }

    pub fn remove_subsurface(&mut self, handle: SurfaceHandle) -> ToolkitResult<()> {
        let window = self
            .windows
            .get_mut(&handle.window)
            .ok_or(ToolkitError::UnknownWindow(handle.window))?;
        if !window.remove_surface(self.transport.as_mut(), handle.surface) {
            return Err(ToolkitError::UnknownSurface);
        }
        window.schedule_redraw();
        self.queue_redraw(handle.window);
        Ok(())
    }

    /// Marks one surface for redraw.
    pub fn mark_dirty(&mut self, handle: SurfaceHandle) -> ToolkitResult<()> {
        let surface = self
            .windows
            .get_mut(&handle.window)
            .ok_or(ToolkitError::UnknownWindow(handle.window))?
            .surface_mut(handle.surface)
            .ok_or(ToolkitError::UnknownSurface)?;
        surface.dirty = true;
        self.queue_redraw(handle.window);
        Ok(())
    }

    /// Marks every surface of a window for redraw.
    pub fn schedule_redraw(&mut self, id: WindowId) -> ToolkitResult<()> {
        self.window_mut(id)?.schedule_redraw();
        self.queue_redraw(id);
        Ok(())
    }

    /// Requests a new window size, clamped to the configured minimum.
    pub fn schedule_resize(&mut self, id: WindowId, width: u32, height: u32) -> ToolkitResult<()> {
        self.window_mut(id)?.schedule_resize(width, height);
        self.queue_redraw(id);
        Ok(())
    }

    /// Hints that the window is in a continuous interactive resize.
    pub fn set_resizing(&mut self, id: WindowId, resizing: bool) -> ToolkitResult<()> {
        let window = self.window_mut(id)?;
        if window.resizing == resizing {
            return Ok(());
        }
        window.resizing = resizing;
        if !resizing {
            // Lets the backends drop their resize pools.
            window.schedule_redraw();
            self.queue_redraw(id);
        }
        Ok(())
    }

    pub fn set_buffer_scale(&mut self, id: WindowId, scale: u32) -> ToolkitResult<()> {
        let window = self.window_mut(id)?;
        let scale = scale.max(1);
        if window.buffer_scale == scale {
            return Ok(());
        }
        debug!("Window {:?} buffer scale {} -> {}", id, window.buffer_scale, scale);
        window.buffer_scale = scale;
        let size = window.pending_allocation;
        window.schedule_resize(size.width, size.height);
        self.queue_redraw(id);
        Ok(())
    }

    pub fn set_buffer_transform(
        &mut self,
        id: WindowId,
        transform: BufferTransform,
    ) -> ToolkitResult<()> {
        let window = self.window_mut(id)?;
        if window.buffer_transform == transform {
            return Ok(());
        }
        window.buffer_transform = transform;
        let size = window.pending_allocation;
        window.schedule_resize(size.width, size.height);
        self.queue_redraw(id);
        Ok(())
    }

    /// Chooses the backend kind for surfaces whose first frame has not been
    /// drawn yet.
    pub fn set_preferred_buffer_type(
        &mut self,
        id: WindowId,
        buffer_type: BufferType,
    ) -> ToolkitResult<()> {
        self.window_mut(id)?.preferred = buffer_type;
        Ok(())
    }

    /// Binds the main surface's GPU context for direct drawing. `None` uses
    /// the device default context.
    pub fn acquire_window_context(
        &mut self,
        id: WindowId,
        context: Option<&GpuContext>,
    ) -> ToolkitResult<()> {
        let window = self.window_mut(id)?;
        let backend = window.surfaces[0]
            .backend
            .as_mut()
            .ok_or(BackendError::NoDevice)?;
        backend.acquire(context)?;
        Ok(())
    }

    pub fn release_window_context(&mut self, id: WindowId) -> ToolkitResult<()> {
        if let Some(backend) = self.window_mut(id)?.surfaces[0].backend.as_mut() {
            backend.release();
        }
        Ok(())
    }

    pub fn window_ids(&self) -> Vec<WindowId> {
        self.windows.keys().copied().collect()
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Main surface first, then sub-surfaces in creation order.
    pub fn surfaces(&self, id: WindowId) -> Vec<SurfaceHandle> {
        self.windows
            .get(&id)
            .map(|w| {
                w.surfaces
                    .iter()
                    .map(|s| SurfaceHandle {
                        window: id,
                        surface: s.id,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn main_surface(&self, id: WindowId) -> Option<SurfaceHandle> {
        self.windows.get(&id).map(|w| SurfaceHandle {
            window: id,
            surface: w.main_surface(),
        })
    }

    /// Current allocation of a surface.
    pub fn allocation(&self, handle: SurfaceHandle) -> Option<Rect> {
        self.surface(handle).map(|s| s.allocation)
    }

    /// Size of the last buffer the server received for a surface.
    pub fn committed_size(&self, handle: SurfaceHandle) -> Option<Size> {
        self.surface(handle).map(|s| s.server_allocation)
    }

    pub fn is_dirty(&self, handle: SurfaceHandle) -> Option<bool> {
        self.surface(handle).map(|s| s.dirty)
    }

    pub fn frame_in_flight(&self, handle: SurfaceHandle) -> Option<bool> {
        self.surface(handle).map(Surface::frame_in_flight)
    }

    pub fn frame_stats(&self, handle: SurfaceHandle) -> Option<FrameStats> {
        self.surface(handle).map(|s| s.clock.stats())
    }

    /// Backend kind of a surface, once its first frame has been prepared.
    pub fn backend_kind(&self, handle: SurfaceHandle) -> Option<BufferType> {
        self.surface(handle)?.backend.as_ref().map(|b| b.kind())
    }

    pub fn busy_buffers(&self, handle: SurfaceHandle) -> usize {
        self.surface(handle)
            .and_then(|s| s.backend.as_ref())
            .map_or(0, |b| b.busy_buffers())
    }

    pub fn buffer_scale(&self, id: WindowId) -> Option<u32> {
        self.windows.get(&id).map(|w| w.buffer_scale)
    }

    /// Outputs the window's surfaces are shown on.
    pub fn window_outputs(&self, id: WindowId) -> Vec<OutputId> {
        self.windows
            .get(&id)
            .map(|w| w.outputs.clone())
            .unwrap_or_default()
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn watched_descriptors(&self) -> usize {
        self.reactor.watch_count()
    }

    /// Tears the connection down. Windows still alive at this point are a
    /// caller bug and reported as [`ToolkitError::LeakedWindows`].
    pub fn shutdown(mut self) -> ToolkitResult<()> {
        if !self.deferred.is_empty() {
            warn!("{} deferred task(s) dropped at shutdown", self.deferred.len());
        }
        if !self.windows.is_empty() {
            let count = self.windows.len();
            error!("{} window(s) leaked at shutdown", count);
            return Err(ToolkitError::LeakedWindows { count });
        }
        if let Err(e) = self.transport.flush() {
            warn!("Final flush failed: {}", e);
        }
        info!("👋 Display shut down");
        Ok(())
    }

    fn window_mut(&mut self, id: WindowId) -> ToolkitResult<&mut Window> {
        self.windows
            .get_mut(&id)
            .ok_or(ToolkitError::UnknownWindow(id))
    }

    fn surface(&self, handle: SurfaceHandle) -> Option<&Surface> {
        self.windows.get(&handle.window)?.surface(handle.surface)
    }

    /// Queues the window's redraw task unless it is already queued.
    pub(crate) fn queue_redraw(&mut self, id: WindowId) {
        let queued = self
            .deferred
            .push(TaskId::Redraw(id), Box::new(move |display| display.redraw(id)));
        if queued {
            trace!("Redraw of {:?} queued", id);
        }
    }

    fn redraw(&mut self, id: WindowId) {
        let Some(window) = self.windows.get_mut(&id) else {
            return;
        };
        let mut ctx = RedrawContext {
            transport: self.transport.as_mut(),
            gpu: self.gpu.as_deref_mut(),
            config: &self.config,
        };
        match window.redraw(&mut ctx) {
            Ok(RedrawOutcome::Drawn(count)) => trace!("Window {:?} drew {} surface(s)", id, count),
            Ok(RedrawOutcome::Retry) => self.queue_redraw(id),
            Ok(RedrawOutcome::Failed) => warn!("Window {:?} redraw failed, surface stays dirty", id),
            Ok(RedrawOutcome::Idle | RedrawOutcome::Throttled) => {}
            Err(e) => self.fail(e),
        }
    }

    /// Routes every event the transport has already read.
    pub(crate) fn dispatch_pending(&mut self) -> Result<(), TransportError> {
        for event in self.transport.dispatch_pending()? {
            self.route(event);
        }
        Ok(())
    }

    fn route(&mut self, event: Event) {
        match event {
            Event::BufferRelease(buffer) => self.buffer_released(buffer),
            Event::FrameDone { callback, time } => self.frame_done(callback, time),
            Event::Output { output, event } => self.output_event(output, event),
            Event::OutputRemoved(output) => self.output_removed(output),
            Event::SurfaceEnter { surface, output } => self.surface_output(surface, output, true),
            Event::SurfaceLeave { surface, output } => self.surface_output(surface, output, false),
            Event::Configure {
                surface,
                width,
                height,
            } => self.configure(surface, width, height),
        }
    }

    fn buffer_released(&mut self, buffer: BufferId) {
        let transport = self.transport.as_mut();
        let owner = self
            .windows
            .values_mut()
            .flat_map(|w| w.surfaces.iter_mut())
            .filter_map(|s| s.backend.as_mut())
            .find(|b| b.owns_buffer(buffer));
        match owner {
            Some(backend) => {
                if let Err(e) = backend.buffer_released(transport, buffer) {
                    warn!("Buffer release {:?}: {}", buffer, e);
                }
            }
            None => debug!("Release of {:?} has no owner, ignored", buffer),
        }
    }

    fn frame_done(&mut self, callback: CallbackId, time: u32) {
        let owner = self.windows.values_mut().find_map(|w| {
            let surface = w.surfaces.iter_mut().find(|s| s.owns_callback(callback))?;
            surface.frame_done(callback, time);
            Some((w.id, w.needs_redraw()))
        });
        match owner {
            Some((id, true)) => self.queue_redraw(id),
            Some((_, false)) => {}
            None => debug!("Frame callback {:?} has no owner, ignored", callback),
        }
    }

    fn output_event(&mut self, id: OutputId, event: OutputEvent) {
        let index = match self.outputs.iter().position(|o| o.id() == id) {
            Some(index) => index,
            None => {
                self.outputs.push(Output::new(id));
                self.outputs.len() - 1
            }
        };
        let output = &mut self.outputs[index];
        match event {
            OutputEvent::Geometry {
                x,
                y,
                make,
                model,
                transform,
                ..
            } => output.geometry(x, y, &make, &model, transform),
            OutputEvent::Mode {
                current,
                width,
                height,
                refresh,
            } => output.mode(current, width, height, refresh),
            OutputEvent::Scale(factor) => output.scale(factor),
            OutputEvent::Done => {
                output.done();
                let affected: Vec<WindowId> = self
                    .windows
                    .values()
                    .filter(|w| w.outputs.contains(&id))
                    .map(|w| w.id)
                    .collect();
                for window in affected {
                    self.update_scale(window);
                }
            }
        }
    }

    fn output_removed(&mut self, id: OutputId) {
        self.outputs.retain(|o| o.id() != id);
        let affected: Vec<WindowId> = self
            .windows
            .values_mut()
            .filter_map(|w| {
                let before = w.outputs.len();
                w.outputs.retain(|o| *o != id);
                (w.outputs.len() != before).then(|| {
                    w.handler.output_changed(id, false);
                    w.id
                })
            })
            .collect();
        for window in affected {
            self.update_scale(window);
        }
        debug!("Output {:?} removed", id);
    }

    fn surface_output(&mut self, surface: SurfaceId, output: OutputId, entered: bool) {
        let Some(window) = self
            .windows
            .values_mut()
            .find(|w| w.surface(surface).is_some())
        else {
            return;
        };
        let known = window.outputs.contains(&output);
        if entered && !known {
            window.outputs.push(output);
        } else if !entered && known {
            window.outputs.retain(|o| *o != output);
        } else {
            return;
        }
        window.handler.output_changed(output, entered);
        let id = window.id;
        self.update_scale(id);
    }

    /// Matches the buffer scale to the largest scale among the window's
    /// outputs.
    fn update_scale(&mut self, id: WindowId) {
        if !self.config.window.follow_output_scale {
            return;
        }
        let Some(window) = self.windows.get(&id) else {
            return;
        };
        let scale = self
            .outputs
            .iter()
            .filter(|o| window.outputs.contains(&o.id()))
            .map(Output::scale_factor)
            .max();
        if let Some(scale) = scale {
            if let Err(e) = self.set_buffer_scale(id, scale) {
                warn!("Scale update for {:?} failed: {}", id, e);
            }
        }
    }

    fn configure(&mut self, surface: SurfaceId, width: u32, height: u32) {
        let Some(id) = self
            .windows
            .values()
            .find(|w| w.main_surface() == surface)
            .map(|w| w.id)
        else {
            return;
        };
        if width == 0 || height == 0 {
            // The client picks the size.
            return;
        }
        if let Err(e) = self.schedule_resize(id, width, height) {
            warn!("Configure for {:?} failed: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DrawTarget;
    use crate::protocol::headless::{HeadlessHandle, HeadlessTransport};
    use crate::window::Frame;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counter(Rc<Cell<u32>>);

    impl WindowHandler for Counter {
        fn draw(&mut self, frame: &mut Frame<'_>) {
            if let DrawTarget::Shm(target) = frame.target() {
                target.fill(0xff00_00ff);
            }
            self.0.set(self.0.get() + 1);
        }
    }

    fn display() -> (Display, HeadlessHandle) {
        let transport = HeadlessTransport::new().unwrap();
        let server = transport.handle();
        let mut config = VellumConfig::default();
        config.gpu.enabled = false;
        (Display::connect(Box::new(transport), config).unwrap(), server)
    }

    #[test]
    fn mark_dirty_coalesces_into_one_redraw() {
        let (mut display, server) = display();
        server.set_auto_present(false);
        let draws = Rc::new(Cell::new(0));
        let id = display.create_window(300, 300, Counter(draws.clone())).unwrap();
        let main = display.main_surface(id).unwrap();

        for _ in 0..5 {
            display.mark_dirty(main).unwrap();
        }
        assert_eq!(display.pending_tasks(), 1);
        display.dispatch_once().unwrap();
        assert_eq!(draws.get(), 1);

        display.destroy_window(id).unwrap();
        display.shutdown().unwrap();
    }

    #[test]
    fn redraw_waits_for_the_frame_callback() {
        let (mut display, server) = display();
        server.set_auto_present(false);
        let draws = Rc::new(Cell::new(0));
        let id = display.create_window(300, 300, Counter(draws.clone())).unwrap();
        let main = display.main_surface(id).unwrap();
        display.dispatch_once().unwrap();
        assert_eq!(display.frame_in_flight(main), Some(true));

        display.mark_dirty(main).unwrap();
        display.dispatch_once().unwrap();
        assert_eq!(draws.get(), 1);
        assert_eq!(display.is_dirty(main), Some(true));

        server.present();
        display.dispatch_once().unwrap();
        assert_eq!(draws.get(), 2);
        assert_eq!(display.frame_stats(main).unwrap().presented, 1);

        display.destroy_window(id).unwrap();
        display.shutdown().unwrap();
    }

    #[test]
    fn configure_schedules_a_clamped_resize() {
        let (mut display, server) = display();
        let id = display.create_window(300, 300, Counter(Rc::default())).unwrap();
        let main = display.main_surface(id).unwrap();
        display.dispatch_once().unwrap();

        server.configure(main.surface, 50, 640);
        display.dispatch_once().unwrap();
        display.dispatch_once().unwrap();

        let min = display.config().window.min_width;
        assert_eq!(display.allocation(main).unwrap().size(), Size::new(min, 640));

        display.destroy_window(id).unwrap();
        display.shutdown().unwrap();
    }

    #[test]
    fn leaked_window_is_reported() {
        let (mut display, _server) = display();
        display.create_window(0, 0, Counter(Rc::default())).unwrap();

        assert!(matches!(
            display.shutdown(),
            Err(ToolkitError::LeakedWindows { count: 1 })
        ));
    }

    #[test]
    fn unknown_window_operations_fail() {
        let (mut display, _server) = display();
        let ghost = WindowId(42);

        assert!(matches!(
            display.schedule_redraw(ghost),
            Err(ToolkitError::UnknownWindow(_))
        ));
        assert!(matches!(
            display.destroy_window(ghost),
            Err(ToolkitError::UnknownWindow(_))
        ));
        display.shutdown().unwrap();
    }
}
