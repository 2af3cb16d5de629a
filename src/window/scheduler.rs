//! The per-window redraw task
//!
//! One run of [`Window::redraw`] applies a pending resize, prepares and draws
//! every dirty surface that has no frame in flight, then swaps the drawn
//! surfaces with the main surface last so its commit carries a consistent
//! frame. Surfaces still waiting on a frame callback are left dirty; the
//! callback re-enqueues the task.

use log::{debug, trace, warn};

use super::{Frame, Surface, SurfaceHandle, Window};
use crate::buffer::{BufferBackend, BufferType, GpuBackend, GpuDevice, PrepareRequest, ShmBackend};
use crate::config::VellumConfig;
use crate::error::{BackendError, ToolkitResult};
use crate::protocol::Transport;

/// Collaborators borrowed from the display for one redraw.
pub(crate) struct RedrawContext<'a> {
    pub(crate) transport: &'a mut dyn Transport,
    pub(crate) gpu: Option<&'a mut (dyn GpuDevice + 'static)>,
    pub(crate) config: &'a VellumConfig,
}

/// What a redraw run achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedrawOutcome {
    /// Nothing was dirty.
    Idle,
    /// Dirty surfaces are waiting for a frame callback.
    Throttled,
    /// This many surfaces were drawn and submitted.
    Drawn(usize),
    /// A resize was rolled back; run the task once more.
    Retry,
    /// The main surface could not be drawn and stays dirty.
    Failed,
}

struct Drawn {
    index: usize,
    next_frame: bool,
}

impl Window {
    pub(crate) fn redraw(&mut self, ctx: &mut RedrawContext<'_>) -> ToolkitResult<RedrawOutcome> {
        let mut resized = false;
        if self.resize_needed {
            if self.frame_in_flight() {
                trace!("Window {:?} resize waits for frame callbacks", self.id);
                return Ok(RedrawOutcome::Throttled);
            }
            self.apply_resize(ctx.transport);
            resized = true;
        }

        if self.redraw_needed {
            self.redraw_needed = false;
            self.schedule_redraw();
        }

        // Auxiliary surfaces the layout left empty have nothing to show.
        for surface in self.surfaces.iter_mut().skip(1) {
            if surface.allocation.size().is_empty() {
                surface.dirty = false;
            }
        }

        let ready: Vec<usize> = self
            .surfaces
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dirty && !s.frame_in_flight())
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            return Ok(if self.surfaces.iter().any(|s| s.dirty) {
                RedrawOutcome::Throttled
            } else {
                RedrawOutcome::Idle
            });
        }

        let mut prepared = Vec::with_capacity(ready.len());
        for index in ready {
            match self.prepare_surface(index, ctx) {
                Ok(()) => prepared.push(index),
                Err(err) if err.is_fatal() => {
                    self.discard(&prepared);
                    return Err(err.into());
                }
                Err(err) if index == 0 => {
                    warn!("Window {:?} main surface not drawn: {}", self.id, err);
                    return self.main_failed(resized, ctx.transport);
                }
                Err(err) => {
                    warn!(
                        "Window {:?} skips surface {:?}: {}",
                        self.id, self.surfaces[index].id, err
                    );
                }
            }
        }

        let drawn = match self.draw_prepared(&prepared, ctx.transport) {
            Ok(drawn) => drawn,
            Err(err) => {
                self.discard(&prepared);
                return Err(err);
            }
        };

        if resized {
            self.set_synchronized(ctx.transport, true);
        }

        let mut main_ok = true;
        let mut submitted = 0;
        let order = drawn
            .iter()
            .filter(|d| d.index != 0)
            .chain(drawn.iter().filter(|d| d.index == 0));
        for entry in order {
            let (scale, transform) = (self.buffer_scale, self.buffer_transform);
            let surface = &mut self.surfaces[entry.index];
            match surface.swap(ctx.transport, scale, transform) {
                Ok(()) => {
                    surface.dirty = entry.next_frame;
                    submitted += 1;
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    warn!("Swap of {:?} failed: {}", surface.id, err);
                    if let Some(backend) = surface.backend.as_mut() {
                        backend.discard();
                    }
                    surface.cancel_frame(ctx.transport);
                    if entry.index == 0 {
                        main_ok = false;
                    }
                }
            }
        }

        if resized {
            self.set_synchronized(ctx.transport, false);
        }

        if !main_ok {
            return self.main_failed(resized, ctx.transport);
        }
        Ok(RedrawOutcome::Drawn(submitted))
    }

    fn main_failed(
        &mut self,
        resized: bool,
        transport: &mut dyn Transport,
    ) -> ToolkitResult<RedrawOutcome> {
        if resized {
            self.undo_resize(transport)?;
            return Ok(RedrawOutcome::Retry);
        }
        Ok(RedrawOutcome::Failed)
    }

    fn discard(&mut self, indices: &[usize]) {
        for &index in indices {
            if let Some(backend) = self.surfaces[index].backend.as_mut() {
                backend.discard();
            }
        }
    }

    fn prepare_surface(
        &mut self,
        index: usize,
        ctx: &mut RedrawContext<'_>,
    ) -> Result<(), BackendError> {
        let request = PrepareRequest {
            size: self.surfaces[index].allocation.size(),
            scale: self.buffer_scale,
            transform: self.buffer_transform,
            format: self.format,
            resizing: self.resizing,
        };
        let preferred = self.preferred;
        let surface = &mut self.surfaces[index];
        if surface.backend.is_none() {
            surface.backend = Some(create_backend(surface, preferred, &request, ctx));
        }
        match surface.backend.as_mut() {
            Some(backend) => backend.prepare(ctx.transport, &request),
            None => Err(BackendError::NotPrepared),
        }
    }

    /// Requests a frame callback for each prepared surface and hands its
    /// drawable to the handler.
    fn draw_prepared(
        &mut self,
        prepared: &[usize],
        transport: &mut dyn Transport,
    ) -> ToolkitResult<Vec<Drawn>> {
        let mut drawn = Vec::with_capacity(prepared.len());
        for &index in prepared {
            let window = self.id;
            let scale = self.buffer_scale;
            let surface = &mut self.surfaces[index];
            let callback = transport.frame(surface.id)?;
            surface.frame_cb = Some(callback);

            let Some(target) = surface.backend.as_mut().and_then(|b| b.target()) else {
                warn!("Surface {:?} prepared without a drawable", surface.id);
                if let Some(backend) = surface.backend.as_mut() {
                    backend.discard();
                }
                surface.cancel_frame(transport);
                continue;
            };
            let mut frame = Frame {
                surface: SurfaceHandle {
                    window,
                    surface: surface.id,
                },
                main: index == 0,
                allocation: surface.allocation,
                scale,
                time: surface.clock.last().unwrap_or(0),
                target,
                next_frame: false,
            };
            self.handler.draw(&mut frame);
            drawn.push(Drawn {
                index,
                next_frame: frame.next_frame,
            });
        }
        Ok(drawn)
    }
}

/// Picks the backend variant for a surface's first frame.
fn create_backend(
    surface: &Surface,
    preferred: BufferType,
    request: &PrepareRequest,
    ctx: &mut RedrawContext<'_>,
) -> Box<dyn BufferBackend> {
    if preferred == BufferType::Gpu && ctx.config.gpu.preferred() {
        if let Some(device) = ctx.gpu.as_deref_mut() {
            let window_surface = request
                .buffer_size()
                .ok()
                .and_then(|size| device.create_window_surface(surface.id, size));
            if let Some(window_surface) = window_surface {
                debug!("🎮 Surface {:?} draws through the GPU", surface.id);
                return Box::new(GpuBackend::new(window_surface));
            }
        }
    }
    debug!("🖼️ Surface {:?} draws through shared memory", surface.id);
    Box::new(ShmBackend::new(&ctx.config.shm))
}
