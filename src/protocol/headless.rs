//! In-process headless display server
//!
//! [`HeadlessTransport`] implements [`Transport`] against a simulated server
//! living in the same process. It behaves like a minimal compositor:
//!
//! - pools are mapped read-only from the client's descriptor
//! - buffer creation is bounds-checked against the pool size
//! - committing a new buffer releases the previously attached one
//! - frame callbacks fire on presentation (immediately with auto-present,
//!   or when the test calls [`HeadlessHandle::present`])
//!
//! Events are queued server side and a wake byte is written to a real
//! socket pair, so the event loop polls a genuine descriptor. Failures can
//! be injected through [`HeadlessHandle::inject`].
//!
//! # Usage
//!
//! ```no_run
//! use vellum::protocol::headless::{HeadlessTransport, Injection};
//!
//! let transport = HeadlessTransport::new().unwrap();
//! let server = transport.handle();
//! server.set_auto_present(false);
//! server.inject(Injection::FlushWouldBlock(1));
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use log::{debug, trace, warn};
use memmap2::{Mmap, MmapOptions};

use super::{
    BufferId, BufferTransform, CallbackId, Event, FlushStatus, OutputEvent, OutputId, PixelFormat,
    PoolId, Rect, Size, SubsurfaceId, SurfaceId, Transport,
};
use crate::error::TransportError;

/// Milliseconds between simulated presentations.
const FRAME_INTERVAL_MS: u32 = 16;

/// Failure modes the server can be told to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    /// The next `n` flushes report a full socket.
    FlushWouldBlock(u32),
    /// The next `n` pool creations are refused.
    RefusePools(u32),
    /// Replaced buffers stay busy until released by hand.
    HoldBuffers(bool),
    /// The server closes the connection.
    Disconnect,
}

/// Pixels of the buffer a surface last committed.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Snapshot {
    /// Reads one pixel as a little-endian 32-bit value.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height || self.format.bytes_per_pixel() != 4 {
            return None;
        }
        let at = (y * self.stride + x * 4) as usize;
        let bytes = self.data.get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

struct ServerPool {
    map: Mmap,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
struct ServerBuffer {
    pool: PoolId,
    offset: usize,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
}

#[derive(Default)]
struct ServerSurface {
    pending_buffer: Option<Option<BufferId>>,
    attached: Option<BufferId>,
    pending_frames: Vec<CallbackId>,
    queued_frames: Vec<CallbackId>,
    damage: Vec<Rect>,
    last_damage: Vec<Rect>,
    scale: u32,
    transform: BufferTransform,
    commits: u64,
    snapshot: Option<Snapshot>,
}

struct ServerSubsurface {
    surface: SurfaceId,
    sync: bool,
    position: (i32, i32),
}

struct Server {
    wake: Option<UnixStream>,
    outbox: Vec<Event>,
    next_id: u32,
    auto_present: bool,
    hold_buffers: bool,
    flush_would_block: u32,
    refuse_pools: u32,
    pools: HashMap<PoolId, ServerPool>,
    buffers: HashMap<BufferId, ServerBuffer>,
    busy: HashSet<BufferId>,
    surfaces: BTreeMap<SurfaceId, ServerSurface>,
    subsurfaces: HashMap<SubsurfaceId, ServerSubsurface>,
    callbacks: HashSet<CallbackId>,
    clock_ms: u32,
    total_commits: u64,
    flushes: u64,
    protocol_errors: u64,
}

impl Server {
    fn new(wake: UnixStream) -> Self {
        Self {
            wake: Some(wake),
            outbox: Vec::new(),
            next_id: 1,
            auto_present: true,
            hold_buffers: false,
            flush_would_block: 0,
            refuse_pools: 0,
            pools: HashMap::new(),
            buffers: HashMap::new(),
            busy: HashSet::new(),
            surfaces: BTreeMap::new(),
            subsurfaces: HashMap::new(),
            callbacks: HashSet::new(),
            clock_ms: 0,
            total_commits: 0,
            flushes: 0,
            protocol_errors: 0,
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn send(&mut self, event: Event) {
        trace!("headless server -> {:?}", event);
        self.outbox.push(event);
        if let Some(wake) = self.wake.as_mut() {
            // A full socket is already readable, dropping the byte is harmless.
            let _ = wake.write(&[1]);
        }
    }

    fn violation(&mut self, what: &str) -> TransportError {
        self.protocol_errors += 1;
        warn!("⚠️ Headless server protocol violation: {}", what);
        TransportError::protocol(what)
    }

    fn snapshot_of(&self, buffer: BufferId) -> Option<Snapshot> {
        let desc = self.buffers.get(&buffer)?;
        let pool = self.pools.get(&desc.pool)?;
        let len = desc.stride as usize * desc.height as usize;
        let data = pool.map.get(desc.offset..desc.offset + len)?.to_vec();
        Some(Snapshot {
            width: desc.width,
            height: desc.height,
            stride: desc.stride,
            format: desc.format,
            data,
        })
    }

    fn commit(&mut self, id: SurfaceId) {
        self.total_commits += 1;
        let pending = match self.surfaces.get(&id) {
            Some(surface) => surface.pending_buffer,
            None => {
                self.violation("commit on unknown surface");
                return;
            }
        };
        let snapshot = pending.flatten().and_then(|buffer| self.snapshot_of(buffer));

        let mut replaced = None;
        if let Some(surface) = self.surfaces.get_mut(&id) {
            surface.commits += 1;
            if let Some(next) = surface.pending_buffer.take() {
                let previous = std::mem::replace(&mut surface.attached, next);
                if previous != next {
                    replaced = previous;
                }
                if snapshot.is_some() {
                    surface.snapshot = snapshot;
                }
                if let Some(buffer) = next {
                    self.busy.insert(buffer);
                }
            }
            surface.last_damage = std::mem::take(&mut surface.damage);
            let frames: Vec<CallbackId> = surface.pending_frames.drain(..).collect();
            surface.queued_frames.extend(frames);
        }

        if let Some(previous) = replaced {
            if !self.hold_buffers && self.busy.remove(&previous) {
                self.send(Event::BufferRelease(previous));
            }
        }

        if self.auto_present {
            let time = self.clock_ms;
            self.present_surface(id, time);
            self.clock_ms = self.clock_ms.wrapping_add(FRAME_INTERVAL_MS);
        }
    }

    fn present_surface(&mut self, id: SurfaceId, time: u32) {
        let frames = match self.surfaces.get_mut(&id) {
            Some(surface) => std::mem::take(&mut surface.queued_frames),
            None => return,
        };
        for callback in frames {
            if self.callbacks.remove(&callback) {
                self.send(Event::FrameDone { callback, time });
            }
        }
    }

    fn present_all(&mut self) {
        let time = self.clock_ms;
        let ids: Vec<SurfaceId> = self.surfaces.keys().copied().collect();
        for id in ids {
            self.present_surface(id, time);
        }
        self.clock_ms = self.clock_ms.wrapping_add(FRAME_INTERVAL_MS);
    }
}

/// Client end of the headless connection.
pub struct HeadlessTransport {
    socket: UnixStream,
    inbox: VecDeque<Event>,
    server: Rc<RefCell<Server>>,
}

impl HeadlessTransport {
    pub fn new() -> Result<Self, TransportError> {
        let (client, server) = UnixStream::pair()?;
        client.set_nonblocking(true)?;
        server.set_nonblocking(true)?;
        debug!("🧪 Headless display server created");
        Ok(Self {
            socket: client,
            inbox: VecDeque::new(),
            server: Rc::new(RefCell::new(Server::new(server))),
        })
    }

    /// Control and inspection handle for the simulated server.
    pub fn handle(&self) -> HeadlessHandle {
        HeadlessHandle {
            server: Rc::clone(&self.server),
        }
    }
}

impl Transport for HeadlessTransport {
    fn socket(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    fn read_events(&mut self) -> Result<usize, TransportError> {
        let mut scratch = [0u8; 256];
        let mut closed = false;
        loop {
            match self.socket.read(&mut scratch) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let events = std::mem::take(&mut self.server.borrow_mut().outbox);
        let count = events.len();
        self.inbox.extend(events);
        if closed && count == 0 {
            return Err(TransportError::Hangup);
        }
        Ok(count)
    }

    fn dispatch_pending(&mut self) -> Result<Vec<Event>, TransportError> {
        Ok(self.inbox.drain(..).collect())
    }

    fn flush(&mut self) -> Result<FlushStatus, TransportError> {
        let mut server = self.server.borrow_mut();
        server.flushes += 1;
        if server.wake.is_none() {
            return Err(TransportError::Hangup);
        }
        if server.flush_would_block > 0 {
            server.flush_would_block -= 1;
            return Ok(FlushStatus::WouldBlock);
        }
        Ok(FlushStatus::Done)
    }

    fn create_surface(&mut self) -> Result<SurfaceId, TransportError> {
        let mut server = self.server.borrow_mut();
        let id = SurfaceId(server.next_id());
        server.surfaces.insert(
            id,
            ServerSurface {
                scale: 1,
                ..ServerSurface::default()
            },
        );
        Ok(id)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        let mut server = self.server.borrow_mut();
        match server.surfaces.remove(&surface) {
            Some(state) => {
                for callback in state.pending_frames.iter().chain(&state.queued_frames) {
                    server.callbacks.remove(callback);
                }
            }
            None => {
                server.violation("destroy of unknown surface");
            }
        }
    }

    fn create_subsurface(
        &mut self,
        surface: SurfaceId,
        parent: SurfaceId,
    ) -> Result<SubsurfaceId, TransportError> {
        let mut server = self.server.borrow_mut();
        if !server.surfaces.contains_key(&surface) || !server.surfaces.contains_key(&parent) {
            return Err(server.violation("subsurface for unknown surface"));
        }
        let id = SubsurfaceId(server.next_id());
        server.subsurfaces.insert(
            id,
            ServerSubsurface {
                surface,
                sync: true,
                position: (0, 0),
            },
        );
        Ok(id)
    }

    fn set_subsurface_sync(&mut self, subsurface: SubsurfaceId, sync: bool) {
        let mut server = self.server.borrow_mut();
        match server.subsurfaces.get_mut(&subsurface) {
            Some(sub) => sub.sync = sync,
            None => {
                server.violation("sync mode on unknown subsurface");
            }
        }
    }

    fn set_subsurface_position(&mut self, subsurface: SubsurfaceId, x: i32, y: i32) {
        let mut server = self.server.borrow_mut();
        match server.subsurfaces.get_mut(&subsurface) {
            Some(sub) => sub.position = (x, y),
            None => {
                server.violation("position on unknown subsurface");
            }
        }
    }

    fn destroy_subsurface(&mut self, subsurface: SubsurfaceId) {
        let mut server = self.server.borrow_mut();
        if server.subsurfaces.remove(&subsurface).is_none() {
            server.violation("destroy of unknown subsurface");
        }
    }

    fn create_pool(&mut self, fd: BorrowedFd<'_>, size: usize) -> Result<PoolId, TransportError> {
        let mut server = self.server.borrow_mut();
        if server.refuse_pools > 0 {
            server.refuse_pools -= 1;
            return Err(TransportError::protocol("pool creation refused"));
        }
        if size == 0 {
            return Err(server.violation("zero sized pool"));
        }
        let file = File::from(fd.try_clone_to_owned()?);
        let map = unsafe { MmapOptions::new().len(size).map(&file)? };
        let id = PoolId(server.next_id());
        server.pools.insert(id, ServerPool { map, size });
        Ok(id)
    }

    fn destroy_pool(&mut self, pool: PoolId) {
        let mut server = self.server.borrow_mut();
        if server.pools.remove(&pool).is_none() {
            server.violation("destroy of unknown pool");
        }
    }

    fn create_buffer(
        &mut self,
        pool: PoolId,
        offset: usize,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> Result<BufferId, TransportError> {
        let mut server = self.server.borrow_mut();
        let pool_size = match server.pools.get(&pool) {
            Some(p) => p.size,
            None => return Err(server.violation("buffer from unknown pool")),
        };
        let row = width.checked_mul(format.bytes_per_pixel());
        if width == 0 || height == 0 || row.map_or(true, |row| stride < row) {
            return Err(server.violation("invalid buffer geometry"));
        }
        let end = (stride as usize)
            .checked_mul(height as usize)
            .and_then(|len| len.checked_add(offset));
        if end.map_or(true, |end| end > pool_size) {
            return Err(server.violation("buffer exceeds pool"));
        }
        let id = BufferId(server.next_id());
        server.buffers.insert(
            id,
            ServerBuffer {
                pool,
                offset,
                width,
                height,
                stride,
                format,
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let mut server = self.server.borrow_mut();
        if server.buffers.remove(&buffer).is_none() {
            server.violation("destroy of unknown buffer");
        }
        server.busy.remove(&buffer);
    }

    fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferId>) {
        let mut server = self.server.borrow_mut();
        if let Some(b) = buffer {
            if !server.buffers.contains_key(&b) {
                server.violation("attach of unknown buffer");
                return;
            }
        }
        match server.surfaces.get_mut(&surface) {
            Some(state) => state.pending_buffer = Some(buffer),
            None => {
                server.violation("attach to unknown surface");
            }
        }
    }

    fn damage(&mut self, surface: SurfaceId, region: Rect) {
        let mut server = self.server.borrow_mut();
        if let Some(state) = server.surfaces.get_mut(&surface) {
            state.damage.push(region);
        }
    }

    fn set_buffer_scale(&mut self, surface: SurfaceId, scale: u32) {
        let mut server = self.server.borrow_mut();
        if scale == 0 {
            server.violation("buffer scale of zero");
            return;
        }
        if let Some(state) = server.surfaces.get_mut(&surface) {
            state.scale = scale;
        }
    }

    fn set_buffer_transform(&mut self, surface: SurfaceId, transform: BufferTransform) {
        if let Some(state) = self.server.borrow_mut().surfaces.get_mut(&surface) {
            state.transform = transform;
        }
    }

    fn frame(&mut self, surface: SurfaceId) -> Result<CallbackId, TransportError> {
        let mut server = self.server.borrow_mut();
        if !server.surfaces.contains_key(&surface) {
            return Err(server.violation("frame on unknown surface"));
        }
        let id = CallbackId(server.next_id());
        server.callbacks.insert(id);
        if let Some(state) = server.surfaces.get_mut(&surface) {
            state.pending_frames.push(id);
        }
        Ok(id)
    }

    fn destroy_callback(&mut self, callback: CallbackId) {
        let mut server = self.server.borrow_mut();
        server.callbacks.remove(&callback);
        for state in server.surfaces.values_mut() {
            state.pending_frames.retain(|cb| *cb != callback);
            state.queued_frames.retain(|cb| *cb != callback);
        }
    }

    fn commit(&mut self, surface: SurfaceId) {
        self.server.borrow_mut().commit(surface);
    }
}

/// Test and demo control over the simulated server.
#[derive(Clone)]
pub struct HeadlessHandle {
    server: Rc<RefCell<Server>>,
}

impl HeadlessHandle {
    pub fn inject(&self, injection: Injection) {
        let mut server = self.server.borrow_mut();
        debug!("🧪 Injecting {:?}", injection);
        match injection {
            Injection::FlushWouldBlock(n) => server.flush_would_block = n,
            Injection::RefusePools(n) => server.refuse_pools = n,
            Injection::HoldBuffers(hold) => server.hold_buffers = hold,
            Injection::Disconnect => server.wake = None,
        }
    }

    /// Fire frame callbacks on every commit instead of waiting for [`present`](Self::present).
    pub fn set_auto_present(&self, enabled: bool) {
        self.server.borrow_mut().auto_present = enabled;
    }

    /// Presents every committed surface, firing their frame callbacks.
    pub fn present(&self) {
        self.server.borrow_mut().present_all();
    }

    /// Releases a busy buffer. Returns false if the buffer was not busy.
    pub fn release_buffer(&self, buffer: BufferId) -> bool {
        let mut server = self.server.borrow_mut();
        if server.busy.remove(&buffer) {
            server.send(Event::BufferRelease(buffer));
            true
        } else {
            false
        }
    }

    /// Releases every busy buffer that is not attached to a surface.
    pub fn release_detached(&self) {
        let mut server = self.server.borrow_mut();
        let attached: HashSet<BufferId> =
            server.surfaces.values().filter_map(|s| s.attached).collect();
        let mut detached: Vec<BufferId> = server
            .busy
            .iter()
            .copied()
            .filter(|b| !attached.contains(b))
            .collect();
        detached.sort();
        for buffer in detached {
            server.busy.remove(&buffer);
            server.send(Event::BufferRelease(buffer));
        }
    }

    /// Queues an arbitrary event for the client.
    pub fn send(&self, event: Event) {
        self.server.borrow_mut().send(event);
    }

    pub fn configure(&self, surface: SurfaceId, width: u32, height: u32) {
        self.send(Event::Configure {
            surface,
            width,
            height,
        });
    }

    /// Announces a new output with a single current mode.
    pub fn add_output(&self, width: i32, height: i32, scale: i32) -> OutputId {
        let mut server = self.server.borrow_mut();
        let output = OutputId(server.next_id());
        server.send(Event::Output {
            output,
            event: OutputEvent::Geometry {
                x: 0,
                y: 0,
                physical_width: width / 4,
                physical_height: height / 4,
                make: "vellum".to_string(),
                model: "headless".to_string(),
                transform: BufferTransform::Normal,
            },
        });
        server.send(Event::Output {
            output,
            event: OutputEvent::Mode {
                current: true,
                width,
                height,
                refresh: 60_000,
            },
        });
        server.send(Event::Output {
            output,
            event: OutputEvent::Scale(scale),
        });
        server.send(Event::Output {
            output,
            event: OutputEvent::Done,
        });
        output
    }

    pub fn remove_output(&self, output: OutputId) {
        self.send(Event::OutputRemoved(output));
    }

    pub fn enter(&self, surface: SurfaceId, output: OutputId) {
        self.send(Event::SurfaceEnter { surface, output });
    }

    pub fn leave(&self, surface: SurfaceId, output: OutputId) {
        self.send(Event::SurfaceLeave { surface, output });
    }

    pub fn live_pools(&self) -> usize {
        self.server.borrow().pools.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.server.borrow().buffers.len()
    }

    pub fn live_surfaces(&self) -> usize {
        self.server.borrow().surfaces.len()
    }

    pub fn busy_buffers(&self) -> usize {
        self.server.borrow().busy.len()
    }

    pub fn is_busy(&self, buffer: BufferId) -> bool {
        self.server.borrow().busy.contains(&buffer)
    }

    /// Frame callbacks created and not yet fired or destroyed.
    pub fn outstanding_callbacks(&self) -> usize {
        self.server.borrow().callbacks.len()
    }

    pub fn commits(&self, surface: SurfaceId) -> u64 {
        self.server
            .borrow()
            .surfaces
            .get(&surface)
            .map_or(0, |s| s.commits)
    }

    pub fn total_commits(&self) -> u64 {
        self.server.borrow().total_commits
    }

    pub fn flushes(&self) -> u64 {
        self.server.borrow().flushes
    }

    pub fn protocol_errors(&self) -> u64 {
        self.server.borrow().protocol_errors
    }

    pub fn attached_buffer(&self, surface: SurfaceId) -> Option<BufferId> {
        self.server.borrow().surfaces.get(&surface)?.attached
    }

    pub fn last_damage(&self, surface: SurfaceId) -> Vec<Rect> {
        self.server
            .borrow()
            .surfaces
            .get(&surface)
            .map(|s| s.last_damage.clone())
            .unwrap_or_default()
    }

    pub fn buffer_scale(&self, surface: SurfaceId) -> Option<u32> {
        self.server.borrow().surfaces.get(&surface).map(|s| s.scale)
    }

    pub fn buffer_transform(&self, surface: SurfaceId) -> Option<BufferTransform> {
        self.server.borrow().surfaces.get(&surface).map(|s| s.transform)
    }

    pub fn subsurface_sync(&self, subsurface: SubsurfaceId) -> Option<bool> {
        self.server.borrow().subsurfaces.get(&subsurface).map(|s| s.sync)
    }

    pub fn subsurface_position(&self, subsurface: SubsurfaceId) -> Option<(i32, i32)> {
        self.server
            .borrow()
            .subsurfaces
            .get(&subsurface)
            .map(|s| s.position)
    }

    pub fn subsurface_for(&self, surface: SurfaceId) -> Option<SubsurfaceId> {
        self.server
            .borrow()
            .subsurfaces
            .iter()
            .find(|(_, sub)| sub.surface == surface)
            .map(|(id, _)| *id)
    }

    /// Size of the buffer a surface last committed.
    pub fn attached_size(&self, surface: SurfaceId) -> Option<Size> {
        let server = self.server.borrow();
        let buffer = server.surfaces.get(&surface)?.attached?;
        let desc = server.buffers.get(&buffer)?;
        Some(Size::new(desc.width, desc.height))
    }

    pub fn snapshot(&self, surface: SurfaceId) -> Option<Snapshot> {
        self.server.borrow().surfaces.get(&surface)?.snapshot.clone()
    }
}
