//! Shared-memory buffer backend
//!
//! Each surface keeps up to [`MAX_LEAVES`] leaves. A leaf pairs a server
//! buffer with the mapped storage behind it and a `busy` flag that is set on
//! submission and cleared by the server's release event. Three leaves cover
//! the realistic depth of server-side buffering: the frame on screen, the
//! frame queued for composition, and the one being drawn.
//!
//! While the window is in a continuous resize every leaf allocates from its
//! own oversized resize pool, so a resize burst does not create a new shared
//! mapping per frame. The resize pool is dropped when the burst ends.

use log::{debug, trace, warn};

use super::pool::Pool;
use super::{BufferBackend, BufferType, DrawTarget, GpuContext, PrepareRequest, ShmTarget};
use crate::config::ShmConfig;
use crate::error::{BackendError, PoolError};
use crate::protocol::{BufferId, BufferListener, PixelFormat, Rect, Size, SurfaceId, Transport};

/// Upper bound on buffers per surface.
pub const MAX_LEAVES: usize = 3;

enum Backing {
    /// A pool sized for this buffer alone.
    Owned(Pool),
    /// A region of the leaf's resize pool.
    ResizePool,
}

struct LeafStorage {
    buffer: BufferId,
    backing: Backing,
    offset: usize,
    len: usize,
    size: Size,
    stride: u32,
    format: PixelFormat,
}

#[derive(Default)]
struct Leaf {
    storage: Option<LeafStorage>,
    resize_pool: Option<Pool>,
    busy: bool,
}

impl Leaf {
    fn holds(&self, size: Size, format: PixelFormat) -> bool {
        self.storage
            .as_ref()
            .is_some_and(|s| s.size == size && s.format == format)
    }

    fn release_storage(&mut self, transport: &mut dyn Transport) {
        if let Some(storage) = self.storage.take() {
            transport.destroy_buffer(storage.buffer);
            if let Backing::Owned(pool) = storage.backing {
                pool.destroy(transport);
            }
        }
    }

    fn release(&mut self, transport: &mut dyn Transport) {
        self.release_storage(transport);
        if let Some(pool) = self.resize_pool.take() {
            pool.destroy(transport);
        }
    }

    fn allocate(
        &mut self,
        transport: &mut dyn Transport,
        size: Size,
        format: PixelFormat,
        resize_pool_size: Option<usize>,
    ) -> Result<LeafStorage, BackendError> {
        let invalid = BackendError::InvalidSize {
            width: size.width,
            height: size.height,
        };
        let stride = format.stride(size.width).ok_or(invalid)?;
        let len = (stride as usize)
            .checked_mul(size.height as usize)
            .ok_or_else(|| PoolError::allocation(usize::MAX, "buffer length overflows"))?;

        if let Some(pool_size) = resize_pool_size {
            if self.resize_pool.is_none() {
                match Pool::create(transport, pool_size) {
                    Ok(pool) => self.resize_pool = Some(pool),
                    Err(e) => warn!("Resize pool unavailable, using a dedicated pool: {}", e),
                }
            }
            if let Some(pool) = self.resize_pool.as_mut() {
                pool.reset();
                match pool.allocate(len) {
                    Ok(offset) => {
                        let buffer = transport.create_buffer(
                            pool.id(),
                            offset,
                            size.width,
                            size.height,
                            stride,
                            format,
                        )?;
                        return Ok(LeafStorage {
                            buffer,
                            backing: Backing::ResizePool,
                            offset,
                            len,
                            size,
                            stride,
                            format,
                        });
                    }
                    Err(PoolError::OutOfSpace { .. }) => {
                        debug!(
                            "Resize pool too small for {}x{}, using a dedicated pool",
                            size.width, size.height
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let mut pool = Pool::create(transport, len)?;
        let offset = match pool.allocate(len) {
            Ok(offset) => offset,
            Err(e) => {
                pool.destroy(transport);
                return Err(e.into());
            }
        };
        let buffer =
            match transport.create_buffer(pool.id(), offset, size.width, size.height, stride, format)
            {
                Ok(buffer) => buffer,
                Err(e) => {
                    pool.destroy(transport);
                    return Err(e.into());
                }
            };
        Ok(LeafStorage {
            buffer,
            backing: Backing::Owned(pool),
            offset,
            len,
            size,
            stride,
            format,
        })
    }
}

/// CPU-mapped backend with a small set of reusable leaves.
pub struct ShmBackend {
    leaves: Vec<Leaf>,
    current: Option<usize>,
    surface_size: Size,
    last_committed: Option<Size>,
    /// The last prepared frame allocated from resize pools.
    resizing: bool,
    use_resize_pool: bool,
    resize_pool_size: usize,
    allocations: u64,
}

impl ShmBackend {
    pub fn new(config: &ShmConfig) -> Self {
        Self {
            leaves: vec![Leaf::default()],
            current: None,
            surface_size: Size::default(),
            last_committed: None,
            resizing: false,
            use_resize_pool: config.use_resize_pool,
            resize_pool_size: config.resize_pool_size,
            allocations: 0,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Leaves currently holding mapped storage.
    pub fn storage_count(&self) -> usize {
        self.leaves.iter().filter(|l| l.storage.is_some()).count()
    }

    pub fn resize_pools(&self) -> usize {
        self.leaves.iter().filter(|l| l.resize_pool.is_some()).count()
    }

    /// Number of times fresh storage was allocated.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn is_prepared(&self) -> bool {
        self.current.is_some()
    }

    fn pick_leaf(&mut self, size: Size, format: PixelFormat) -> Result<usize, BackendError> {
        let free = |leaf: &&Leaf| !leaf.busy;
        let found = self
            .leaves
            .iter()
            .position(|l| free(&l) && l.holds(size, format))
            .or_else(|| {
                self.leaves
                    .iter()
                    .position(|l| free(&l) && l.storage.is_none())
            })
            .or_else(|| self.leaves.iter().position(|l| free(&l)));

        if let Some(index) = found {
            return Ok(index);
        }
        if self.leaves.len() < MAX_LEAVES {
            self.leaves.push(Leaf::default());
            trace!("Grew shm backend to {} leaves", self.leaves.len());
            return Ok(self.leaves.len() - 1);
        }
        Err(BackendError::ExhaustedBuffers {
            leaves: self.leaves.len(),
        })
    }

    /// Keeps one idle leaf with storage and releases the others. Once the
    /// resize has ended, idle leaves also give up their resize pools.
    fn reclaim(&mut self, transport: &mut dyn Transport) {
        if !self.resizing {
            for (index, leaf) in self.leaves.iter_mut().enumerate() {
                if !leaf.busy && self.current != Some(index) && leaf.resize_pool.is_some() {
                    debug!("Dropping idle resize pool of shm leaf {}", index);
                    leaf.release(transport);
                }
            }
        }

        let idle: Vec<usize> = self
            .leaves
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.busy && l.storage.is_some())
            .map(|(i, _)| i)
            .collect();
        if idle.len() <= 1 {
            return;
        }

        let keep = self
            .current
            .filter(|i| idle.contains(i))
            .or_else(|| {
                idle.iter().copied().find(|&i| {
                    self.leaves[i].storage.as_ref().map(|s| s.size) == self.last_committed
                })
            })
            .unwrap_or(idle[0]);

        for index in idle.into_iter().filter(|&i| i != keep) {
            debug!("♻️ Releasing idle shm leaf {}", index);
            self.leaves[index].release(transport);
        }
    }
}

impl BufferListener for ShmBackend {
    fn owns_buffer(&self, buffer: BufferId) -> bool {
        self.leaves
            .iter()
            .any(|l| l.storage.as_ref().is_some_and(|s| s.buffer == buffer))
    }

    fn buffer_released(
        &mut self,
        transport: &mut dyn Transport,
        buffer: BufferId,
    ) -> Result<(), BackendError> {
        let Some(index) = self
            .leaves
            .iter()
            .position(|l| l.storage.as_ref().is_some_and(|s| s.buffer == buffer))
        else {
            warn!("Release for unknown buffer {:?} ignored", buffer);
            return Err(BackendError::UnknownBuffer(buffer));
        };

        self.leaves[index].busy = false;
        self.reclaim(transport);
        Ok(())
    }
}

impl BufferBackend for ShmBackend {
    fn kind(&self) -> BufferType {
        BufferType::Shm
    }

    fn prepare(
        &mut self,
        transport: &mut dyn Transport,
        request: &PrepareRequest,
    ) -> Result<(), BackendError> {
        if self.current.is_some() {
            return Err(BackendError::AlreadyPrepared);
        }
        let size = request.buffer_size()?;
        if size.is_empty() {
            return Err(BackendError::InvalidSize {
                width: size.width,
                height: size.height,
            });
        }

        let index = self.pick_leaf(size, request.format)?;
        let resizing = request.resizing && self.use_resize_pool;
        let resize_pool_size = resizing.then_some(self.resize_pool_size);
        self.resizing = resizing;
        let leaf = &mut self.leaves[index];

        if !resizing && leaf.resize_pool.is_some() {
            leaf.release(transport);
        }

        if !leaf.holds(size, request.format) {
            leaf.release_storage(transport);
            let storage = leaf.allocate(transport, size, request.format, resize_pool_size)?;
            leaf.storage = Some(storage);
            self.allocations += 1;
            debug!(
                "🖼️ Leaf {} allocated {}x{} ({:?})",
                index, size.width, size.height, request.format
            );
        }

        self.current = Some(index);
        self.surface_size = request.size;
        Ok(())
    }

    fn target(&mut self) -> Option<DrawTarget<'_>> {
        let index = self.current?;
        let Leaf {
            storage,
            resize_pool,
            ..
        } = &mut self.leaves[index];
        let storage = storage.as_mut()?;
        let (offset, len, size, stride, format) = (
            storage.offset,
            storage.len,
            storage.size,
            storage.stride,
            storage.format,
        );
        let pool = match &mut storage.backing {
            Backing::Owned(pool) => pool,
            Backing::ResizePool => resize_pool.as_mut()?,
        };
        Some(DrawTarget::Shm(ShmTarget {
            pixels: pool.slice_mut(offset, len)?,
            width: size.width,
            height: size.height,
            stride,
            format,
        }))
    }

    fn swap(
        &mut self,
        transport: &mut dyn Transport,
        surface: SurfaceId,
    ) -> Result<Size, BackendError> {
        let index = self.current.take().ok_or(BackendError::NotPrepared)?;
        let leaf = &mut self.leaves[index];
        let storage = leaf.storage.as_ref().ok_or(BackendError::NotPrepared)?;

        transport.attach(surface, Some(storage.buffer));
        transport.damage(surface, Rect::from_size(self.surface_size));
        transport.commit(surface);
        leaf.busy = true;
        self.last_committed = Some(storage.size);
        trace!("Leaf {} submitted as {:?}", index, storage.buffer);
        Ok(storage.size)
    }

    fn discard(&mut self) {
        self.current = None;
    }

    fn acquire(&mut self, _context: Option<&GpuContext>) -> Result<(), BackendError> {
        Err(BackendError::NoDevice)
    }

    fn release(&mut self) {}

    fn busy_buffers(&self) -> usize {
        self.leaves.iter().filter(|l| l.busy).count()
    }

    fn destroy(&mut self, transport: &mut dyn Transport) {
        for leaf in &mut self.leaves {
            leaf.release(transport);
        }
        self.leaves = vec![Leaf::default()];
        self.current = None;
        self.resizing = false;
    }
}
