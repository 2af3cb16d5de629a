//! Shared-memory pool allocator
//!
//! A [`Pool`] is one anonymous shared file, mapped read/write in this
//! process and handed to the server as a pool object. Buffers are carved out
//! of it with a bump allocator; [`Pool::reset`] rewinds the allocator so a
//! pool can be reused across a resize burst without a new shared mapping.
//!
//! Resetting or destroying a pool is only sound once the server has released
//! every buffer created from it. The shm backend enforces that by giving each
//! pool to exactly one leaf.

use std::fs::File;
use std::os::fd::AsFd;

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::error::PoolError;
use crate::protocol::{PoolId, Transport};

/// Bump allocator over a shared mapping.
pub struct Pool {
    id: PoolId,
    map: MmapMut,
    capacity: usize,
    used: usize,
    destroyed: bool,
}

impl Pool {
    /// Creates a pool of `size` bytes and shares it with the server.
    pub fn create(transport: &mut dyn Transport, size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::allocation(size, "empty pool"));
        }

        let file = create_anonymous_file(size).map_err(|e| PoolError::allocation(size, e))?;
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| PoolError::allocation(size, format!("mmap failed: {}", e)))?;
        let id = transport
            .create_pool(file.as_fd(), size)
            .map_err(|e| PoolError::allocation(size, e))?;

        debug!("🧱 Created shm pool {:?} ({} bytes)", id, size);
        Ok(Self {
            id,
            map,
            capacity: size,
            used: 0,
            destroyed: false,
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// Reserves `size` bytes and returns their offset.
    pub fn allocate(&mut self, size: usize) -> Result<usize, PoolError> {
        let Some(end) = self.used.checked_add(size).filter(|&end| end <= self.capacity) else {
            return Err(PoolError::OutOfSpace {
                requested: size,
                available: self.available(),
            });
        };
        let offset = self.used;
        self.used = end;
        Ok(offset)
    }

    /// Starts allocating from the beginning again. The mapping is kept.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Mutable view of `len` bytes at `offset`.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        self.map.get_mut(offset..offset.checked_add(len)?)
    }

    /// Unmaps the storage and destroys the server-side pool object.
    pub fn destroy(mut self, transport: &mut dyn Transport) {
        transport.destroy_pool(self.id);
        self.destroyed = true;
        debug!("🗑️ Destroyed shm pool {:?}", self.id);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!(
                "Pool {:?} dropped without destroy, server object leaked",
                self.id
            );
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn create_anonymous_file(size: usize) -> std::io::Result<File> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let name = CString::new("vellum-shm").map_err(std::io::Error::other)?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(size as u64)?;
    Ok(file)
}

#[cfg(not(target_os = "linux"))]
fn create_anonymous_file(size: usize) -> std::io::Result<File> {
    use std::fs::OpenOptions;

    let dir = std::env::var_os("XDG_RUNTIME_DIR").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "XDG_RUNTIME_DIR is not set")
    })?;
    let path = std::path::Path::new(&dir).join(format!("vellum-shared-{}", std::process::id()));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)?;
    std::fs::remove_file(&path)?;
    file.set_len(size as u64)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::headless::{HeadlessTransport, Injection};

    #[test]
    fn bump_allocation_and_reset() {
        let mut transport = HeadlessTransport::new().unwrap();
        let mut pool = Pool::create(&mut transport, 4096).unwrap();

        assert_eq!(pool.allocate(3000).unwrap(), 0);
        assert!(matches!(
            pool.allocate(2000),
            Err(PoolError::OutOfSpace {
                requested: 2000,
                available: 1096
            })
        ));

        pool.reset();
        assert_eq!(pool.allocate(2000).unwrap(), 0);
        assert_eq!(pool.allocate(2000).unwrap(), 2000);
        assert_eq!(pool.available(), 96);

        pool.destroy(&mut transport);
        assert_eq!(transport.handle().live_pools(), 0);
    }

    #[test]
    fn huge_requests_are_out_of_space() {
        let mut transport = HeadlessTransport::new().unwrap();
        let mut pool = Pool::create(&mut transport, 4096).unwrap();
        pool.allocate(100).unwrap();

        assert!(matches!(
            pool.allocate(usize::MAX),
            Err(PoolError::OutOfSpace {
                requested: usize::MAX,
                available: 3996
            })
        ));
        assert_eq!(pool.used(), 100);
        pool.destroy(&mut transport);
    }

    #[test]
    fn writes_are_visible_through_the_mapping() {
        let mut transport = HeadlessTransport::new().unwrap();
        let mut pool = Pool::create(&mut transport, 64).unwrap();
        let offset = pool.allocate(16).unwrap();
        pool.slice_mut(offset, 16).unwrap().fill(0xab);

        assert!(pool.slice_mut(60, 16).is_none());
        assert_eq!(pool.slice_mut(0, 4).unwrap(), &[0xab; 4]);
        pool.destroy(&mut transport);
    }

    #[test]
    fn refused_pool_reports_allocation_failure() {
        let mut transport = HeadlessTransport::new().unwrap();
        transport.handle().inject(Injection::RefusePools(1));
        assert!(matches!(
            Pool::create(&mut transport, 4096),
            Err(PoolError::AllocationFailed { size: 4096, .. })
        ));
        assert_eq!(transport.handle().live_pools(), 0);
    }
}
