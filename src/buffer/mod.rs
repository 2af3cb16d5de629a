//! Buffer backends
//!
//! A surface draws through exactly one [`BufferBackend`], chosen when its
//! first frame is drawn:
//!
//! - [`shm::ShmBackend`]: up to [`shm::MAX_LEAVES`] CPU-mapped shared
//!   memory buffers, allocated from [`pool::Pool`]s
//! - [`gpu::GpuBackend`]: a GPU window surface presented by a
//!   [`gpu::GpuDevice`]
//!
//! Both follow the same cycle: `prepare` a drawable of a given size, let the
//! caller draw into [`BufferBackend::target`], then `swap` it to the server.
//! A prepared drawable must be swapped or discarded before the next
//! `prepare`.

pub mod gpu;
pub mod pool;
pub mod shm;

use crate::error::BackendError;
use crate::protocol::{
    surface_to_buffer_size, BufferListener, BufferTransform, PixelFormat, Size, SurfaceId,
    Transport,
};

pub use gpu::{GpuBackend, GpuContext, GpuDevice, GpuWindowSurface};
pub use pool::Pool;
pub use shm::{ShmBackend, MAX_LEAVES};

/// Which backend a window would like its surfaces to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    Shm,
    Gpu,
}

/// Everything a backend needs to produce a drawable for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareRequest {
    /// Size in surface coordinates.
    pub size: Size,
    pub scale: u32,
    pub transform: BufferTransform,
    pub format: PixelFormat,
    /// The window is in a continuous resize.
    pub resizing: bool,
}

impl PrepareRequest {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            scale: 1,
            transform: BufferTransform::Normal,
            format: PixelFormat::Argb8888,
            resizing: false,
        }
    }

    /// Size of the buffer backing the surface. Sizes that overflow once
    /// scaled are rejected as invalid.
    pub fn buffer_size(&self) -> Result<Size, BackendError> {
        surface_to_buffer_size(self.size, self.transform, self.scale).ok_or(
            BackendError::InvalidSize {
                width: self.size.width,
                height: self.size.height,
            },
        )
    }
}

/// CPU-visible pixels of a prepared shm buffer.
pub struct ShmTarget<'a> {
    pub pixels: &'a mut [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl ShmTarget<'_> {
    /// Fills the whole buffer with one 32-bit pixel value.
    pub fn fill(&mut self, pixel: u32) {
        let bytes = pixel.to_le_bytes();
        let bpp = self.format.bytes_per_pixel() as usize;
        let row_len = self.width as usize * bpp;
        for row in self.pixels.chunks_exact_mut(self.stride as usize) {
            for px in row[..row_len].chunks_exact_mut(bpp) {
                px.copy_from_slice(&bytes[..bpp]);
            }
        }
    }
}

/// What the caller draws into.
pub enum DrawTarget<'a> {
    Shm(ShmTarget<'a>),
    /// GPU drawables are reached through the bound context.
    Gpu { size: Size },
}

impl DrawTarget<'_> {
    pub fn size(&self) -> Size {
        match self {
            DrawTarget::Shm(target) => Size::new(target.width, target.height),
            DrawTarget::Gpu { size } => *size,
        }
    }
}

/// Buffer submission backend of a single surface.
pub trait BufferBackend: BufferListener {
    fn kind(&self) -> BufferType;

    /// Readies a drawable for the requested size.
    fn prepare(
        &mut self,
        transport: &mut dyn Transport,
        request: &PrepareRequest,
    ) -> Result<(), BackendError>;

    /// The prepared drawable, if any.
    fn target(&mut self) -> Option<DrawTarget<'_>>;

    /// Submits the prepared drawable. Returns the committed buffer size.
    fn swap(
        &mut self,
        transport: &mut dyn Transport,
        surface: SurfaceId,
    ) -> Result<Size, BackendError>;

    /// Drops the prepared drawable without submitting it.
    fn discard(&mut self);

    /// Binds the rendering context for direct GPU drawing.
    fn acquire(&mut self, context: Option<&GpuContext>) -> Result<(), BackendError>;

    fn release(&mut self);

    /// Buffers currently held by the server.
    fn busy_buffers(&self) -> usize;

    /// Releases every buffer, pool and GPU resource.
    fn destroy(&mut self, transport: &mut dyn Transport);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_respects_stride_padding() {
        let mut bytes = vec![0u8; 8 * 2];
        let mut target = ShmTarget {
            pixels: &mut bytes,
            width: 3,
            height: 2,
            stride: 8,
            format: PixelFormat::Rgb565,
        };
        target.fill(0xf800);

        assert_eq!(&bytes[..6], &[0x00, 0xf8, 0x00, 0xf8, 0x00, 0xf8]);
        assert_eq!(&bytes[6..8], &[0, 0]);
    }

    #[test]
    fn request_reports_scaled_buffer_size() {
        let request = PrepareRequest {
            scale: 2,
            transform: BufferTransform::Rotate270,
            ..PrepareRequest::new(Size::new(30, 20))
        };
        assert_eq!(request.buffer_size().unwrap(), Size::new(40, 60));
    }

    #[test]
    fn overflowing_scale_is_an_invalid_size() {
        let request = PrepareRequest {
            scale: 4,
            ..PrepareRequest::new(Size::new(0x4000_0001, 300))
        };
        assert!(matches!(
            request.buffer_size(),
            Err(BackendError::InvalidSize {
                width: 0x4000_0001,
                height: 300
            })
        ));
    }
}
