//! Display buffer pool.
//!
//! The pool owns N scan-out buffers handed out by a [`BufferAllocator`] and,
//! for each one, an anonymous CPU mapping used as staging memory. Pixel
//! content is written into the staging region and then uploaded to the
//! device buffer, so the CPU never touches memory the display controller is
//! reading from.

use std::io;
use std::ptr::NonNull;

use bitflags::bitflags;

use crate::core::errors::{CoreError, Result};
use crate::platform::api::BufferAllocator;
use crate::util::logging;

/// Opaque identifier of a device buffer, owned by the display subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Pixel layouts the pool can stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 32-bit little-endian `x:R:G:B`
    #[default]
    Xrgb8888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Xrgb8888 => 4,
        }
    }

    /// Color depth passed to legacy framebuffer creation.
    pub fn depth(self) -> u32 {
        match self {
            PixelFormat::Xrgb8888 => 24,
        }
    }

    pub fn bits_per_pixel(self) -> u32 {
        self.bytes_per_pixel() * 8
    }

    /// DRM fourcc code (`XR24`).
    pub fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Xrgb8888 => u32::from_le_bytes(*b"XR24"),
        }
    }
}

bitflags! {
    /// Requested buffer usage. Values match `GBM_BO_USE_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const SCANOUT = 1 << 0;
        const CURSOR = 1 << 1;
        const RENDERING = 1 << 2;
        const WRITE = 1 << 3;
        const LINEAR = 1 << 4;
    }
}

/// What the allocator is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

/// What the allocator hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedBuffer {
    pub handle: BufferHandle,
    /// Row stride in bytes
    pub pitch: u32,
}

/// Anonymous private mapping used as CPU staging memory.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-length mapping"));
        }

        // SAFETY: fresh anonymous mapping, no fd or existing memory involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    /// Take ownership of an existing shared mapping; it is unmapped on drop.
    ///
    /// # Safety
    ///
    /// `ptr`/`len` must describe a live `mmap` region nobody else unmaps.
    pub unsafe fn adopt(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `anonymous` or handed over through `adopt`, and is unmapped only here.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// One scan-out capable surface plus its staging memory.
#[derive(Debug)]
pub struct DisplayBuffer {
    pub handle: BufferHandle,
    pub pitch: u32,
    pub format: PixelFormat,
    /// Set while the display hardware owns the buffer
    pub in_flight: bool,
    staging: Option<MappedRegion>,
}

impl DisplayBuffer {
    pub fn is_mapped(&self) -> bool {
        self.staging.is_some()
    }
}

/// Fixed-size set of display buffers sharing one geometry.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<DisplayBuffer>,
    width: u32,
    height: u32,
    pitch: u32,
    format: PixelFormat,
    released: bool,
}

impl BufferPool {
    /// Allocate and map `count` buffers.
    ///
    /// Any failure releases what was already acquired and is returned as-is;
    /// there is no retry with a smaller pool.
    pub fn allocate<A: BufferAllocator + ?Sized>(
        allocator: &mut A,
        count: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<Self> {
        if count == 0 {
            return Err(CoreError::config_error("buffer pool needs at least one buffer"));
        }

        let mut pool = Self {
            buffers: Vec::with_capacity(count),
            width,
            height,
            pitch: 0,
            format,
            released: false,
        };

        for index in 0..count {
            if let Err(e) = pool.push_buffer(allocator, index, usage) {
                tracing::error!(target: logging::POOL, "Allocation of buffer {} failed, releasing {} buffer(s)", index, pool.buffers.len());
                pool.release(allocator);
                return Err(e);
            }
        }

        tracing::debug!(
            target: logging::POOL,
            "Allocated {} buffers {}x{} pitch={} format={:?}",
            count, width, height, pool.pitch, format
        );
        Ok(pool)
    }

    fn push_buffer<A: BufferAllocator + ?Sized>(
        &mut self,
        allocator: &mut A,
        index: usize,
        usage: BufferUsage,
    ) -> Result<()> {
        let desc = BufferDesc {
            index,
            width: self.width,
            height: self.height,
            format: self.format,
            usage,
        };

        let allocated = allocator
            .allocate(&desc)
            .map_err(|source| CoreError::Allocation { index, source })?;

        let min_pitch = self.width * self.format.bytes_per_pixel();
        let stride_error = if allocated.pitch < min_pitch {
            Some(format!("pitch {} below row size {}", allocated.pitch, min_pitch))
        } else if index > 0 && allocated.pitch != self.pitch {
            Some(format!("pitch {} differs from pool pitch {}", allocated.pitch, self.pitch))
        } else {
            None
        };
        if let Some(msg) = stride_error {
            allocator.release(allocated.handle);
            return Err(CoreError::Allocation {
                index,
                source: io::Error::new(io::ErrorKind::InvalidData, msg),
            });
        }

        let len = allocated.pitch as usize * self.height as usize;
        let staging = match MappedRegion::anonymous(len) {
            Ok(region) => region,
            Err(source) => {
                allocator.release(allocated.handle);
                return Err(CoreError::Map { index, source });
            }
        };

        self.pitch = allocated.pitch;
        self.buffers.push(DisplayBuffer {
            handle: allocated.handle,
            pitch: allocated.pitch,
            format: self.format,
            in_flight: false,
            staging: Some(staging),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Stride captured at allocation time, shared by every buffer.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn buffer(&self, index: usize) -> Option<&DisplayBuffer> {
        self.buffers.get(index)
    }

    pub fn handle(&self, index: usize) -> Option<BufferHandle> {
        self.buffers.get(index).map(|b| b.handle)
    }

    pub fn handles(&self) -> Vec<BufferHandle> {
        self.buffers.iter().map(|b| b.handle).collect()
    }

    pub fn is_in_flight(&self, index: usize) -> bool {
        self.buffers.get(index).map(|b| b.in_flight).unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.in_flight).count()
    }

    /// Hand a buffer to the display. Fails if it is already there.
    pub fn mark_in_flight(&mut self, index: usize) -> Result<()> {
        let buffer = self.buffer_mut(index)?;
        if buffer.in_flight {
            return Err(CoreError::BufferBusy(index));
        }
        buffer.in_flight = true;
        Ok(())
    }

    pub fn mark_idle(&mut self, index: usize) {
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.in_flight = false;
        }
    }

    /// First buffer that is neither in flight nor `exclude` (the front).
    pub fn next_free(&self, exclude: usize) -> Option<usize> {
        self.buffers
            .iter()
            .enumerate()
            .find(|(i, b)| *i != exclude && !b.in_flight)
            .map(|(i, _)| i)
    }

    /// Writable staging memory of an idle buffer.
    pub fn staging_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let buffer = self.buffer_mut(index)?;
        if buffer.in_flight {
            return Err(CoreError::BufferBusy(index));
        }
        match buffer.staging.as_mut() {
            Some(region) => Ok(region.as_mut_slice()),
            None => Err(CoreError::Map {
                index,
                source: io::Error::new(io::ErrorKind::NotFound, "staging memory already unmapped"),
            }),
        }
    }

    pub fn staging(&self, index: usize) -> Option<&[u8]> {
        self.buffers
            .get(index)
            .and_then(|b| b.staging.as_ref())
            .map(|r| r.as_slice())
    }

    /// Copy the staged pixels of an idle buffer into its device buffer.
    pub fn upload<A: BufferAllocator + ?Sized>(&mut self, allocator: &mut A, index: usize) -> Result<()> {
        let buffer = self.buffers.get(index).ok_or_else(|| Self::missing(index))?;
        if buffer.in_flight {
            return Err(CoreError::BufferBusy(index));
        }
        let region = buffer.staging.as_ref().ok_or_else(|| CoreError::Map {
            index,
            source: io::Error::new(io::ErrorKind::NotFound, "staging memory already unmapped"),
        })?;

        allocator
            .upload(buffer.handle, region.as_slice())
            .map_err(|source| CoreError::Map { index, source })
    }

    /// Unmap every staging region still mapped. Returns how many were unmapped.
    pub fn unmap_all(&mut self) -> usize {
        let mut unmapped = 0;
        for buffer in &mut self.buffers {
            if buffer.staging.take().is_some() {
                unmapped += 1;
            }
        }
        unmapped
    }

    /// Unmap staging memory and give the device buffers back, once.
    pub fn release<A: BufferAllocator + ?Sized>(&mut self, allocator: &mut A) -> usize {
        if self.released {
            return 0;
        }
        let unmapped = self.unmap_all();
        for buffer in &mut self.buffers {
            buffer.in_flight = false;
            allocator.release(buffer.handle);
        }
        self.released = true;
        tracing::debug!(target: logging::POOL, "Released {} buffers ({} mappings)", self.buffers.len(), unmapped);
        unmapped
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn buffer_mut(&mut self, index: usize) -> Result<&mut DisplayBuffer> {
        self.buffers.get_mut(index).ok_or_else(|| Self::missing(index))
    }

    fn missing(index: usize) -> CoreError {
        CoreError::Device(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no buffer at index {}", index),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Allocator that hands out sequential handles and can fail on demand.
    #[derive(Default)]
    struct CountingAllocator {
        next: u32,
        pitch_pad: u32,
        fail_at: Option<usize>,
        live: HashSet<u32>,
        released: Vec<u32>,
        uploads: Vec<(u32, usize)>,
    }

    impl BufferAllocator for CountingAllocator {
        fn allocate(&mut self, desc: &BufferDesc) -> io::Result<AllocatedBuffer> {
            if self.fail_at == Some(desc.index) {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            self.next += 1;
            self.live.insert(self.next);
            Ok(AllocatedBuffer {
                handle: BufferHandle(self.next),
                pitch: desc.width * 4 + self.pitch_pad,
            })
        }

        fn upload(&mut self, handle: BufferHandle, pixels: &[u8]) -> io::Result<()> {
            self.uploads.push((handle.0, pixels.len()));
            Ok(())
        }

        fn release(&mut self, handle: BufferHandle) {
            assert!(self.live.remove(&handle.0), "double release of {}", handle.0);
            self.released.push(handle.0);
        }
    }

    fn pool(alloc: &mut CountingAllocator) -> BufferPool {
        BufferPool::allocate(alloc, 2, 64, 32, PixelFormat::Xrgb8888, BufferUsage::SCANOUT | BufferUsage::WRITE)
            .unwrap()
    }

    #[test]
    fn test_allocate_shares_geometry() {
        let mut alloc = CountingAllocator { pitch_pad: 16, ..Default::default() };
        let pool = pool(&mut alloc);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.pitch(), 64 * 4 + 16);
        assert_eq!(pool.staging(0).unwrap().len(), (64 * 4 + 16) * 32);
        assert_eq!(pool.handles(), vec![BufferHandle(1), BufferHandle(2)]);
    }

    #[test]
    fn test_partial_allocation_is_released() {
        let mut alloc = CountingAllocator { fail_at: Some(1), ..Default::default() };
        let err = BufferPool::allocate(&mut alloc, 2, 64, 32, PixelFormat::Xrgb8888, BufferUsage::SCANOUT)
            .unwrap_err();
        assert!(matches!(err, CoreError::Allocation { index: 1, .. }));
        assert!(alloc.live.is_empty());
        assert_eq!(alloc.released, vec![1]);
    }

    #[test]
    fn test_in_flight_blocks_writes() {
        let mut alloc = CountingAllocator::default();
        let mut pool = pool(&mut alloc);

        pool.mark_in_flight(1).unwrap();
        assert!(matches!(pool.staging_mut(1), Err(CoreError::BufferBusy(1))));
        assert!(matches!(pool.upload(&mut alloc, 1), Err(CoreError::BufferBusy(1))));
        assert!(matches!(pool.mark_in_flight(1), Err(CoreError::BufferBusy(1))));
        assert!(pool.staging_mut(0).is_ok());

        pool.mark_idle(1);
        assert!(pool.staging_mut(1).is_ok());
    }

    #[test]
    fn test_next_free_skips_front_and_in_flight() {
        let mut alloc = CountingAllocator::default();
        let mut pool =
            BufferPool::allocate(&mut alloc, 3, 8, 8, PixelFormat::Xrgb8888, BufferUsage::SCANOUT).unwrap();
        assert_eq!(pool.next_free(0), Some(1));
        pool.mark_in_flight(1).unwrap();
        assert_eq!(pool.next_free(0), Some(2));
        pool.mark_in_flight(2).unwrap();
        assert_eq!(pool.next_free(0), None);
    }

    #[test]
    fn test_release_unmaps_once() {
        let mut alloc = CountingAllocator::default();
        let mut pool = pool(&mut alloc);

        assert_eq!(pool.release(&mut alloc), 2);
        assert_eq!(pool.release(&mut alloc), 0);
        assert_eq!(pool.unmap_all(), 0);
        assert!(alloc.live.is_empty());
        assert_eq!(alloc.released.len(), 2);
        assert!(matches!(pool.staging_mut(0), Err(CoreError::Map { index: 0, .. })));
    }

    #[test]
    fn test_upload_sends_whole_staging_region() {
        let mut alloc = CountingAllocator::default();
        let mut pool = pool(&mut alloc);
        pool.upload(&mut alloc, 0).unwrap();
        assert_eq!(alloc.uploads, vec![(1, 64 * 4 * 32)]);
    }

    #[test]
    fn test_adopted_shared_mapping_writes_through_to_file() {
        use std::io::Read;
        use std::os::fd::AsRawFd;

        let mut file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);

        let mut region = unsafe { MappedRegion::adopt(NonNull::new(ptr as *mut u8).unwrap(), 4096) };
        // Several frames through one mapping.
        for frame in 1..=3u8 {
            region.as_mut_slice()[..4].fill(frame);
        }
        drop(region);

        let mut head = [0u8; 4];
        file.read_exact(&mut head).unwrap();
        assert_eq!(head, [3; 4]);
    }

    #[test]
    fn test_fourcc() {
        assert_eq!(PixelFormat::Xrgb8888.fourcc(), 0x3432_5258);
        assert_eq!(PixelFormat::Xrgb8888.bits_per_pixel(), 32);
    }
}
