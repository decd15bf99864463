//! Collaborator interfaces consumed by the presentation engine.
//!
//! The engine never opens device nodes, enumerates connectors or decodes
//! input on its own. It talks to the outside world only through these
//! traits:
//!
//! - [`DisplayDevice`]: commit target, scan-out calls, pollable completion fd
//! - [`BufferAllocator`]: scan-out buffers and uploads into them
//! - [`InputSource`]: pollable keyboard fd and key decoding
//! - [`ImageDecoder`]: optional static image decoding
//!
//! Kernel-facing calls return `io::Result` so the OS error code survives to
//! the operator.

use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use crate::core::buffer::{AllocatedBuffer, BufferDesc, BufferHandle};
use crate::core::input::KeyEvent;
use crate::core::request::FrameRequest;

/// Resolved output the engine presents to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub width: u32,
    pub height: u32,
    /// Refresh rate in Hz
    pub refresh: u32,
    pub connector: u32,
    pub crtc: u32,
    /// Primary plane, when the device exposes planes
    pub plane: Option<u32>,
    pub name: String,
}

/// Decoded flip-completion payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub sequence: u32,
    /// Kernel timestamp of the vblank that applied the flip
    pub timestamp: Duration,
    /// CRTC the flip completed on
    pub target: u32,
}

/// Scan-out side of the display device.
pub trait DisplayDevice {
    /// Readable when flip completions are pending.
    fn completion_fd(&self) -> BorrowedFd<'_>;

    /// Mode and commit target chosen at open time.
    fn target(&self) -> &OutputTarget;

    /// Blocking set-CRTC to `buffer`. Returns once the kernel scans it out.
    fn set_mode(&mut self, buffer: BufferHandle) -> io::Result<()>;

    /// Legacy page flip to `buffer`, completion reported on the fd.
    fn page_flip(&mut self, buffer: BufferHandle) -> io::Result<()>;

    /// Apply an atomic request, completion reported on the fd.
    fn atomic_commit(&mut self, request: &FrameRequest) -> io::Result<()>;

    /// Drain and decode every completion currently readable.
    fn read_events(&mut self) -> io::Result<Vec<FlipEvent>>;
}

/// Buffer allocation side of the display device.
pub trait BufferAllocator {
    fn allocate(&mut self, desc: &BufferDesc) -> io::Result<AllocatedBuffer>;

    /// Copy `pixels` (pitch * height bytes) into the device buffer.
    fn upload(&mut self, handle: BufferHandle, pixels: &[u8]) -> io::Result<()>;

    fn release(&mut self, handle: BufferHandle);
}

/// Keyboard provider.
pub trait InputSource {
    fn input_fd(&self) -> BorrowedFd<'_>;

    /// Decode every key event currently available. Never blocks.
    fn read_keys(&mut self) -> io::Result<Vec<KeyEvent>>;
}

/// Output of an [`ImageDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Channels per pixel in `pixels` (always 4 for RGBA)
    pub channels: u32,
    pub pixels: Vec<u8>,
}

pub trait ImageDecoder {
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<DecodedImage>;
}
