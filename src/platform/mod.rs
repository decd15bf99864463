//! Platform integration.
//!
//! The engine in `core` only sees the traits in [`api`]. This module holds
//! their implementations: the KMS device and libinput for real hardware,
//! the `image` crate for decoding, and a headless pair used by tests and
//! the `headless` binary.

pub mod api;
pub mod drm;
pub mod headless;
pub mod image;
pub mod libinput;

pub use api::{BufferAllocator, DecodedImage, DisplayDevice, FlipEvent, ImageDecoder, InputSource, OutputTarget};
