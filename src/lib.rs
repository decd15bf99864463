// kmsflip
//
// Double-buffered frame presentation straight to a KMS display.
// The engine in core/ owns the buffer pool, the flip state machine and the
// readiness loop; platform/ adapts DRM, GBM, libinput and image decoding.

pub mod core;
pub mod platform;
pub mod config;
pub mod util;
pub mod prelude;

pub use config::{BufferKind, PresentConfig};
pub use crate::core::lifecycle::{run, try_run};
