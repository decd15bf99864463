//! Common imports and types used throughout kmsflip.

pub use crate::config::{BufferKind, PresentConfig};
pub use crate::core::errors::{CoreError, Result};
pub use crate::core::{ExitReason, FlipProtocol, PresentationState};
pub use crate::platform::api::{BufferAllocator, DisplayDevice, InputSource};
