pub mod errors;
pub mod input;
pub mod buffer;
pub mod request;
pub mod source;
pub mod state;
pub mod scheduler;
pub mod runtime;
pub mod lifecycle;

#[cfg(test)]
mod tests;

// Re-export key types
pub use buffer::{BufferHandle, BufferPool, PixelFormat};
pub use errors::{CoreError, Result};
pub use lifecycle::{run, run_with, EngineSettings, PresentEngine, Presenter, RunSummary, SourceKind, TeardownReport};
pub use runtime::{FrameTiming, LoopControl, Runtime, WatchSet};
pub use scheduler::{FlipProtocol, FlipScheduler};
pub use source::PixelSource;
pub use state::{ExitReason, PresentationState};
