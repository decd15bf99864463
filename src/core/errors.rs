//! Core error types

use std::io;

use thiserror::Error;

/// Presentation engine errors.
///
/// Every variant is fatal for the run; the lifecycle controller funnels them
/// through the single teardown path before the process exits non-zero.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to allocate display buffer {index}: {source}")]
    Allocation {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to map staging memory for buffer {index}: {source}")]
    Map {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("kernel rejected commit of buffer {buffer}: {source}")]
    Commit {
        buffer: usize,
        #[source]
        source: io::Error,
    },

    #[error("buffer {0} is still owned by the display")]
    BufferBusy(usize),

    #[error("readiness wait failed: {0}")]
    IoWait(#[source] io::Error),

    #[error("failed to register watch: {0}")]
    Watch(#[source] io::Error),

    #[error("display device error: {0}")]
    Device(#[source] io::Error),

    #[error("input device error: {0}")]
    Input(#[source] io::Error),

    #[error("image error: {0}")]
    Image(String),
}

impl CoreError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn image_error(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }

    /// True for errors raised before any device resource was touched.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Image(_))
    }

    /// Raw OS error code carried by kernel-facing failures, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Allocation { source, .. }
            | Self::Map { source, .. }
            | Self::Commit { source, .. } => source.raw_os_error(),
            Self::IoWait(e) | Self::Watch(e) | Self::Device(e) | Self::Input(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
