//! Run configuration.

use std::path::PathBuf;

use crate::core::buffer::PixelFormat;
use crate::core::errors::{CoreError, Result};
use crate::core::input::QuitKeys;
use crate::core::lifecycle::EngineSettings;
use crate::core::scheduler::FlipProtocol;

/// Frames shown by the synchronous protocol when no limit is given.
pub const DEFAULT_MODESET_FRAMES: u64 = 500;

/// How scan-out buffers are allocated on the KMS device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferKind {
    /// GBM buffer objects with scanout and write usage
    #[default]
    Gbm,
    /// KMS dumb buffers written through their mapping
    Dumb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentConfig {
    /// KMS device node
    pub device_path: PathBuf,
    /// Static image to show instead of the color ramp
    pub image: Option<PathBuf>,
    pub protocol: FlipProtocol,
    pub buffer_kind: BufferKind,
    pub buffer_count: usize,
    pub format: PixelFormat,
    /// Stop after this many confirmed frames
    pub frame_limit: Option<u64>,
    /// libinput seat
    pub seat: String,
    /// evdev key codes that end the run
    pub quit_keys: Vec<u32>,
    /// Seed for the color ramp
    pub seed: Option<u64>,
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/dri/card0"),
            image: None,
            protocol: FlipProtocol::Atomic,
            buffer_kind: BufferKind::Gbm,
            buffer_count: 2,
            format: PixelFormat::Xrgb8888,
            frame_limit: None,
            seat: "seat0".to_string(),
            quit_keys: QuitKeys::default().codes().to_vec(),
            seed: None,
        }
    }
}

impl PresentConfig {
    /// Reject settings that cannot work before any device is opened.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < 2 {
            return Err(CoreError::config_error(format!(
                "buffer count must be at least 2, got {}",
                self.buffer_count
            )));
        }
        if self.frame_limit == Some(0) {
            return Err(CoreError::config_error("frame limit must be positive"));
        }
        if self.quit_keys.is_empty() {
            return Err(CoreError::config_error("no quit key configured"));
        }
        if self.seat.is_empty() {
            return Err(CoreError::config_error("seat name is empty"));
        }
        if let Some(path) = &self.image {
            if !path.is_file() {
                return Err(CoreError::config_error(format!(
                    "image {} does not exist or is not a file",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Frame limit in effect; the synchronous protocol always has one.
    pub fn effective_frame_limit(&self) -> Option<u64> {
        match (self.frame_limit, self.protocol) {
            (None, FlipProtocol::Modeset) => Some(DEFAULT_MODESET_FRAMES),
            (limit, _) => limit,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            protocol: self.protocol,
            buffer_count: self.buffer_count,
            format: self.format,
            quit_keys: QuitKeys::new(self.quit_keys.clone()),
            frame_limit: self.effective_frame_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::input::{KEY_ESC, KEY_Q};

    #[test]
    fn test_defaults() {
        let config = PresentConfig::default();
        assert_eq!(config.device_path, PathBuf::from("/dev/dri/card0"));
        assert_eq!(config.protocol, FlipProtocol::Atomic);
        assert_eq!(config.buffer_count, 2);
        assert_eq!(config.quit_keys, vec![KEY_ESC, KEY_Q]);
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_frame_limit(), None);
    }

    #[test]
    fn test_modeset_gets_default_frame_limit() {
        let config = PresentConfig {
            protocol: FlipProtocol::Modeset,
            ..Default::default()
        };
        assert_eq!(config.effective_frame_limit(), Some(DEFAULT_MODESET_FRAMES));
        assert_eq!(config.engine_settings().frame_limit, Some(500));

        let bounded = PresentConfig { frame_limit: Some(10), ..config };
        assert_eq!(bounded.effective_frame_limit(), Some(10));
    }

    #[test]
    fn test_rejects_bad_settings() {
        let single = PresentConfig { buffer_count: 1, ..Default::default() };
        assert!(single.validate().unwrap_err().is_config());

        let zero = PresentConfig { frame_limit: Some(0), ..Default::default() };
        assert!(zero.validate().is_err());

        let no_keys = PresentConfig { quit_keys: vec![], ..Default::default() };
        assert!(no_keys.validate().is_err());
    }

    #[test]
    fn test_image_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = PresentConfig {
            image: Some(dir.path().join("missing.png")),
            ..Default::default()
        };
        assert!(matches!(missing.validate(), Err(CoreError::Config(_))));

        let file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let present = PresentConfig {
            image: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(present.validate().is_ok());

        let directory = PresentConfig {
            image: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(directory.validate().is_err());
    }
}
