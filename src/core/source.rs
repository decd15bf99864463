//! Frame content producers.
//!
//! A [`PixelSource`] writes the next frame into a staging region given the
//! pool geometry. It never talks to the device.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::errors::{CoreError, Result};
use crate::core::state::PresentationState;
use crate::platform::api::DecodedImage;
use crate::util::logging;

/// Per-channel step bounds of the color ramp (R, G, B).
pub const RAMP_STEPS: (u8, u8, u8) = (20, 10, 5);

/// Supplies ramp step sizes in `1..=max`.
pub trait StepSource {
    fn step(&mut self, max: u8) -> u8;
}

/// Step source backed by any `rand` generator.
pub struct RandomSteps<R>(pub R);

impl<R: Rng> StepSource for RandomSteps<R> {
    fn step(&mut self, max: u8) -> u8 {
        self.0.gen_range(1..=max.max(1))
    }
}

/// One color channel bouncing between 0 and 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub value: u8,
    pub up: bool,
    pub max_step: u8,
}

impl Channel {
    pub fn new(value: u8, max_step: u8) -> Self {
        Self {
            value,
            up: true,
            max_step,
        }
    }

    /// Move by `step` in the current direction.
    ///
    /// A step that would leave 0..=255 flips the direction instead, and the
    /// value holds for this tick.
    pub fn advance(&mut self, step: u8) -> u8 {
        let next = if self.up {
            self.value.checked_add(step)
        } else {
            self.value.checked_sub(step)
        };

        match next {
            Some(value) => self.value = value,
            None => self.up = !self.up,
        }
        self.value
    }
}

/// Three independent channels packed into one XRGB word per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorRamp {
    pub r: Channel,
    pub g: Channel,
    pub b: Channel,
}

impl ColorRamp {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self {
            r: Channel::new(r, RAMP_STEPS.0),
            g: Channel::new(g, RAMP_STEPS.1),
            b: Channel::new(b, RAMP_STEPS.2),
        }
    }

    /// Random starting color, all channels rising.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self::new(rng.gen(), rng.gen(), rng.gen())
    }

    pub fn advance(&mut self, steps: &mut dyn StepSource) -> u32 {
        let r = self.r.advance(steps.step(self.r.max_step));
        let g = self.g.advance(steps.step(self.g.max_step));
        let b = self.b.advance(steps.step(self.b.max_step));
        pack_xrgb(r, g, b)
    }

    pub fn color(&self) -> u32 {
        pack_xrgb(self.r.value, self.g.value, self.b.value)
    }
}

pub fn pack_xrgb(r: u8, g: u8, b: u8) -> u32 {
    (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

/// Write `color` into every pixel of a `width` x `height` frame.
///
/// Row padding past `width * 4` bytes is left untouched.
pub fn fill_solid(region: &mut [u8], width: u32, height: u32, stride: u32, color: u32) -> Result<()> {
    let row_bytes = width as usize * 4;
    let stride = stride as usize;
    check_extent(region.len(), row_bytes, height, stride)?;

    let pixel = color.to_ne_bytes();
    for row in region.chunks_mut(stride).take(height as usize) {
        for px in row[..row_bytes].chunks_exact_mut(4) {
            px.copy_from_slice(&pixel);
        }
    }
    Ok(())
}

fn check_extent(len: usize, row_bytes: usize, height: u32, stride: usize) -> Result<()> {
    if stride < row_bytes {
        return Err(CoreError::config_error(format!(
            "stride {} smaller than row of {} bytes",
            stride, row_bytes
        )));
    }
    let needed = stride * height.saturating_sub(1) as usize + row_bytes;
    if height > 0 && len < needed {
        return Err(CoreError::config_error(format!(
            "staging region of {} bytes cannot hold {} rows at stride {}",
            len, height, stride
        )));
    }
    Ok(())
}

/// Next-frame content.
pub enum PixelSource {
    /// Reversing solid-color ramp
    Animated {
        ramp: ColorRamp,
        steps: Box<dyn StepSource>,
    },
    /// Pre-converted XRGB frame laid out at the pool stride
    Static { pixels: Vec<u8>, stride: u32 },
}

impl PixelSource {
    /// Animated source with a random start color. `seed` makes it reproducible.
    pub fn animated(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let ramp = ColorRamp::random(&mut rng);
        Self::Animated {
            ramp,
            steps: Box::new(RandomSteps(rng)),
        }
    }

    pub fn with_steps(ramp: ColorRamp, steps: Box<dyn StepSource>) -> Self {
        Self::Animated { ramp, steps }
    }

    /// Convert a decoded RGBA image into a display-sized XRGB frame.
    ///
    /// The image must be exactly as wide as the display. Rows below the
    /// image are black; rows below the display are dropped.
    pub fn from_image(image: &DecodedImage, width: u32, height: u32, stride: u32) -> Result<Self> {
        if image.width != width {
            return Err(CoreError::config_error(format!(
                "image is {} pixels wide but the display is {} pixels wide",
                image.width, width
            )));
        }
        if image.channels < 3 {
            return Err(CoreError::image_error(format!(
                "unsupported channel count {}",
                image.channels
            )));
        }
        let channels = image.channels as usize;
        let expected = image.width as usize * image.height as usize * channels;
        if image.pixels.len() < expected {
            return Err(CoreError::image_error(format!(
                "decoded image holds {} bytes, expected {}",
                image.pixels.len(),
                expected
            )));
        }

        let stride_bytes = stride as usize;
        check_extent(stride_bytes * height as usize, width as usize * 4, height, stride_bytes)?;

        let mut pixels = vec![0u8; stride_bytes * height as usize];
        let rows = image.height.min(height) as usize;
        let src_row = image.width as usize * channels;
        for (dst, src) in pixels
            .chunks_mut(stride_bytes)
            .zip(image.pixels.chunks(src_row))
            .take(rows)
        {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(channels)) {
                let word = pack_xrgb(s[0], s[1], s[2]) | 0xff00_0000;
                d.copy_from_slice(&word.to_ne_bytes());
            }
        }

        tracing::debug!(
            target: logging::SOURCE,
            "Prepared static frame from {}x{} image ({} rows shown)",
            image.width, image.height, rows
        );
        Ok(Self::Static { pixels, stride })
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Animated { .. } => "animated",
            Self::Static { .. } => "static",
        }
    }

    /// Write the next frame into `region`.
    pub fn next(
        &mut self,
        state: &PresentationState,
        region: &mut [u8],
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<()> {
        match self {
            Self::Animated { ramp, steps } => {
                let color = ramp.advance(steps.as_mut());
                tracing::trace!(target: logging::SOURCE, "frame {} color {:06x}", state.frame(), color);
                fill_solid(region, width, height, stride, color)
            }
            Self::Static { pixels, stride: own_stride } => {
                if *own_stride != stride {
                    return Err(CoreError::config_error(format!(
                        "static frame prepared for stride {} cannot fill stride {}",
                        own_stride, stride
                    )));
                }
                if region.len() < pixels.len() {
                    return Err(CoreError::config_error(format!(
                        "static frame needs {} bytes, region has {}",
                        pixels.len(),
                        region.len()
                    )));
                }
                region[..pixels.len()].copy_from_slice(pixels);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for PixelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Animated { ramp, .. } => f.debug_struct("Animated").field("ramp", ramp).finish(),
            Self::Static { pixels, stride } => f
                .debug_struct("Static")
                .field("bytes", &pixels.len())
                .field("stride", stride)
                .finish(),
        }
    }
}

/// Deterministic steps for tests.
#[cfg(test)]
pub(crate) struct ScriptedSteps {
    steps: std::collections::VecDeque<u8>,
    fallback: u8,
}

#[cfg(test)]
impl ScriptedSteps {
    pub(crate) fn new(steps: impl IntoIterator<Item = u8>, fallback: u8) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            fallback,
        }
    }
}

#[cfg(test)]
impl StepSource for ScriptedSteps {
    fn step(&mut self, max: u8) -> u8 {
        self.steps.pop_front().unwrap_or(self.fallback).min(max)
    }
}
