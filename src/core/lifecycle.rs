//! Lifecycle controller.
//!
//! Sequences a run: allocate the pool, build the pixel source, scan out the
//! first frame, prime the pipeline with one present, enter the loop. Every
//! exit path, clean or not, goes through [`Presenter::teardown`], which
//! releases resources in reverse acquisition order exactly once:
//!
//! 1. unmap staging memory and free device buffers
//! 2. close the watch set
//! 3. drop the input and display collaborators

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;

use crate::config::PresentConfig;
use crate::core::buffer::{BufferPool, BufferUsage, PixelFormat};
use crate::core::errors::{CoreError, Result};
use crate::core::input::QuitKeys;
use crate::core::runtime::{LoopControl, Runtime, WatchSet, WatchToken};
use crate::core::scheduler::{FlipProtocol, FlipScheduler};
use crate::core::source::PixelSource;
use crate::core::state::{ExitReason, PresentationState};
use crate::platform::api::{BufferAllocator, DecodedImage, DisplayDevice, ImageDecoder, InputSource};
use crate::platform::drm::DrmDisplay;
use crate::platform::image::ImageCrateDecoder;
use crate::platform::libinput::LibinputSource;
use crate::util::logging;

/// Engine parameters that do not concern device selection.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub protocol: FlipProtocol,
    pub buffer_count: usize,
    pub format: PixelFormat,
    pub quit_keys: QuitKeys,
    pub frame_limit: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            protocol: FlipProtocol::default(),
            buffer_count: 2,
            format: PixelFormat::default(),
            quit_keys: QuitKeys::default(),
            frame_limit: None,
        }
    }
}

/// Where frame content comes from.
pub enum SourceKind {
    /// Random color ramp, optionally seeded
    Animated { seed: Option<u64> },
    /// Decoded image, converted once at startup
    Image(DecodedImage),
    /// Prebuilt animated source
    Custom(PixelSource),
}

/// What teardown released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub unmapped: usize,
    pub buffers_released: usize,
    pub watches_closed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub exit: ExitReason,
    /// Confirmed flips
    pub frames: u64,
    /// Commits issued after the initial scan-out
    pub presents: u64,
    pub teardown: TeardownReport,
}

/// Everything the scheduler and the loop operate on.
///
/// Dropping the engine releases the pool before the collaborators go away.
pub struct PresentEngine<D, I>
where
    D: DisplayDevice + BufferAllocator,
    I: InputSource,
{
    pub(crate) pool: BufferPool,
    pub(crate) source: PixelSource,
    pub(crate) scheduler: FlipScheduler,
    pub(crate) state: PresentationState,
    pub(crate) input: I,
    pub(crate) device: D,
}

impl<D, I> PresentEngine<D, I>
where
    D: DisplayDevice + BufferAllocator,
    I: InputSource,
{
    pub fn present_next(&mut self) -> Result<usize> {
        self.scheduler
            .present_next(&mut self.device, &mut self.pool, &mut self.source, &mut self.state)
    }

    fn release_buffers(&mut self) -> (usize, usize) {
        if self.pool.is_released() {
            return (0, 0);
        }
        let count = self.pool.len();
        (self.pool.release(&mut self.device), count)
    }
}

impl<D, I> Drop for PresentEngine<D, I>
where
    D: DisplayDevice + BufferAllocator,
    I: InputSource,
{
    fn drop(&mut self) {
        self.release_buffers();
    }
}

/// Owns one run of the engine.
pub struct Presenter<D, I>
where
    D: DisplayDevice + BufferAllocator,
    I: InputSource,
{
    runtime: Option<Runtime>,
    engine: PresentEngine<D, I>,
    settings: EngineSettings,
    torn_down: bool,
}

impl<D, I> Presenter<D, I>
where
    D: DisplayDevice + BufferAllocator,
    I: InputSource,
{
    /// Allocate the pool and build the pixel source. No commit is issued.
    pub fn new(mut device: D, input: I, source: SourceKind, settings: EngineSettings) -> Result<Self> {
        if settings.buffer_count < 2 {
            return Err(CoreError::config_error(format!(
                "double buffering needs at least 2 buffers, got {}",
                settings.buffer_count
            )));
        }

        let target = device.target().clone();
        if let SourceKind::Image(image) = &source {
            if image.width != target.width {
                return Err(CoreError::config_error(format!(
                    "image width {} does not match display width {}",
                    image.width, target.width
                )));
            }
        }

        let mut pool = BufferPool::allocate(
            &mut device,
            settings.buffer_count,
            target.width,
            target.height,
            settings.format,
            BufferUsage::SCANOUT | BufferUsage::WRITE,
        )?;

        let built = match source {
            SourceKind::Animated { seed } => Ok(PixelSource::animated(seed)),
            SourceKind::Image(image) => PixelSource::from_image(&image, target.width, target.height, pool.pitch()),
            SourceKind::Custom(source) => Ok(source),
        };
        let source = match built {
            Ok(source) => source,
            Err(e) => {
                pool.release(&mut device);
                return Err(e);
            }
        };

        tracing::info!(
            target: logging::MAIN,
            "Presenting on {} {}x{}@{} via {} with {} {} buffers",
            target.name,
            target.width,
            target.height,
            target.refresh,
            settings.protocol.name(),
            settings.buffer_count,
            source.kind()
        );

        Ok(Self {
            runtime: None,
            engine: PresentEngine {
                pool,
                source,
                scheduler: FlipScheduler::new(settings.protocol),
                state: PresentationState::new(settings.buffer_count),
                input,
                device,
            },
            settings,
            torn_down: false,
        })
    }

    /// Scan out the first frame, prime the pipeline and register the watches.
    pub fn start(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Ok(());
        }

        let engine = &mut self.engine;
        engine
            .scheduler
            .scan_out_initial(&mut engine.device, &mut engine.pool, &mut engine.source, &engine.state)?;
        let primed = engine.present_next()?;
        tracing::debug!(target: logging::LOOP, "Pipeline primed with buffer {}", primed);

        let mut watch = WatchSet::new()?;
        watch.add(engine.device.completion_fd(), WatchToken::Display)?;
        watch.add(engine.input.input_fd(), WatchToken::Input)?;

        self.runtime = Some(Runtime::new(
            watch,
            self.settings.quit_keys.clone(),
            self.settings.frame_limit,
        ));
        Ok(())
    }

    /// One wake of the loop.
    pub fn turn(&mut self) -> Result<LoopControl> {
        match self.runtime.as_mut() {
            Some(runtime) => runtime.turn(&mut self.engine),
            None => Err(CoreError::config_error("presenter not started")),
        }
    }

    /// Start, loop until the termination flag is set, tear down.
    pub fn run(mut self) -> Result<RunSummary> {
        self.start()?;
        let exit = loop {
            if let LoopControl::Exit(reason) = self.turn()? {
                break reason;
            }
        };

        if let Some(runtime) = &self.runtime {
            tracing::debug!(
                target: logging::LOOP,
                "Loop exited after {} wakes, {} flips",
                runtime.wakes(),
                runtime.timing().total_flips()
            );
        }

        let teardown = self.teardown();
        Ok(RunSummary {
            exit,
            frames: self.engine.state.frame(),
            presents: self.engine.scheduler.presents(),
            teardown,
        })
    }

    /// Release everything acquired so far. Later calls do nothing.
    pub fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            return TeardownReport::default();
        }
        self.torn_down = true;

        if self.engine.scheduler.is_pending() {
            tracing::debug!(target: logging::LOOP, "Tearing down with a flip still pending");
        }

        let (unmapped, buffers_released) = self.engine.release_buffers();
        tracing::debug!(target: logging::POOL, "Unmapped {} staging regions", unmapped);

        let watches_closed = self.runtime.take().map(|r| r.watch_count()).unwrap_or(0);
        tracing::debug!(target: logging::LOOP, "Closed watch set ({} watches)", watches_closed);

        TeardownReport {
            unmapped,
            buffers_released,
            watches_closed,
        }
    }

    pub fn state(&self) -> &PresentationState {
        &self.engine.state
    }

    pub fn scheduler(&self) -> &FlipScheduler {
        &self.engine.scheduler
    }

    pub fn pool(&self) -> &BufferPool {
        &self.engine.pool
    }

    pub fn device(&self) -> &D {
        &self.engine.device
    }

    pub fn is_started(&self) -> bool {
        self.runtime.is_some()
    }
}

impl<D, I> Drop for Presenter<D, I>
where
    D: DisplayDevice + BufferAllocator,
    I: InputSource,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Build and run a presenter over arbitrary collaborators.
pub fn run_with<D, I>(device: D, input: I, source: SourceKind, settings: EngineSettings) -> Result<RunSummary>
where
    D: DisplayDevice + BufferAllocator,
    I: InputSource,
{
    Presenter::new(device, input, source, settings)?.run()
}

/// Read and decode an image file.
pub fn load_image(path: &Path, decoder: &dyn ImageDecoder) -> anyhow::Result<DecodedImage> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    let image = decoder
        .decode(&bytes)
        .with_context(|| format!("Failed to decode image {}", path.display()))?;
    tracing::debug!(
        target: logging::SOURCE,
        "Loaded {} ({}x{}, {} channels)",
        path.display(), image.width, image.height, image.channels
    );
    Ok(image)
}

/// Open the real collaborators described by `config` and run.
pub fn try_run(config: &PresentConfig) -> anyhow::Result<RunSummary> {
    config.validate()?;

    // Decode before touching any device.
    let source = match &config.image {
        Some(path) => SourceKind::Image(load_image(path, &ImageCrateDecoder)?),
        None => SourceKind::Animated { seed: config.seed },
    };

    let device = DrmDisplay::open(&config.device_path, config.buffer_kind)
        .with_context(|| format!("Failed to open display device {}", config.device_path.display()))?;
    let input = LibinputSource::open(&config.seat)
        .with_context(|| format!("Failed to open input on {}", config.seat))?;

    let summary = run_with(device, input, source, config.engine_settings())?;
    Ok(summary)
}

/// Process entry point: run and map the outcome to an exit status.
pub fn run(config: &PresentConfig) -> ExitCode {
    match try_run(config) {
        Ok(summary) => {
            tracing::info!(
                target: logging::MAIN,
                "Exited ({:?}) after {} frames, {} presents",
                summary.exit, summary.frames, summary.presents
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(target: logging::MAIN, "{:#}", e);
            ExitCode::FAILURE
        }
    }
}
