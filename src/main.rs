use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use kmsflip::prelude::{BufferKind, FlipProtocol, PresentConfig};
use kmsflip::util::logging;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    /// Blocking set-CRTC every frame
    Modeset,
    /// Legacy page flip with flip events
    PageFlip,
    /// Non-blocking atomic commits
    Atomic,
}

impl From<ProtocolArg> for FlipProtocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Modeset => FlipProtocol::Modeset,
            ProtocolArg::PageFlip => FlipProtocol::PageFlip,
            ProtocolArg::Atomic => FlipProtocol::Atomic,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BufferKindArg {
    Gbm,
    Dumb,
}

impl From<BufferKindArg> for BufferKind {
    fn from(arg: BufferKindArg) -> Self {
        match arg {
            BufferKindArg::Gbm => BufferKind::Gbm,
            BufferKindArg::Dumb => BufferKind::Dumb,
        }
    }
}

/// Double-buffered KMS presentation. ESC or Q quits.
#[derive(Debug, Parser)]
#[command(name = "kmsflip", version)]
struct Cli {
    /// Image to show instead of the color ramp; its width must match the display
    image: Option<PathBuf>,

    /// KMS device node
    #[arg(long, default_value = "/dev/dri/card0")]
    device: PathBuf,

    #[arg(long, value_enum, default_value = "atomic")]
    protocol: ProtocolArg,

    /// Number of scan-out buffers
    #[arg(long, default_value_t = 2)]
    buffers: usize,

    #[arg(long, value_enum, default_value = "gbm")]
    buffer_kind: BufferKindArg,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// libinput seat
    #[arg(long, default_value = "seat0")]
    seat: String,

    /// Seed for the color ramp
    #[arg(long)]
    seed: Option<u64>,

    /// Log everything at trace level
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> PresentConfig {
        PresentConfig {
            device_path: self.device,
            image: self.image,
            protocol: self.protocol.into(),
            buffer_kind: self.buffer_kind.into(),
            buffer_count: self.buffers,
            frame_limit: self.frames,
            seat: self.seat,
            seed: self.seed,
            ..Default::default()
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = cli.into_config();
    tracing::debug!(target: logging::MAIN, "{:?}", config);
    kmsflip::run(&config)
}
