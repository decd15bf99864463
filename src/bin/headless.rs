//! Runs the presentation engine against the software display and prints a
//! JSON summary. Useful to exercise the loop without a KMS device.
//! Run with: cargo run --bin headless -- --frames 120 --protocol page-flip

use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use kmsflip::core::lifecycle::{run_with, EngineSettings, SourceKind};
use kmsflip::core::FlipProtocol;
use kmsflip::platform::headless::{HeadlessDisplay, HeadlessOptions, ScriptedInput};
use kmsflip::util::logging;

#[derive(Debug, Parser)]
#[command(name = "headless")]
struct Cli {
    #[arg(long, default_value_t = 1920)]
    width: u32,

    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Frames to present before exiting
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// modeset, page-flip or atomic
    #[arg(long, default_value = "atomic")]
    protocol: String,

    #[arg(long, default_value_t = 2)]
    buffers: usize,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_protocol(name: &str) -> anyhow::Result<FlipProtocol> {
    match name {
        "modeset" => Ok(FlipProtocol::Modeset),
        "page-flip" => Ok(FlipProtocol::PageFlip),
        "atomic" => Ok(FlipProtocol::Atomic),
        other => anyhow::bail!("unknown protocol {}", other),
    }
}

fn run(cli: &Cli) -> anyhow::Result<serde_json::Value> {
    let protocol = parse_protocol(&cli.protocol)?;
    let display = HeadlessDisplay::new(HeadlessOptions {
        width: cli.width,
        height: cli.height,
        auto_complete: true,
        ..Default::default()
    })
    .context("Failed to create headless display")?;
    let log = display.handle();
    let input = ScriptedInput::new().context("Failed to create scripted input")?;

    let settings = EngineSettings {
        protocol,
        buffer_count: cli.buffers,
        frame_limit: Some(cli.frames),
        ..Default::default()
    };

    let started = Instant::now();
    let summary = run_with(display, input, SourceKind::Animated { seed: cli.seed }, settings)?;
    let elapsed = started.elapsed();

    Ok(serde_json::json!({
        "protocol": protocol.name(),
        "size": [cli.width, cli.height],
        "buffers": cli.buffers,
        "exit": format!("{:?}", summary.exit),
        "frames": summary.frames,
        "presents": summary.presents,
        "commits": log.commit_count(),
        "uploads": log.uploads().len(),
        "released": log.released().len(),
        "unmapped": summary.teardown.unmapped,
        "elapsedMs": elapsed.as_millis() as u64,
        "timestamp": chrono::Local::now().to_rfc3339(),
    }))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(&cli) {
        Ok(report) => {
            println!("{}", report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(target: logging::MAIN, "{:#}", e);
            ExitCode::FAILURE
        }
    }
}
