//! End-to-end runs of the engine against the headless platform.

use crate::core::input::{KEY_ESC, KEY_Q};
use crate::core::lifecycle::{run_with, EngineSettings, Presenter, SourceKind, TeardownReport};
use crate::core::request::{KmsObject, PropertyValue};
use crate::core::runtime::LoopControl;
use crate::core::scheduler::FlipProtocol;
use crate::core::source::{ColorRamp, PixelSource, ScriptedSteps};
use crate::core::state::ExitReason;
use crate::core::{BufferHandle, CoreError};
use crate::platform::api::{DecodedImage, DisplayDevice};
use crate::platform::headless::{CommitRecord, HeadlessDisplay, HeadlessHandle, HeadlessOptions, ScriptedInput};

fn display(width: u32, height: u32, auto_complete: bool) -> (HeadlessDisplay, HeadlessHandle) {
    let display = HeadlessDisplay::new(HeadlessOptions {
        width,
        height,
        auto_complete,
        ..Default::default()
    })
    .unwrap();
    let handle = display.handle();
    (display, handle)
}

/// Ramp from black, every channel rising by one per frame.
fn rising_ramp() -> SourceKind {
    SourceKind::Custom(PixelSource::with_steps(
        ColorRamp::new(0, 0, 0),
        Box::new(ScriptedSteps::new([], 1)),
    ))
}

fn settings(protocol: FlipProtocol) -> EngineSettings {
    EngineSettings {
        protocol,
        ..Default::default()
    }
}

#[test]
fn test_three_completions_alternate_buffers() {
    let (display, log) = display(1920, 1080, false);
    let input = ScriptedInput::new().unwrap();
    let mut presenter = Presenter::new(display, input, rising_ramp(), settings(FlipProtocol::Atomic)).unwrap();

    presenter.start().unwrap();
    assert_eq!(presenter.scheduler().history(), &[1]);
    assert_eq!(log.scanout(), Some(BufferHandle(1)));

    for _ in 0..3 {
        assert_eq!(log.deliver(1).unwrap(), 1);
        assert_eq!(presenter.turn().unwrap(), LoopControl::Continue);
    }

    assert_eq!(&presenter.scheduler().history()[1..], &[0, 1, 0]);
    assert_eq!(presenter.state().frame(), 3);
    assert_eq!(presenter.state().front(), 1);
    assert!(presenter.state().is_consistent());

    // Initial scan-out, prime, then three presents.
    let first_pixels: Vec<u32> = log.uploads().iter().map(|(_, px)| *px).collect();
    assert_eq!(first_pixels.len(), 5);
    assert!(first_pixels.windows(2).all(|w| w[1] > w[0]), "{:x?}", first_pixels);
    assert_eq!(first_pixels[0], 0x0001_0101);
    // Buffer 0 (fb 1) holds the last frame drawn.
    assert_eq!(log.pixel(BufferHandle(1), 0, 0), Some(0x0005_0505));
    assert_eq!(log.pixel(BufferHandle(1), 1919, 1079), Some(0x0005_0505));
    assert_eq!(log.pixel(BufferHandle(2), 0, 0), Some(0x0004_0404));
}

#[test]
fn test_only_first_atomic_commit_after_scan_out_is_plain_flip() {
    let (display, log) = display(64, 32, false);
    let plane = display.target().plane.unwrap();
    let input = ScriptedInput::new().unwrap();
    let mut presenter = Presenter::new(display, input, rising_ramp(), settings(FlipProtocol::Atomic)).unwrap();
    presenter.start().unwrap();
    log.deliver(1).unwrap();
    presenter.turn().unwrap();

    let commits = log.commits();
    assert!(matches!(commits[0], CommitRecord::SetMode(BufferHandle(1))));
    let requests = log.atomic_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| !r.is_modeset()));
    assert_eq!(
        requests[1].find(KmsObject::Plane(plane), "FB_ID"),
        Some(PropertyValue::Framebuffer(BufferHandle(1)))
    );
}

#[test]
fn test_quit_key_exits_within_one_wake() {
    let (display, log) = display(640, 480, false);
    let input = ScriptedInput::new().unwrap();
    let mut keys = input.injector().unwrap();
    let mut presenter = Presenter::new(display, input, rising_ramp(), settings(FlipProtocol::Atomic)).unwrap();
    presenter.start().unwrap();

    keys.press(KEY_ESC).unwrap();
    assert_eq!(presenter.turn().unwrap(), LoopControl::Exit(ExitReason::QuitKey(KEY_ESC)));
    assert!(!presenter.state().is_running());

    let report = presenter.teardown();
    assert_eq!(
        report,
        TeardownReport {
            unmapped: 2,
            buffers_released: 2,
            watches_closed: 2,
        }
    );
    assert_eq!(presenter.teardown(), TeardownReport::default());
    assert!(presenter.pool().is_released());
    drop(presenter);

    assert_eq!(log.released().len(), 2);
    assert_eq!(log.double_releases(), 0);
    assert_eq!(log.live_buffers(), 0);
}

#[test]
fn test_key_release_does_not_quit() {
    let (display, log) = display(64, 32, false);
    let input = ScriptedInput::new().unwrap();
    let mut keys = input.injector().unwrap();
    let mut presenter = Presenter::new(display, input, rising_ramp(), settings(FlipProtocol::PageFlip)).unwrap();
    presenter.start().unwrap();

    keys.release(KEY_Q).unwrap();
    assert_eq!(presenter.turn().unwrap(), LoopControl::Continue);

    log.deliver(1).unwrap();
    keys.press(KEY_Q).unwrap();
    // Completion and quit in one wake: both handled before exiting.
    assert_eq!(presenter.turn().unwrap(), LoopControl::Exit(ExitReason::QuitKey(KEY_Q)));
    assert_eq!(presenter.state().frame(), 1);
}

#[test]
fn test_image_width_mismatch_is_config_error_without_commit() {
    let (display, log) = display(1920, 1080, false);
    let input = ScriptedInput::new().unwrap();
    let image = DecodedImage {
        width: 800,
        height: 600,
        channels: 4,
        pixels: vec![0; 800 * 600 * 4],
    };

    let err = Presenter::new(display, input, SourceKind::Image(image), settings(FlipProtocol::Atomic))
        .err()
        .unwrap();
    assert!(matches!(err, CoreError::Config(_)));
    assert_eq!(log.commit_count(), 0);
    assert_eq!(log.live_buffers(), 0);
}

#[test]
fn test_static_image_is_scanned_out() {
    let (display, log) = display(4, 4, false);
    let input = ScriptedInput::new().unwrap();
    let mut pixels = vec![0u8; 4 * 2 * 4];
    pixels[..4].copy_from_slice(&[0x12, 0x34, 0x56, 0xff]);
    let image = DecodedImage {
        width: 4,
        height: 2,
        channels: 4,
        pixels,
    };

    let mut presenter = Presenter::new(display, input, SourceKind::Image(image), settings(FlipProtocol::PageFlip)).unwrap();
    presenter.start().unwrap();
    log.deliver(1).unwrap();
    presenter.turn().unwrap();

    for handle in [BufferHandle(1), BufferHandle(2)] {
        assert_eq!(log.pixel(handle, 0, 0), Some(0xff12_3456));
        // Below the image stays black.
        assert_eq!(log.pixel(handle, 0, 3), Some(0));
    }
}

#[test]
fn test_rejected_commit_is_fatal_and_tears_down() {
    let (display, log) = display(64, 32, false);
    let input = ScriptedInput::new().unwrap();
    let mut presenter = Presenter::new(display, input, rising_ramp(), settings(FlipProtocol::Atomic)).unwrap();
    presenter.start().unwrap();

    log.fail_next_commit(libc::EINVAL);
    log.deliver(1).unwrap();
    let err = presenter.turn().unwrap_err();
    assert!(matches!(err, CoreError::Commit { buffer: 0, .. }));
    assert_eq!(err.os_error(), Some(libc::EINVAL));

    drop(presenter);
    assert_eq!(log.released().len(), 2);
    assert_eq!(log.double_releases(), 0);
}

#[test]
fn test_upload_failure_in_loop_is_fatal_and_tears_down() {
    let (display, log) = display(64, 32, false);
    let input = ScriptedInput::new().unwrap();
    let mut presenter = Presenter::new(display, input, rising_ramp(), settings(FlipProtocol::PageFlip)).unwrap();
    presenter.start().unwrap();
    let uploads_before = log.uploads().len();

    log.fail_next_upload(libc::EFAULT);
    log.deliver(1).unwrap();
    let err = presenter.turn().unwrap_err();
    assert!(matches!(err, CoreError::Map { index: 0, .. }), "{:?}", err);
    assert_eq!(err.os_error(), Some(libc::EFAULT));
    // Nothing reached the display after the failed upload.
    assert_eq!(log.commit_count(), 2);
    assert_eq!(log.uploads().len(), uploads_before);
    assert!(!presenter.pool().is_in_flight(0));

    let report = presenter.teardown();
    assert_eq!(report.buffers_released, 2);
    assert_eq!(report.unmapped, 2);
    drop(presenter);
    assert_eq!(log.released().len(), 2);
    assert_eq!(log.double_releases(), 0);
    assert_eq!(log.live_buffers(), 0);
}

#[test]
fn test_single_buffer_is_rejected_before_allocation() {
    let (display, log) = display(64, 32, false);
    let input = ScriptedInput::new().unwrap();
    let settings = EngineSettings {
        buffer_count: 1,
        ..Default::default()
    };
    let err = Presenter::new(display, input, rising_ramp(), settings).err().unwrap();
    assert!(err.is_config());
    assert_eq!(log.live_buffers(), 0);
}

#[test]
fn test_turn_before_start_fails() {
    let (display, _log) = display(64, 32, false);
    let input = ScriptedInput::new().unwrap();
    let mut presenter = Presenter::new(display, input, rising_ramp(), settings(FlipProtocol::Atomic)).unwrap();
    assert!(presenter.turn().is_err());
    assert!(!presenter.is_started());
}

#[test]
fn test_run_stops_at_frame_limit() {
    let (display, log) = display(320, 240, true);
    let input = ScriptedInput::new().unwrap();
    let settings = EngineSettings {
        protocol: FlipProtocol::Atomic,
        frame_limit: Some(10),
        ..Default::default()
    };

    let summary = run_with(display, input, SourceKind::Animated { seed: Some(7) }, settings).unwrap();
    assert_eq!(summary.exit, ExitReason::FrameLimit(10));
    assert_eq!(summary.frames, 10);
    assert_eq!(summary.presents, 10);
    assert_eq!(summary.teardown.unmapped, 2);
    // Initial set-CRTC plus one atomic commit per present.
    assert_eq!(log.commit_count(), 11);
    assert_eq!(log.live_buffers(), 0);
}

#[test]
fn test_modeset_protocol_runs_synchronously() {
    let (display, log) = display(64, 32, false);
    let input = ScriptedInput::new().unwrap();
    let settings = EngineSettings {
        protocol: FlipProtocol::Modeset,
        frame_limit: Some(5),
        ..Default::default()
    };

    let summary = run_with(display, input, rising_ramp(), settings).unwrap();
    assert_eq!(summary.exit, ExitReason::FrameLimit(5));
    assert_eq!(summary.frames, 5);
    assert_eq!(summary.presents, 5);

    let commits = log.commits();
    assert_eq!(commits.len(), 6);
    assert!(commits.iter().all(|c| matches!(c, CommitRecord::SetMode(_))));
    let handles: Vec<u32> = commits.iter().map(|c| c.handle().0).collect();
    assert_eq!(handles, vec![1, 2, 1, 2, 1, 2]);
}

#[test]
fn test_page_flip_run_alternates() {
    let (display, log) = display(64, 32, true);
    let input = ScriptedInput::new().unwrap();
    let settings = EngineSettings {
        protocol: FlipProtocol::PageFlip,
        frame_limit: Some(4),
        ..Default::default()
    };

    run_with(display, input, rising_ramp(), settings).unwrap();
    let flips: Vec<u32> = log
        .commits()
        .iter()
        .filter(|c| matches!(c, CommitRecord::PageFlip(_)))
        .map(|c| c.handle().0)
        .collect();
    assert_eq!(flips, vec![2, 1, 2, 1]);
}
