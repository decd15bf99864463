//! Runtime and event loop integration.
//!
//! This module provides the readiness loop of the presentation engine.
//! It handles:
//! - the watch set over the display completion fd and the input fd
//! - draining flip completions and re-arming the next present
//! - draining key events and raising the termination flag
//! - frame statistics from kernel completion timestamps
//!
//! The loop is single-threaded. The only suspension point is
//! [`WatchSet::wait`]; cancellation happens through the termination flag in
//! [`PresentationState`](crate::core::state::PresentationState), observed
//! after every wake.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::core::errors::{CoreError, Result};
use crate::core::input::QuitKeys;
use crate::core::lifecycle::PresentEngine;
use crate::core::state::ExitReason;
use crate::platform::api::{BufferAllocator, DisplayDevice, FlipEvent, InputSource};
use crate::util::logging;

// ============================================================================
// Watch Set
// ============================================================================

/// Which registered descriptor became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchToken {
    Display = 1,
    Input = 2,
}

impl WatchToken {
    fn from_data(data: u64) -> Option<Self> {
        match data {
            1 => Some(WatchToken::Display),
            2 => Some(WatchToken::Input),
            _ => None,
        }
    }
}

/// Result of one readiness wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub display: bool,
    pub input: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.display || self.input
    }
}

/// Epoll instance with readable interest on the display and input fds.
///
/// Created once at loop entry; dropping it closes the epoll descriptor.
#[derive(Debug)]
pub struct WatchSet {
    epoll: OwnedFd,
    registered: usize,
}

impl WatchSet {
    pub fn new() -> Result<Self> {
        // SAFETY: plain syscall, the returned fd is checked before use.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(CoreError::Watch(io::Error::last_os_error()));
        }
        // SAFETY: fd is a freshly created descriptor owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epoll, registered: 0 })
    }

    pub fn add(&mut self, fd: BorrowedFd<'_>, token: WatchToken) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token as u64,
        };
        // SAFETY: both fds are open for the duration of the call and event is a valid pointer.
        let rc = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd.as_raw_fd(), &mut event)
        };
        if rc < 0 {
            return Err(CoreError::Watch(io::Error::last_os_error()));
        }
        self.registered += 1;
        tracing::debug!(target: logging::LOOP, "Watching fd {} as {:?}", fd.as_raw_fd(), token);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registered
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    /// Block until at least one watch is readable.
    ///
    /// `None` waits forever. Interrupted waits are retried.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Readiness> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        };
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];

        let count = loop {
            // SAFETY: events is a valid buffer of the advertised length.
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                tracing::trace!(target: logging::LOOP, "Wait interrupted, retrying");
                continue;
            }
            return Err(CoreError::IoWait(err));
        };

        let mut ready = Readiness::default();
        for event in &events[..count] {
            // epoll_event is packed on some targets; copy the field out.
            let data = event.u64;
            match WatchToken::from_data(data) {
                Some(WatchToken::Display) => ready.display = true,
                Some(WatchToken::Input) => ready.input = true,
                None => tracing::warn!(target: logging::LOOP, "Unknown watch token {}", data),
            }
        }
        Ok(ready)
    }
}

// ============================================================================
// Frame Timing
// ============================================================================

/// Flip statistics computed from kernel completion timestamps.
#[derive(Debug, Clone, Default)]
pub struct FrameTiming {
    window_start: Option<Duration>,
    window_flips: u64,
    last_sequence: Option<u32>,
    total_flips: u64,
    missed_vblanks: u64,
    current_fps: f64,
}

impl FrameTiming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed flip. Returns the flip rate once per second of
    /// kernel time.
    pub fn record(&mut self, event: &FlipEvent) -> Option<f64> {
        self.total_flips += 1;

        if let Some(last) = self.last_sequence {
            let gap = event.sequence.wrapping_sub(last);
            if gap > 1 {
                self.missed_vblanks += u64::from(gap - 1);
            }
        }
        self.last_sequence = Some(event.sequence);

        let start = *self.window_start.get_or_insert(event.timestamp);
        self.window_flips += 1;

        let elapsed = event.timestamp.saturating_sub(start);
        if elapsed >= Duration::from_secs(1) {
            // The flip that opened the window is not part of the interval.
            self.current_fps = (self.window_flips - 1) as f64 / elapsed.as_secs_f64();
            self.window_start = Some(event.timestamp);
            self.window_flips = 1;
            return Some(self.current_fps);
        }
        None
    }

    pub fn fps(&self) -> f64 {
        self.current_fps
    }

    pub fn total_flips(&self) -> u64 {
        self.total_flips
    }

    /// Vblanks skipped between consecutive completions.
    pub fn missed_vblanks(&self) -> u64 {
        self.missed_vblanks
    }
}

// ============================================================================
// Main Runtime
// ============================================================================

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit(ExitReason),
}

/// The presentation runtime.
///
/// Each [`turn`](Runtime::turn) is one wake of the multiplexer: wait, then
/// drain display completions, then drain input, then check the flag.
#[derive(Debug)]
pub struct Runtime {
    watch: WatchSet,
    timing: FrameTiming,
    quit_keys: QuitKeys,
    frame_limit: Option<u64>,
    wakes: u64,
}

impl Runtime {
    pub fn new(watch: WatchSet, quit_keys: QuitKeys, frame_limit: Option<u64>) -> Self {
        Self {
            watch,
            timing: FrameTiming::new(),
            quit_keys,
            frame_limit,
            wakes: 0,
        }
    }

    pub fn timing(&self) -> &FrameTiming {
        &self.timing
    }

    pub fn wakes(&self) -> u64 {
        self.wakes
    }

    pub fn watch_count(&self) -> usize {
        self.watch.len()
    }

    /// Run one wake cycle.
    pub fn turn<D, I>(&mut self, engine: &mut PresentEngine<D, I>) -> Result<LoopControl>
    where
        D: DisplayDevice + BufferAllocator,
        I: InputSource,
    {
        let synchronous = !engine.scheduler.protocol().is_async();
        // The synchronous protocol presents from the loop itself, so it
        // only peeks at the fds.
        let timeout = if synchronous { Some(Duration::ZERO) } else { None };

        let ready = self.watch.wait(timeout)?;
        self.wakes += 1;

        if ready.display {
            self.drain_display(engine)?;
        }
        if ready.input {
            self.drain_input(engine)?;
        }
        if synchronous {
            self.advance(engine)?;
        }

        match engine.state.exit_reason() {
            Some(reason) => Ok(LoopControl::Exit(reason)),
            None => Ok(LoopControl::Continue),
        }
    }

    fn drain_display<D, I>(&mut self, engine: &mut PresentEngine<D, I>) -> Result<()>
    where
        D: DisplayDevice + BufferAllocator,
        I: InputSource,
    {
        let events = engine.device.read_events().map_err(CoreError::Device)?;
        for event in &events {
            if engine.scheduler.complete(&mut engine.pool, &mut engine.state, event).is_none() {
                continue;
            }
            if let Some(fps) = self.timing.record(event) {
                tracing::debug!(
                    target: logging::LOOP,
                    "{:.1} flips/s, {} frames, {} missed vblanks",
                    fps, engine.state.frame(), self.timing.missed_vblanks()
                );
            }
            self.advance(engine)?;
        }
        Ok(())
    }

    fn drain_input<D, I>(&mut self, engine: &mut PresentEngine<D, I>) -> Result<()>
    where
        D: DisplayDevice + BufferAllocator,
        I: InputSource,
    {
        let keys = engine.input.read_keys().map_err(CoreError::Input)?;
        for key in keys {
            tracing::trace!(target: logging::INPUT, "key {} {:?}", key.keycode, key.state);
            if self.quit_keys.matches(&key) {
                tracing::info!(target: logging::INPUT, "Quit key {} pressed", key.keycode);
                engine.state.request_exit(ExitReason::QuitKey(key.keycode));
            }
        }
        Ok(())
    }

    /// Present the next frame unless the run is over.
    fn advance<D, I>(&mut self, engine: &mut PresentEngine<D, I>) -> Result<()>
    where
        D: DisplayDevice + BufferAllocator,
        I: InputSource,
    {
        if !engine.state.is_running() {
            return Ok(());
        }
        if let Some(limit) = self.frame_limit {
            if engine.state.frame() >= limit {
                tracing::info!(target: logging::LOOP, "Frame limit {} reached", limit);
                engine.state.request_exit(ExitReason::FrameLimit(limit));
                return Ok(());
            }
        }
        engine.present_next().map(|_| ())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn flip(sequence: u32, ms: u64) -> FlipEvent {
        FlipEvent {
            sequence,
            timestamp: Duration::from_millis(ms),
            target: 1,
        }
    }

    #[test]
    fn test_frame_timing_reports_once_per_second() {
        let mut timing = FrameTiming::new();
        let mut reports = Vec::new();
        for i in 0..=120u32 {
            if let Some(fps) = timing.record(&flip(i, u64::from(i) * 1000 / 60)) {
                reports.push(fps);
            }
        }
        assert_eq!(reports.len(), 2);
        assert!((reports[0] - 60.0).abs() < 0.5, "fps {}", reports[0]);
        assert_eq!(timing.total_flips(), 121);
        assert_eq!(timing.missed_vblanks(), 0);
    }

    #[test]
    fn test_frame_timing_counts_missed_vblanks() {
        let mut timing = FrameTiming::new();
        timing.record(&flip(10, 0));
        timing.record(&flip(11, 16));
        timing.record(&flip(14, 66));
        assert_eq!(timing.missed_vblanks(), 2);
    }

    #[test]
    fn test_watch_set_reports_readable_fd() {
        let (display_rx, mut display_tx) = UnixStream::pair().unwrap();
        let (input_rx, _input_tx) = UnixStream::pair().unwrap();

        let mut watch = WatchSet::new().unwrap();
        watch.add(display_rx.as_fd(), WatchToken::Display).unwrap();
        watch.add(input_rx.as_fd(), WatchToken::Input).unwrap();
        assert_eq!(watch.len(), 2);

        let idle = watch.wait(Some(Duration::ZERO)).unwrap();
        assert!(!idle.any());

        display_tx.write_all(&[1]).unwrap();
        let ready = watch.wait(None).unwrap();
        assert_eq!(ready, Readiness { display: true, input: false });
    }

    #[test]
    fn test_duplicate_watch_is_rejected() {
        let (rx, _tx) = UnixStream::pair().unwrap();
        let mut watch = WatchSet::new().unwrap();
        watch.add(rx.as_fd(), WatchToken::Display).unwrap();
        let err = watch.add(rx.as_fd(), WatchToken::Input).unwrap_err();
        assert!(matches!(err, CoreError::Watch(_)));
        assert_eq!(err.os_error(), Some(libc::EEXIST));
    }

    static SIGNALS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_signal(_: libc::c_int) {
        SIGNALS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_wait_survives_signal_interruption() {
        // No SA_RESTART: epoll_wait returns EINTR when the handler runs.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = count_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
        }

        let (rx, mut tx) = UnixStream::pair().unwrap();
        let mut watch = WatchSet::new().unwrap();
        watch.add(rx.as_fd(), WatchToken::Input).unwrap();

        let waiter = unsafe { libc::pthread_self() };
        let before = SIGNALS.load(Ordering::SeqCst);
        let poker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            unsafe { libc::pthread_kill(waiter, libc::SIGUSR1) };
            thread::sleep(Duration::from_millis(50));
            tx.write_all(&[1]).unwrap();
            tx
        });

        let ready = watch.wait(None).unwrap();
        let _tx = poker.join().unwrap();
        assert_eq!(ready, Readiness { display: false, input: true });
        assert!(SIGNALS.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn test_wait_on_non_epoll_fd_is_io_wait_error() {
        let (rx, _tx) = UnixStream::pair().unwrap();
        let watch = WatchSet {
            epoll: OwnedFd::from(rx),
            registered: 0,
        };
        let err = watch.wait(Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, CoreError::IoWait(_)), "{:?}", err);
        assert_eq!(err.os_error(), Some(libc::EINVAL));
    }
}
