//! Flip scheduling.
//!
//! The scheduler draws into a free buffer, hands it to the display, and
//! tracks ownership until the kernel confirms the flip:
//!
//! ```text
//! IDLE --present--> PENDING{buffer} --completion--> IDLE (front/back swap)
//! ```
//!
//! A pool buffer is marked in flight from the moment it is committed until
//! it stops being the front buffer, so the CPU only ever writes buffers the
//! display does not own.

use crate::core::buffer::{BufferHandle, BufferPool};
use crate::core::errors::{CoreError, Result};
use crate::core::request::FrameRequest;
use crate::core::source::PixelSource;
use crate::core::state::PresentationState;
use crate::platform::api::{BufferAllocator, DisplayDevice, FlipEvent};
use crate::util::logging;

/// How buffers reach the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlipProtocol {
    /// Blocking set-CRTC per frame, no completion events
    Modeset,
    /// Legacy page flip with a flip event
    PageFlip,
    /// Non-blocking atomic commit with a flip event
    #[default]
    Atomic,
}

impl FlipProtocol {
    /// Ownership transfer is confirmed later by a completion event.
    pub fn is_async(self) -> bool {
        !matches!(self, FlipProtocol::Modeset)
    }

    pub fn name(self) -> &'static str {
        match self {
            FlipProtocol::Modeset => "modeset",
            FlipProtocol::PageFlip => "page-flip",
            FlipProtocol::Atomic => "atomic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipPhase {
    Idle,
    Pending { buffer: usize },
}

#[derive(Debug)]
pub struct FlipScheduler {
    protocol: FlipProtocol,
    phase: FlipPhase,
    /// The next atomic commit must carry the mode
    needs_modeset: bool,
    presents: u64,
    history: Vec<usize>,
}

impl FlipScheduler {
    pub fn new(protocol: FlipProtocol) -> Self {
        Self {
            protocol,
            phase: FlipPhase::Idle,
            needs_modeset: true,
            presents: 0,
            history: Vec::new(),
        }
    }

    pub fn protocol(&self) -> FlipProtocol {
        self.protocol
    }

    pub fn phase(&self) -> FlipPhase {
        self.phase
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.phase, FlipPhase::Pending { .. })
    }

    /// Number of commits issued, initial scan-out excluded.
    pub fn presents(&self) -> u64 {
        self.presents
    }

    /// Pool indices of every commit issued, in order.
    pub fn history(&self) -> &[usize] {
        &self.history
    }

    /// Fill the front buffer and scan it out with a blocking set-CRTC.
    ///
    /// Runs once before the first `present` so that the front index refers to
    /// a buffer the display really shows.
    pub fn scan_out_initial<D>(
        &mut self,
        device: &mut D,
        pool: &mut BufferPool,
        source: &mut PixelSource,
        state: &PresentationState,
    ) -> Result<()>
    where
        D: DisplayDevice + BufferAllocator,
    {
        let front = state.front();
        self.render(device, pool, source, state, front)?;

        let handle = Self::handle(pool, front)?;
        pool.mark_in_flight(front)?;
        if let Err(source) = device.set_mode(handle) {
            pool.mark_idle(front);
            return Err(CoreError::Commit { buffer: front, source });
        }

        // Legacy set-CRTC already programmed the mode.
        self.needs_modeset = false;
        tracing::debug!(target: logging::SCHED, "Initial scan-out of buffer {}", front);
        Ok(())
    }

    /// Draw the next frame into a free buffer and present it.
    pub fn present_next<D>(
        &mut self,
        device: &mut D,
        pool: &mut BufferPool,
        source: &mut PixelSource,
        state: &mut PresentationState,
    ) -> Result<usize>
    where
        D: DisplayDevice + BufferAllocator,
    {
        if let FlipPhase::Pending { buffer } = self.phase {
            return Err(CoreError::BufferBusy(buffer));
        }

        let index = self.select_back(pool, state)?;
        self.render(device, pool, source, state, index)?;
        self.present(device, pool, state, index)?;
        Ok(index)
    }

    /// Commit `index` to the display.
    ///
    /// The buffer must be free. Rejected commits are returned as
    /// [`CoreError::Commit`] with the kernel's error and the buffer is left
    /// free again.
    pub fn present<D>(
        &mut self,
        device: &mut D,
        pool: &mut BufferPool,
        state: &mut PresentationState,
        index: usize,
    ) -> Result<()>
    where
        D: DisplayDevice,
    {
        if let FlipPhase::Pending { buffer } = self.phase {
            return Err(CoreError::BufferBusy(buffer));
        }
        if index == state.front() {
            return Err(CoreError::BufferBusy(index));
        }

        let handle = Self::handle(pool, index)?;
        pool.mark_in_flight(index)?;

        let committed = match self.protocol {
            FlipProtocol::Modeset => device.set_mode(handle),
            FlipProtocol::PageFlip => device.page_flip(handle),
            FlipProtocol::Atomic => {
                let request = FrameRequest::atomic(index, handle, device.target(), self.needs_modeset);
                device.atomic_commit(&request)
            }
        };

        if let Err(source) = committed {
            pool.mark_idle(index);
            tracing::error!(target: logging::SCHED, "Commit of buffer {} rejected: {}", index, source);
            return Err(CoreError::Commit { buffer: index, source });
        }

        self.needs_modeset = false;
        self.presents += 1;
        self.history.push(index);

        if self.protocol.is_async() {
            self.phase = FlipPhase::Pending { buffer: index };
            tracing::trace!(target: logging::SCHED, "Buffer {} pending", index);
        } else {
            // set-CRTC returned: the flip is already on screen.
            self.swap(pool, state, index);
        }
        Ok(())
    }

    /// Handle a completion event. Returns the new front buffer, or `None` for
    /// an event with nothing pending.
    pub fn complete(
        &mut self,
        pool: &mut BufferPool,
        state: &mut PresentationState,
        event: &FlipEvent,
    ) -> Option<usize> {
        match self.phase {
            FlipPhase::Idle => {
                tracing::warn!(
                    target: logging::SCHED,
                    "Completion seq={} crtc={} with no flip pending",
                    event.sequence, event.target
                );
                None
            }
            FlipPhase::Pending { buffer } => {
                self.phase = FlipPhase::Idle;
                self.swap(pool, state, buffer);
                tracing::trace!(
                    target: logging::SCHED,
                    "Flip to buffer {} done seq={} t={:?}",
                    buffer, event.sequence, event.timestamp
                );
                Some(buffer)
            }
        }
    }

    fn swap(&mut self, pool: &mut BufferPool, state: &mut PresentationState, presented: usize) {
        let old_front = state.front();
        state.complete_flip(presented);
        pool.mark_idle(old_front);
    }

    fn select_back(&self, pool: &BufferPool, state: &mut PresentationState) -> Result<usize> {
        let back = state.back();
        if !pool.is_in_flight(back) && back != state.front() {
            return Ok(back);
        }
        match pool.next_free(state.front()) {
            Some(index) => {
                state.set_back(index);
                Ok(index)
            }
            None => Err(CoreError::BufferBusy(back)),
        }
    }

    fn render<D>(
        &self,
        device: &mut D,
        pool: &mut BufferPool,
        source: &mut PixelSource,
        state: &PresentationState,
        index: usize,
    ) -> Result<()>
    where
        D: BufferAllocator,
    {
        let (width, height, pitch) = (pool.width(), pool.height(), pool.pitch());
        let region = pool.staging_mut(index)?;
        source.next(state, region, width, height, pitch)?;
        pool.upload(device, index)
    }

    fn handle(pool: &BufferPool, index: usize) -> Result<BufferHandle> {
        pool.handle(index).ok_or_else(|| {
            CoreError::Device(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no buffer at index {}", index),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::{BufferUsage, PixelFormat};
    use crate::core::request::{KmsObject, PropertyValue};
    use crate::core::source::{ColorRamp, ScriptedSteps};
    use crate::platform::headless::{HeadlessDisplay, HeadlessOptions};
    use proptest::prelude::*;
    use std::time::Duration;

    fn setup(protocol: FlipProtocol, count: usize) -> (HeadlessDisplay, BufferPool, PixelSource, PresentationState, FlipScheduler) {
        let mut device = HeadlessDisplay::new(HeadlessOptions {
            width: 16,
            height: 8,
            ..Default::default()
        })
        .unwrap();
        let pool = BufferPool::allocate(&mut device, count, 16, 8, PixelFormat::Xrgb8888, BufferUsage::SCANOUT | BufferUsage::WRITE).unwrap();
        let source = PixelSource::with_steps(ColorRamp::new(100, 100, 100), Box::new(ScriptedSteps::new([], 1)));
        (device, pool, source, PresentationState::new(count), FlipScheduler::new(protocol))
    }

    fn event(seq: u32) -> FlipEvent {
        FlipEvent {
            sequence: seq,
            timestamp: Duration::from_millis(16 * seq as u64),
            target: 1,
        }
    }

    #[test]
    fn test_async_present_waits_for_completion() {
        let (mut dev, mut pool, mut src, mut state, mut sched) = setup(FlipProtocol::Atomic, 2);
        sched.scan_out_initial(&mut dev, &mut pool, &mut src, &state).unwrap();
        assert!(pool.is_in_flight(0));

        assert_eq!(sched.present_next(&mut dev, &mut pool, &mut src, &mut state).unwrap(), 1);
        assert_eq!(sched.phase(), FlipPhase::Pending { buffer: 1 });
        assert_eq!(pool.in_flight_count(), 2);

        // Second present before completion is refused
        assert!(matches!(
            sched.present_next(&mut dev, &mut pool, &mut src, &mut state),
            Err(CoreError::BufferBusy(1))
        ));

        assert_eq!(sched.complete(&mut pool, &mut state, &event(1)), Some(1));
        assert_eq!((state.front(), state.back()), (1, 0));
        assert!(!pool.is_in_flight(0));
        assert!(pool.is_in_flight(1));
    }

    #[test]
    fn test_first_atomic_commit_only_after_initial_scan_out_skips_modeset() {
        let (mut dev, mut pool, mut src, mut state, mut sched) = setup(FlipProtocol::Atomic, 2);
        sched.scan_out_initial(&mut dev, &mut pool, &mut src, &state).unwrap();
        sched.present_next(&mut dev, &mut pool, &mut src, &mut state).unwrap();

        let log = dev.handle();
        let requests = log.atomic_requests();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].is_modeset());
        let plane = KmsObject::Plane(dev.target().plane.unwrap());
        assert_eq!(
            requests[0].find(plane, "FB_ID"),
            Some(PropertyValue::Framebuffer(pool.handle(1).unwrap()))
        );
    }

    #[test]
    fn test_atomic_without_initial_scan_out_requests_modeset() {
        let (mut dev, mut pool, mut src, mut state, mut sched) = setup(FlipProtocol::Atomic, 2);
        pool.mark_in_flight(0).unwrap();
        sched.present_next(&mut dev, &mut pool, &mut src, &mut state).unwrap();
        assert!(dev.handle().atomic_requests()[0].is_modeset());
    }

    #[test]
    fn test_modeset_protocol_swaps_immediately() {
        let (mut dev, mut pool, mut src, mut state, mut sched) = setup(FlipProtocol::Modeset, 2);
        sched.scan_out_initial(&mut dev, &mut pool, &mut src, &state).unwrap();
        for expected in [1, 0, 1] {
            assert_eq!(sched.present_next(&mut dev, &mut pool, &mut src, &mut state).unwrap(), expected);
            assert_eq!(sched.phase(), FlipPhase::Idle);
            assert_eq!(state.front(), expected);
            assert_eq!(pool.in_flight_count(), 1);
        }
        assert_eq!(state.frame(), 3);
    }

    #[test]
    fn test_rejected_commit_is_fatal_and_frees_buffer() {
        let (mut dev, mut pool, mut src, mut state, mut sched) = setup(FlipProtocol::PageFlip, 2);
        sched.scan_out_initial(&mut dev, &mut pool, &mut src, &state).unwrap();
        dev.handle().fail_next_commit(libc::EBUSY);

        let err = sched.present_next(&mut dev, &mut pool, &mut src, &mut state).unwrap_err();
        assert!(matches!(err, CoreError::Commit { buffer: 1, .. }));
        assert_eq!(err.os_error(), Some(libc::EBUSY));
        assert!(!pool.is_in_flight(1));
        assert_eq!(sched.phase(), FlipPhase::Idle);
    }

    #[test]
    fn test_stray_completion_is_ignored() {
        let (_dev, mut pool, _src, mut state, mut sched) = setup(FlipProtocol::PageFlip, 2);
        assert_eq!(sched.complete(&mut pool, &mut state, &event(9)), None);
        assert_eq!(state.frame(), 0);
    }

    #[test]
    fn test_three_buffers_rotate_through_free_set() {
        let (mut dev, mut pool, mut src, mut state, mut sched) = setup(FlipProtocol::PageFlip, 3);
        sched.scan_out_initial(&mut dev, &mut pool, &mut src, &state).unwrap();
        for seq in 1..=6 {
            let presented = sched.present_next(&mut dev, &mut pool, &mut src, &mut state).unwrap();
            assert_ne!(presented, state.front());
            sched.complete(&mut pool, &mut state, &event(seq));
            assert!(state.is_consistent());
            assert_eq!(pool.in_flight_count(), 1);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any interleaving of present attempts and completions keeps the
        /// ownership rules: one pending flip at most, front never written,
        /// front/back a permutation of {0, 1}.
        #[test]
        fn prop_buffer_exclusivity(ops in proptest::collection::vec(any::<bool>(), 1..60)) {
            let (mut dev, mut pool, mut src, mut state, mut sched) = setup(FlipProtocol::Atomic, 2);
            sched.scan_out_initial(&mut dev, &mut pool, &mut src, &state).unwrap();
            let mut seq = 0;

            for present in ops {
                if present {
                    let was_pending = sched.is_pending();
                    let result = sched.present_next(&mut dev, &mut pool, &mut src, &mut state);
                    prop_assert_eq!(result.is_err(), was_pending);
                } else {
                    seq += 1;
                    sched.complete(&mut pool, &mut state, &event(seq));
                }
                prop_assert!(state.is_consistent());
                prop_assert!(pool.is_in_flight(state.front()));
                prop_assert!(pool.in_flight_count() <= 2);
                let mut pair = [state.front(), state.back()];
                pair.sort();
                prop_assert_eq!(pair, [0, 1]);
            }
        }
    }
}
