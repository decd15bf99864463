//! Process-wide presentation state.
//!
//! Owned by the lifecycle controller and passed by reference to the flip
//! scheduler and the pixel source. Single-threaded: no locking.

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    QuitKey(u32),
    FrameLimit(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationState {
    /// Buffer scanned out by the display
    front: usize,
    /// Buffer the CPU draws into next
    back: usize,
    buffer_count: usize,
    /// Confirmed flips so far
    frame: u64,
    exit: Option<ExitReason>,
}

impl PresentationState {
    pub fn new(buffer_count: usize) -> Self {
        Self {
            front: 0,
            back: 1 % buffer_count.max(1),
            buffer_count,
            frame: 0,
            exit: None,
        }
    }

    pub fn front(&self) -> usize {
        self.front
    }

    pub fn back(&self) -> usize {
        self.back
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Confirmed flip to `presented`; the old front becomes the back buffer.
    pub fn complete_flip(&mut self, presented: usize) {
        debug_assert!(presented < self.buffer_count);
        if presented == self.front {
            return;
        }
        self.back = self.front;
        self.front = presented;
        self.frame += 1;
    }

    /// Point the back index at another free buffer (pools larger than two).
    pub fn set_back(&mut self, index: usize) {
        debug_assert!(index != self.front && index < self.buffer_count);
        self.back = index;
    }

    pub fn request_exit(&mut self, reason: ExitReason) {
        if self.exit.is_none() {
            self.exit = Some(reason);
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    pub fn is_running(&self) -> bool {
        self.exit.is_none()
    }

    /// Front and back are distinct valid indices.
    pub fn is_consistent(&self) -> bool {
        self.front != self.back && self.front < self.buffer_count && self.back < self.buffer_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = PresentationState::new(2);
        assert_eq!(state.front(), 0);
        assert_eq!(state.back(), 1);
        assert!(state.is_running());
        assert!(state.is_consistent());
    }

    #[test]
    fn test_complete_flip_swaps_and_counts() {
        let mut state = PresentationState::new(2);
        state.complete_flip(1);
        assert_eq!((state.front(), state.back()), (1, 0));
        state.complete_flip(0);
        assert_eq!((state.front(), state.back()), (0, 1));
        assert_eq!(state.frame(), 2);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_flip_to_front_is_ignored() {
        let mut state = PresentationState::new(2);
        state.complete_flip(0);
        assert_eq!(state.frame(), 0);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_first_exit_reason_wins() {
        let mut state = PresentationState::new(2);
        state.request_exit(ExitReason::QuitKey(1));
        state.request_exit(ExitReason::FrameLimit(3));
        assert_eq!(state.exit_reason(), Some(ExitReason::QuitKey(1)));
        assert!(!state.is_running());
    }
}
