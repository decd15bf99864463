//! Keyboard events as seen by the presentation loop.
//!
//! Key codes are Linux evdev codes (`linux/input-event-codes.h`), which is
//! what libinput reports and what the headless input writes.

/// `KEY_ESC`
pub const KEY_ESC: u32 = 1;
/// `KEY_Q`
pub const KEY_Q: u32 = 16;

/// Button/Key state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Released = 0,
    Pressed = 1,
}

impl From<u32> for KeyState {
    fn from(value: u32) -> Self {
        if value == 0 {
            KeyState::Released
        } else {
            KeyState::Pressed
        }
    }
}

/// A decoded key transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub keycode: u32,
    pub state: KeyState,
    pub time_ms: u32,
}

impl KeyEvent {
    pub fn pressed(keycode: u32) -> Self {
        Self {
            keycode,
            state: KeyState::Pressed,
            time_ms: 0,
        }
    }
}

/// The set of key codes that terminate the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuitKeys {
    codes: Vec<u32>,
}

impl QuitKeys {
    pub fn new(codes: impl Into<Vec<u32>>) -> Self {
        Self { codes: codes.into() }
    }

    /// Only presses count; a release of ESC left over from the shell must
    /// not end the run.
    pub fn matches(&self, event: &KeyEvent) -> bool {
        event.state == KeyState::Pressed && self.codes.contains(&event.keycode)
    }

    pub fn codes(&self) -> &[u32] {
        &self.codes
    }
}

impl Default for QuitKeys {
    fn default() -> Self {
        Self::new(vec![KEY_ESC, KEY_Q])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_quit_keys() {
        let keys = QuitKeys::default();
        assert!(keys.matches(&KeyEvent::pressed(KEY_ESC)));
        assert!(keys.matches(&KeyEvent::pressed(KEY_Q)));
        assert!(!keys.matches(&KeyEvent::pressed(30)));
    }

    #[test]
    fn test_release_does_not_quit() {
        let keys = QuitKeys::default();
        let release = KeyEvent {
            keycode: KEY_ESC,
            state: KeyState::Released,
            time_ms: 10,
        };
        assert!(!keys.matches(&release));
    }

    #[test]
    fn test_key_state_from_raw() {
        assert_eq!(KeyState::from(0), KeyState::Released);
        assert_eq!(KeyState::from(1), KeyState::Pressed);
        assert_eq!(KeyState::from(2), KeyState::Pressed);
    }
}
