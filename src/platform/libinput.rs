//! Keyboard input through libinput.
//!
//! The context is bound to a udev seat; its fd is handed to the watch set
//! and drained with `dispatch` whenever it becomes readable.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use input::event::keyboard::{KeyState as LibinputKeyState, KeyboardEvent, KeyboardEventTrait};
use input::event::Event;
use input::{Libinput, LibinputInterface};

use crate::core::input::{KeyEvent, KeyState};
use crate::platform::api::InputSource;
use crate::util::logging;

/// Opens evdev nodes on behalf of libinput without a session manager.
struct DirectOpen;

impl LibinputInterface for DirectOpen {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        let access = flags & libc::O_ACCMODE;
        OpenOptions::new()
            .custom_flags(flags)
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .open(path)
            .map(|file| file.into())
            .map_err(|e| {
                tracing::warn!(target: logging::INPUT, "Cannot open {}: {}", path.display(), e);
                e.raw_os_error().unwrap_or(libc::EIO)
            })
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(File::from(fd));
    }
}

pub struct LibinputSource {
    context: Libinput,
    seat: String,
}

impl LibinputSource {
    pub fn open(seat: &str) -> io::Result<Self> {
        let mut context = Libinput::new_with_udev(DirectOpen);
        context
            .udev_assign_seat(seat)
            .map_err(|()| io::Error::new(io::ErrorKind::Other, format!("cannot assign seat {}", seat)))?;
        tracing::info!(target: logging::INPUT, "Reading keys from seat {}", seat);
        Ok(Self {
            context,
            seat: seat.to_string(),
        })
    }

    pub fn seat(&self) -> &str {
        &self.seat
    }
}

impl InputSource for LibinputSource {
    fn input_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the fd belongs to the libinput context and lives as long as self.
        unsafe { BorrowedFd::borrow_raw(self.context.as_raw_fd()) }
    }

    fn read_keys(&mut self) -> io::Result<Vec<KeyEvent>> {
        self.context.dispatch()?;

        let mut keys = Vec::new();
        for event in &mut self.context {
            if let Event::Keyboard(KeyboardEvent::Key(key)) = event {
                let state = match key.key_state() {
                    LibinputKeyState::Pressed => KeyState::Pressed,
                    LibinputKeyState::Released => KeyState::Released,
                };
                keys.push(KeyEvent {
                    keycode: key.key(),
                    state,
                    time_ms: key.time(),
                });
            }
        }
        Ok(keys)
    }
}
