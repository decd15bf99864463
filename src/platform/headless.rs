//! Headless display and input.
//!
//! A software stand-in for the KMS device and the keyboard that still goes
//! through real file descriptors, so the readiness loop, the watch set and
//! the drain logic run unmodified:
//!
//! - the completion fd is one end of a socketpair; each delivered flip
//!   writes one byte to the other end
//! - the input fd is one end of a second socketpair; each key is an 8-byte
//!   `keycode, state` record
//!
//! Commits, uploads and releases are recorded in a shared log reachable
//! through [`HeadlessHandle`] after the display has been moved into the
//! engine.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use crate::core::buffer::{AllocatedBuffer, BufferDesc, BufferHandle};
use crate::core::input::{KeyEvent, KeyState};
use crate::core::request::FrameRequest;
use crate::platform::api::{BufferAllocator, DisplayDevice, FlipEvent, InputSource, OutputTarget};
use crate::util::logging;

#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    /// Expose a primary plane for atomic requests
    pub plane: bool,
    /// Deliver each flip completion as soon as it is committed
    pub auto_complete: bool,
    /// Row pitch alignment in bytes
    pub pitch_align: u32,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh: 60,
            plane: true,
            auto_complete: false,
            pitch_align: 64,
        }
    }
}

/// A commit as the headless display saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRecord {
    SetMode(BufferHandle),
    PageFlip(BufferHandle),
    Atomic(FrameRequest),
}

impl CommitRecord {
    pub fn handle(&self) -> BufferHandle {
        match self {
            CommitRecord::SetMode(h) | CommitRecord::PageFlip(h) => *h,
            CommitRecord::Atomic(req) => req.handle,
        }
    }
}

#[derive(Debug)]
struct Shared {
    options: HeadlessOptions,
    crtc: u32,
    writer: UnixStream,
    next_handle: u32,
    live: BTreeMap<u32, Vec<u8>>,
    released: Vec<BufferHandle>,
    double_releases: usize,
    commits: Vec<CommitRecord>,
    /// Committed flips not yet signalled on the fd
    awaiting: usize,
    /// Completion timestamps and sequence
    sequence: u32,
    scanout: Option<BufferHandle>,
    /// First pixel of every upload, in order
    uploads: Vec<(BufferHandle, u32)>,
    fail_next: Option<i32>,
    fail_next_upload: Option<i32>,
}

impl Shared {
    fn signal(&mut self, count: usize) -> io::Result<usize> {
        let count = count.min(self.awaiting);
        if count > 0 {
            self.writer.write_all(&vec![1u8; count])?;
            self.awaiting -= count;
        }
        Ok(count)
    }

    fn take_failure(&mut self) -> io::Result<()> {
        match self.fail_next.take() {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn queue_flip(&mut self, record: CommitRecord) -> io::Result<()> {
        self.commits.push(record);
        self.awaiting += 1;
        if self.options.auto_complete {
            self.signal(1)?;
        }
        Ok(())
    }
}

/// Shared view of a [`HeadlessDisplay`]'s log and completion control.
#[derive(Debug, Clone)]
pub struct HeadlessHandle(Rc<RefCell<Shared>>);

impl HeadlessHandle {
    /// Signal up to `count` pending flip completions. Returns how many were sent.
    pub fn deliver(&self, count: usize) -> io::Result<usize> {
        self.0.borrow_mut().signal(count)
    }

    pub fn deliver_all(&self) -> io::Result<usize> {
        self.deliver(usize::MAX)
    }

    /// Flips committed but not yet signalled.
    pub fn awaiting(&self) -> usize {
        self.0.borrow().awaiting
    }

    /// Make the next commit fail with `errno`.
    pub fn fail_next_commit(&self, errno: i32) {
        self.0.borrow_mut().fail_next = Some(errno);
    }

    /// Make the next upload fail with `errno`.
    pub fn fail_next_upload(&self, errno: i32) {
        self.0.borrow_mut().fail_next_upload = Some(errno);
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.0.borrow().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.0.borrow().commits.len()
    }

    pub fn atomic_requests(&self) -> Vec<FrameRequest> {
        self.0
            .borrow()
            .commits
            .iter()
            .filter_map(|c| match c {
                CommitRecord::Atomic(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<(BufferHandle, u32)> {
        self.0.borrow().uploads.clone()
    }

    pub fn released(&self) -> Vec<BufferHandle> {
        self.0.borrow().released.clone()
    }

    pub fn double_releases(&self) -> usize {
        self.0.borrow().double_releases
    }

    pub fn live_buffers(&self) -> usize {
        self.0.borrow().live.len()
    }

    /// Buffer currently scanned out.
    pub fn scanout(&self) -> Option<BufferHandle> {
        self.0.borrow().scanout
    }

    /// 32-bit pixel at (x, y) of a live device buffer.
    pub fn pixel(&self, handle: BufferHandle, x: u32, y: u32) -> Option<u32> {
        let shared = self.0.borrow();
        let pitch = padded_pitch(&shared.options) as usize;
        let data = shared.live.get(&handle.0)?;
        let offset = y as usize * pitch + x as usize * 4;
        let bytes = data.get(offset..offset + 4)?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

fn padded_pitch(options: &HeadlessOptions) -> u32 {
    let row = options.width * 4;
    let align = options.pitch_align.max(1);
    row.div_ceil(align) * align
}

/// Software KMS device.
#[derive(Debug)]
pub struct HeadlessDisplay {
    target: OutputTarget,
    reader: UnixStream,
    shared: HeadlessHandle,
}

impl HeadlessDisplay {
    pub fn new(options: HeadlessOptions) -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;

        let target = OutputTarget {
            width: options.width,
            height: options.height,
            refresh: options.refresh,
            connector: 31,
            crtc: 41,
            plane: options.plane.then_some(51),
            name: "HEADLESS-1".to_string(),
        };

        let shared = Shared {
            crtc: target.crtc,
            options,
            writer,
            next_handle: 0,
            live: BTreeMap::new(),
            released: Vec::new(),
            double_releases: 0,
            commits: Vec::new(),
            awaiting: 0,
            sequence: 0,
            scanout: None,
            uploads: Vec::new(),
            fail_next: None,
            fail_next_upload: None,
        };

        Ok(Self {
            target,
            reader,
            shared: HeadlessHandle(Rc::new(RefCell::new(shared))),
        })
    }

    pub fn handle(&self) -> HeadlessHandle {
        self.shared.clone()
    }
}

impl DisplayDevice for HeadlessDisplay {
    fn completion_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    fn target(&self) -> &OutputTarget {
        &self.target
    }

    fn set_mode(&mut self, buffer: BufferHandle) -> io::Result<()> {
        let mut shared = self.shared.0.borrow_mut();
        shared.take_failure()?;
        shared.commits.push(CommitRecord::SetMode(buffer));
        shared.scanout = Some(buffer);
        Ok(())
    }

    fn page_flip(&mut self, buffer: BufferHandle) -> io::Result<()> {
        let mut shared = self.shared.0.borrow_mut();
        shared.take_failure()?;
        shared.queue_flip(CommitRecord::PageFlip(buffer))
    }

    fn atomic_commit(&mut self, request: &FrameRequest) -> io::Result<()> {
        let mut shared = self.shared.0.borrow_mut();
        shared.take_failure()?;
        shared.queue_flip(CommitRecord::Atomic(request.clone()))
    }

    fn read_events(&mut self) -> io::Result<Vec<FlipEvent>> {
        let mut buf = [0u8; 64];
        let mut count = 0;
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => count += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut shared = self.shared.0.borrow_mut();
        let frame_ns = 1_000_000_000 / u64::from(shared.options.refresh.max(1));
        let flips: Vec<BufferHandle> = shared
            .commits
            .iter()
            .filter(|c| !matches!(c, CommitRecord::SetMode(_)))
            .map(|c| c.handle())
            .collect();

        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            shared.sequence += 1;
            let seq = shared.sequence;
            if let Some(handle) = flips.get(seq as usize - 1) {
                shared.scanout = Some(*handle);
            }
            events.push(FlipEvent {
                sequence: seq,
                timestamp: Duration::from_nanos(u64::from(seq) * frame_ns),
                target: shared.crtc,
            });
        }
        tracing::trace!(target: logging::KMS, "headless: {} completion(s)", events.len());
        Ok(events)
    }
}

impl BufferAllocator for HeadlessDisplay {
    fn allocate(&mut self, desc: &BufferDesc) -> io::Result<AllocatedBuffer> {
        let mut shared = self.shared.0.borrow_mut();
        let pitch = padded_pitch(&shared.options);
        shared.next_handle += 1;
        let handle = shared.next_handle;
        shared.live.insert(handle, vec![0; pitch as usize * desc.height as usize]);
        Ok(AllocatedBuffer {
            handle: BufferHandle(handle),
            pitch,
        })
    }

    fn upload(&mut self, handle: BufferHandle, pixels: &[u8]) -> io::Result<()> {
        let mut shared = self.shared.0.borrow_mut();
        if let Some(errno) = shared.fail_next_upload.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let data = shared
            .live
            .get_mut(&handle.0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let len = data.len().min(pixels.len());
        data[..len].copy_from_slice(&pixels[..len]);
        let first = pixels
            .get(..4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        shared.uploads.push((handle, first));
        Ok(())
    }

    fn release(&mut self, handle: BufferHandle) {
        let mut shared = self.shared.0.borrow_mut();
        if shared.live.remove(&handle.0).is_none() {
            shared.double_releases += 1;
            tracing::warn!(target: logging::POOL, "headless: release of unknown buffer {}", handle.0);
            return;
        }
        shared.released.push(handle);
    }
}

/// Keyboard fed through a socketpair.
#[derive(Debug)]
pub struct ScriptedInput {
    reader: UnixStream,
    writer: UnixStream,
}

/// Writing end of a [`ScriptedInput`].
#[derive(Debug)]
pub struct KeyInjector {
    writer: UnixStream,
}

impl KeyInjector {
    pub fn send(&mut self, keycode: u32, state: KeyState) -> io::Result<()> {
        let mut record = [0u8; 8];
        record[..4].copy_from_slice(&keycode.to_le_bytes());
        record[4..].copy_from_slice(&(state as u32).to_le_bytes());
        self.writer.write_all(&record)
    }

    pub fn press(&mut self, keycode: u32) -> io::Result<()> {
        self.send(keycode, KeyState::Pressed)
    }

    pub fn release(&mut self, keycode: u32) -> io::Result<()> {
        self.send(keycode, KeyState::Released)
    }

    /// Press and release.
    pub fn tap(&mut self, keycode: u32) -> io::Result<()> {
        self.press(keycode)?;
        self.release(keycode)
    }
}

impl ScriptedInput {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    pub fn injector(&self) -> io::Result<KeyInjector> {
        Ok(KeyInjector {
            writer: self.writer.try_clone()?,
        })
    }
}

impl InputSource for ScriptedInput {
    fn input_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    fn read_keys(&mut self) -> io::Result<Vec<KeyEvent>> {
        let mut bytes = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => bytes.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        // Writers always send whole records.
        Ok(bytes
            .chunks_exact(8)
            .map(|r| KeyEvent {
                keycode: u32::from_le_bytes([r[0], r[1], r[2], r[3]]),
                state: KeyState::from(u32::from_le_bytes([r[4], r[5], r[6], r[7]])),
                time_ms: 0,
            })
            .collect())
    }
}
