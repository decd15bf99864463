//! Commit requests.
//!
//! A [`FrameRequest`] accumulates property changes for one buffer and one
//! output before a single atomic commit. It is built right before the commit
//! call and dropped right after it.

use bitflags::bitflags;

use crate::core::buffer::BufferHandle;
use crate::platform::api::OutputTarget;

bitflags! {
    /// Values match `DRM_MODE_PAGE_FLIP_EVENT` / `DRM_MODE_ATOMIC_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 0x01;
        const PAGE_FLIP_ASYNC = 0x02;
        const TEST_ONLY = 0x0100;
        const NONBLOCK = 0x0200;
        const ALLOW_MODESET = 0x0400;
    }
}

/// KMS object a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KmsObject {
    Connector(u32),
    Crtc(u32),
    Plane(u32),
}

/// Property values the engine knows how to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValue {
    Framebuffer(BufferHandle),
    Crtc(u32),
    /// The output's mode, materialized as a blob by the device.
    Mode,
    Active(bool),
    Range(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyChange {
    pub object: KmsObject,
    pub name: &'static str,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    /// Pool index of the buffer being presented
    pub buffer: usize,
    pub handle: BufferHandle,
    pub flags: CommitFlags,
    changes: Vec<PropertyChange>,
}

impl FrameRequest {
    pub fn new(buffer: usize, handle: BufferHandle, flags: CommitFlags) -> Self {
        Self {
            buffer,
            handle,
            flags,
            changes: Vec::new(),
        }
    }

    /// Standard request for scanning `handle` out full-screen on `target`.
    ///
    /// With `modeset` the request also routes the connector to the CRTC and
    /// programs the mode, and is allowed to change it.
    pub fn atomic(buffer: usize, handle: BufferHandle, target: &OutputTarget, modeset: bool) -> Self {
        let mut flags = CommitFlags::PAGE_FLIP_EVENT | CommitFlags::NONBLOCK;
        if modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        let mut req = Self::new(buffer, handle, flags);

        if modeset {
            req.add(KmsObject::Connector(target.connector), "CRTC_ID", PropertyValue::Crtc(target.crtc));
            req.add(KmsObject::Crtc(target.crtc), "MODE_ID", PropertyValue::Mode);
            req.add(KmsObject::Crtc(target.crtc), "ACTIVE", PropertyValue::Active(true));
        }

        if let Some(plane) = target.plane {
            let plane = KmsObject::Plane(plane);
            let (w, h) = (u64::from(target.width), u64::from(target.height));
            req.add(plane, "FB_ID", PropertyValue::Framebuffer(handle));
            req.add(plane, "CRTC_ID", PropertyValue::Crtc(target.crtc));
            // Source rectangle is 16.16 fixed point.
            req.add(plane, "SRC_X", PropertyValue::Range(0));
            req.add(plane, "SRC_Y", PropertyValue::Range(0));
            req.add(plane, "SRC_W", PropertyValue::Range(w << 16));
            req.add(plane, "SRC_H", PropertyValue::Range(h << 16));
            req.add(plane, "CRTC_X", PropertyValue::Range(0));
            req.add(plane, "CRTC_Y", PropertyValue::Range(0));
            req.add(plane, "CRTC_W", PropertyValue::Range(w));
            req.add(plane, "CRTC_H", PropertyValue::Range(h));
        }

        req
    }

    pub fn add(&mut self, object: KmsObject, name: &'static str, value: PropertyValue) {
        self.changes.push(PropertyChange { object, name, value });
    }

    pub fn changes(&self) -> &[PropertyChange] {
        &self.changes
    }

    pub fn is_modeset(&self) -> bool {
        self.flags.contains(CommitFlags::ALLOW_MODESET)
    }

    pub fn find(&self, object: KmsObject, name: &str) -> Option<PropertyValue> {
        self.changes
            .iter()
            .find(|c| c.object == object && c.name == name)
            .map(|c| c.value)
    }
}
