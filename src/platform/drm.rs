//! KMS display device.
//!
//! Opens a DRM node, picks the first connected connector with its preferred
//! mode, resolves an encoder/CRTC and, when the driver supports atomic
//! modesetting, the CRTC's primary plane. Scan-out buffers are GBM buffer
//! objects or dumb buffers wrapped in framebuffers; the framebuffer id is
//! the [`BufferHandle`] the engine sees.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::ptr::NonNull;

use drm::buffer::DrmFourcc;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{
    atomic, connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Device as ControlDevice, Event, Mode,
    ModeTypeFlags, PageFlipFlags,
};
use drm::{ClientCapability, Device as _};

use crate::config::BufferKind;
use crate::core::buffer::{AllocatedBuffer, BufferDesc, BufferHandle, MappedRegion};
use crate::core::request::{CommitFlags, FrameRequest, KmsObject, PropertyValue};
use crate::platform::api::{BufferAllocator, DisplayDevice, FlipEvent, OutputTarget};
use crate::util::logging;

/// `DRM_PLANE_TYPE_PRIMARY`
const PLANE_TYPE_PRIMARY: u64 = 1;

/// An open DRM node.
#[derive(Debug)]
pub struct Card(File);

impl Card {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Card(file))
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Card(self.0.try_clone()?))
    }
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

enum Storage {
    Gbm(gbm::BufferObject<()>),
    /// Mapped once at allocation, unmapped before the buffer is destroyed.
    Dumb { buffer: DumbBuffer, map: MappedRegion },
}

struct Scanout {
    fb: framebuffer::Handle,
    storage: Storage,
}

/// Connector, encoder and CRTC chosen for presentation.
struct Route {
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
    name: String,
}

pub struct DrmDisplay {
    card: Card,
    gbm: Option<gbm::Device<Card>>,
    kind: BufferKind,
    route: Route,
    plane: Option<plane::Handle>,
    target: OutputTarget,
    buffers: HashMap<u32, Scanout>,
    properties: HashMap<KmsObject, HashMap<String, property::Handle>>,
    /// Mode blob id, created by the first modeset commit
    mode_blob: Option<u64>,
}

impl DrmDisplay {
    pub fn open(path: &Path, kind: BufferKind) -> io::Result<Self> {
        let card = Card::open(path)?;

        let atomic = card
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .and_then(|_| card.set_client_capability(ClientCapability::Atomic, true))
            .is_ok();
        if !atomic {
            tracing::warn!(target: logging::KMS, "{} has no atomic support", path.display());
        }

        let route = resolve_route(&card)?;
        let plane = if atomic { find_primary_plane(&card, route.crtc)? } else { None };

        let gbm = match kind {
            BufferKind::Gbm => Some(gbm::Device::new(card.try_clone()?)?),
            BufferKind::Dumb => None,
        };

        let (width, height) = route.mode.size();
        let target = OutputTarget {
            width: u32::from(width),
            height: u32::from(height),
            refresh: route.mode.vrefresh(),
            connector: u32::from(route.connector),
            crtc: u32::from(route.crtc),
            plane: plane.map(u32::from),
            name: route.name.clone(),
        };

        tracing::info!(
            target: logging::KMS,
            "Using {} {}x{}@{} crtc={} plane={:?} buffers={:?}",
            target.name, target.width, target.height, target.refresh, target.crtc, target.plane, kind
        );

        Ok(Self {
            card,
            gbm,
            kind,
            route,
            plane,
            target,
            buffers: HashMap::new(),
            properties: HashMap::new(),
            mode_blob: None,
        })
    }

    fn framebuffer(&self, handle: BufferHandle) -> io::Result<framebuffer::Handle> {
        self.buffers
            .get(&handle.0)
            .map(|s| s.fb)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn property(&mut self, object: KmsObject, name: &str) -> io::Result<property::Handle> {
        if !self.properties.contains_key(&object) {
            let set = match object {
                KmsObject::Connector(_) => self.card.get_properties(self.route.connector)?,
                KmsObject::Crtc(_) => self.card.get_properties(self.route.crtc)?,
                KmsObject::Plane(_) => {
                    let plane = self.plane.ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;
                    self.card.get_properties(plane)?
                }
            };
            let names = set
                .as_hashmap(&self.card)?
                .into_iter()
                .map(|(name, info)| (name, info.handle()))
                .collect();
            self.properties.insert(object, names);
        }

        self.properties
            .get(&object)
            .and_then(|names| names.get(name).copied())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{:?} has no property {}", object, name))
            })
    }

    fn property_value(&mut self, value: PropertyValue) -> io::Result<property::Value<'static>> {
        Ok(match value {
            PropertyValue::Framebuffer(handle) => property::Value::Framebuffer(Some(self.framebuffer(handle)?)),
            PropertyValue::Crtc(_) => property::Value::CRTC(Some(self.route.crtc)),
            PropertyValue::Mode => match self.mode_blob {
                Some(id) => property::Value::Blob(id),
                None => {
                    let blob = self.card.create_property_blob(&self.route.mode)?;
                    if let property::Value::Blob(id) = blob {
                        self.mode_blob = Some(id);
                    }
                    blob
                }
            },
            PropertyValue::Active(on) => property::Value::Boolean(on),
            PropertyValue::Range(v) => property::Value::UnsignedRange(v),
        })
    }

    /// Map a dumb buffer for the lifetime of the buffer.
    fn map_persistent(&self, db: &mut DumbBuffer) -> io::Result<MappedRegion> {
        let mut mapping = self.card.map_dumb_buffer(db)?;
        let bytes = mapping.as_mut();
        let len = bytes.len();
        let ptr = NonNull::new(bytes.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "dumb buffer mapped at null"))?;
        // The region now belongs to the MappedRegion, which unmaps it on drop.
        std::mem::forget(mapping);
        // SAFETY: ptr/len come from the live mapping forgotten above.
        Ok(unsafe { MappedRegion::adopt(ptr, len) })
    }

    fn destroy_dumb(&self, db: DumbBuffer, why: &str) {
        if let Err(e) = self.card.destroy_dumb_buffer(db) {
            tracing::warn!(target: logging::KMS, "Failed to destroy {} dumb buffer: {}", why, e);
        }
    }

    fn build_request(&mut self, request: &FrameRequest) -> io::Result<atomic::AtomicModeReq> {
        let mut req = atomic::AtomicModeReq::new();
        for change in request.changes() {
            let prop = self.property(change.object, change.name)?;
            let value = self.property_value(change.value)?;
            match change.object {
                KmsObject::Connector(_) => req.add_property(self.route.connector, prop, value),
                KmsObject::Crtc(_) => req.add_property(self.route.crtc, prop, value),
                KmsObject::Plane(_) => {
                    let plane = self.plane.ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;
                    req.add_property(plane, prop, value)
                }
            }
        }
        Ok(req)
    }
}

fn atomic_flags(flags: CommitFlags) -> AtomicCommitFlags {
    let mut out = AtomicCommitFlags::empty();
    if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
        out |= AtomicCommitFlags::PAGE_FLIP_EVENT;
    }
    if flags.contains(CommitFlags::PAGE_FLIP_ASYNC) {
        out |= AtomicCommitFlags::PAGE_FLIP_ASYNC;
    }
    if flags.contains(CommitFlags::TEST_ONLY) {
        out |= AtomicCommitFlags::TEST_ONLY;
    }
    if flags.contains(CommitFlags::NONBLOCK) {
        out |= AtomicCommitFlags::NONBLOCK;
    }
    if flags.contains(CommitFlags::ALLOW_MODESET) {
        out |= AtomicCommitFlags::ALLOW_MODESET;
    }
    out
}

fn not_found(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, what.to_string())
}

fn connector_name(info: &connector::Info) -> String {
    format!("{:?}-{}", info.interface(), info.interface_id())
}

fn resolve_route(card: &Card) -> io::Result<Route> {
    let res = card.resource_handles()?;

    let info = res
        .connectors()
        .iter()
        .filter_map(|&c| card.get_connector(c, true).ok())
        .find(|c| c.state() == connector::State::Connected && !c.modes().is_empty())
        .ok_or_else(|| not_found("no connected connector"))?;

    let mode = info
        .modes()
        .iter()
        .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
        .or_else(|| info.modes().first())
        .copied()
        .ok_or_else(|| not_found("connector has no modes"))?;

    // Keep the CRTC already driving the connector when there is one.
    let current = info
        .current_encoder()
        .and_then(|e| card.get_encoder(e).ok())
        .and_then(|e| e.crtc());
    let crtc = match current {
        Some(crtc) => crtc,
        None => info
            .encoders()
            .iter()
            .filter_map(|&e| card.get_encoder(e).ok())
            .flat_map(|e| res.filter_crtcs(e.possible_crtcs()))
            .next()
            .ok_or_else(|| not_found("no CRTC for connector"))?,
    };

    Ok(Route {
        connector: info.handle(),
        crtc,
        mode,
        name: connector_name(&info),
    })
}

fn find_primary_plane(card: &Card, crtc: crtc::Handle) -> io::Result<Option<plane::Handle>> {
    let res = card.resource_handles()?;
    for handle in card.plane_handles()? {
        let info = card.get_plane(handle)?;
        if !res.filter_crtcs(info.possible_crtcs()).contains(&crtc) {
            continue;
        }
        let props = card.get_properties(handle)?;
        let (ids, values) = props.as_props_and_values();
        for (&id, &value) in ids.iter().zip(values) {
            let prop = card.get_property(id)?;
            if prop.name().to_bytes() == b"type" && value == PLANE_TYPE_PRIMARY {
                return Ok(Some(handle));
            }
        }
    }
    tracing::warn!(target: logging::KMS, "No primary plane for crtc {}", u32::from(crtc));
    Ok(None)
}

impl DisplayDevice for DrmDisplay {
    fn completion_fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }

    fn target(&self) -> &OutputTarget {
        &self.target
    }

    fn set_mode(&mut self, buffer: BufferHandle) -> io::Result<()> {
        let fb = self.framebuffer(buffer)?;
        self.card.set_crtc(
            self.route.crtc,
            Some(fb),
            (0, 0),
            &[self.route.connector],
            Some(self.route.mode),
        )
    }

    fn page_flip(&mut self, buffer: BufferHandle) -> io::Result<()> {
        let fb = self.framebuffer(buffer)?;
        self.card.page_flip(self.route.crtc, fb, PageFlipFlags::EVENT, None)
    }

    fn atomic_commit(&mut self, request: &FrameRequest) -> io::Result<()> {
        if self.plane.is_none() {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "atomic commit without a primary plane"));
        }
        let req = self.build_request(request)?;
        self.card.atomic_commit(atomic_flags(request.flags), req)
    }

    fn read_events(&mut self) -> io::Result<Vec<FlipEvent>> {
        let mut flips = Vec::new();
        for event in self.card.receive_events()? {
            match event {
                Event::PageFlip(flip) => flips.push(FlipEvent {
                    sequence: flip.frame,
                    timestamp: flip.duration,
                    target: u32::from(flip.crtc),
                }),
                Event::Vblank(_) => {}
                _ => tracing::trace!(target: logging::KMS, "Ignoring unknown DRM event"),
            }
        }
        Ok(flips)
    }
}

impl BufferAllocator for DrmDisplay {
    fn allocate(&mut self, desc: &BufferDesc) -> io::Result<AllocatedBuffer> {
        let (depth, bpp) = (desc.format.depth(), desc.format.bits_per_pixel());

        let (storage, fb, pitch) = match (&self.gbm, self.kind) {
            (Some(gbm), BufferKind::Gbm) => {
                let flags = gbm::BufferObjectFlags::from_bits_truncate(desc.usage.bits());
                let bo = gbm.create_buffer_object::<()>(desc.width, desc.height, gbm::Format::Xrgb8888, flags)?;
                let fb = self.card.add_framebuffer(&bo, depth, bpp)?;
                let pitch = bo.stride();
                (Storage::Gbm(bo), fb, pitch)
            }
            _ => {
                let size = (desc.width, desc.height);
                let mut db = self.card.create_dumb_buffer(size, DrmFourcc::Xrgb8888, bpp)?;
                let mut map = match self.map_persistent(&mut db) {
                    Ok(map) => map,
                    Err(e) => {
                        self.destroy_dumb(db, "unmappable");
                        return Err(e);
                    }
                };
                let fb = match self.card.add_framebuffer(&db, depth, bpp) {
                    Ok(fb) => fb,
                    Err(e) => {
                        drop(map);
                        self.destroy_dumb(db, "unattached");
                        return Err(e);
                    }
                };
                // Dumb buffers are not cleared by every driver.
                map.as_mut_slice().fill(0);
                let pitch = drm::buffer::Buffer::pitch(&db);
                (Storage::Dumb { buffer: db, map }, fb, pitch)
            }
        };

        let id = u32::from(fb);
        tracing::debug!(target: logging::KMS, "Buffer {} -> fb {} pitch={}", desc.index, id, pitch);
        self.buffers.insert(id, Scanout { fb, storage });
        Ok(AllocatedBuffer {
            handle: BufferHandle(id),
            pitch,
        })
    }

    fn upload(&mut self, handle: BufferHandle, pixels: &[u8]) -> io::Result<()> {
        let scanout = self
            .buffers
            .get_mut(&handle.0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        match &mut scanout.storage {
            Storage::Gbm(bo) => bo.write(pixels),
            Storage::Dumb { map, .. } => {
                let dst = map.as_mut_slice();
                let len = dst.len().min(pixels.len());
                dst[..len].copy_from_slice(&pixels[..len]);
                Ok(())
            }
        }
    }

    fn release(&mut self, handle: BufferHandle) {
        let Some(scanout) = self.buffers.remove(&handle.0) else {
            tracing::warn!(target: logging::KMS, "Release of unknown fb {}", handle.0);
            return;
        };
        if let Err(e) = self.card.destroy_framebuffer(scanout.fb) {
            tracing::warn!(target: logging::KMS, "Failed to remove fb {}: {}", handle.0, e);
        }
        match scanout.storage {
            Storage::Gbm(bo) => drop(bo),
            Storage::Dumb { buffer, map } => {
                drop(map);
                if let Err(e) = self.card.destroy_dumb_buffer(buffer) {
                    tracing::warn!(target: logging::KMS, "Failed to destroy dumb buffer of fb {}: {}", handle.0, e);
                }
            }
        }
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        let leftover: Vec<u32> = self.buffers.keys().copied().collect();
        for id in leftover {
            self.release(BufferHandle(id));
        }
        if let Some(id) = self.mode_blob.take() {
            if let Err(e) = self.card.destroy_property_blob(id) {
                tracing::warn!(target: logging::KMS, "Failed to destroy mode blob {}: {}", id, e);
            }
        }
    }
}

// ============================================================================
// Probe
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConnectorReport {
    pub id: u32,
    pub name: String,
    pub connected: bool,
    /// `WxH@Hz`, preferred mode first
    pub modes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlaneReport {
    pub id: u32,
    pub primary: bool,
    pub crtcs: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub atomic: bool,
    pub connectors: Vec<ConnectorReport>,
    pub crtcs: Vec<u32>,
    pub planes: Vec<PlaneReport>,
    /// What [`DrmDisplay::open`] would present to
    pub target: Option<OutputTarget>,
}

fn mode_label(mode: &Mode) -> String {
    let (w, h) = mode.size();
    format!("{}x{}@{}", w, h, mode.vrefresh())
}

/// Enumerate KMS resources without committing anything.
pub fn probe(path: &Path) -> io::Result<DeviceReport> {
    let card = Card::open(path)?;
    let atomic = card
        .set_client_capability(ClientCapability::UniversalPlanes, true)
        .and_then(|_| card.set_client_capability(ClientCapability::Atomic, true))
        .is_ok();
    let res = card.resource_handles()?;

    let mut connectors = Vec::new();
    for &handle in res.connectors() {
        let info = card.get_connector(handle, false)?;
        let mut modes: Vec<&Mode> = info.modes().iter().collect();
        modes.sort_by_key(|m| !m.mode_type().contains(ModeTypeFlags::PREFERRED));
        connectors.push(ConnectorReport {
            id: u32::from(handle),
            name: connector_name(&info),
            connected: info.state() == connector::State::Connected,
            modes: modes.into_iter().map(mode_label).collect(),
        });
    }

    let mut planes = Vec::new();
    for handle in card.plane_handles()? {
        let info = card.get_plane(handle)?;
        let props = card.get_properties(handle)?;
        let (ids, values) = props.as_props_and_values();
        let mut primary = false;
        for (&id, &value) in ids.iter().zip(values) {
            if card.get_property(id)?.name().to_bytes() == b"type" {
                primary = value == PLANE_TYPE_PRIMARY;
            }
        }
        planes.push(PlaneReport {
            id: u32::from(handle),
            primary,
            crtcs: res
                .filter_crtcs(info.possible_crtcs())
                .into_iter()
                .map(u32::from)
                .collect(),
        });
    }

    let target = resolve_route(&card).ok().map(|route| {
        let (w, h) = route.mode.size();
        let plane = if atomic {
            find_primary_plane(&card, route.crtc).ok().flatten()
        } else {
            None
        };
        OutputTarget {
            width: u32::from(w),
            height: u32::from(h),
            refresh: route.mode.vrefresh(),
            connector: u32::from(route.connector),
            crtc: u32::from(route.crtc),
            plane: plane.map(u32::from),
            name: route.name,
        }
    });

    Ok(DeviceReport {
        atomic,
        connectors,
        crtcs: res.crtcs().iter().map(|&c| u32::from(c)).collect(),
        planes,
        target,
    })
}
