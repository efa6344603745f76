//! DRM object model
//!
//! In-memory graph of connectors, encoders, CRTCs, planes, framebuffers and
//! property blobs, the single source of truth behind every query. Objects are
//! addressed by id through maps, so a stale id fails with `NotFound` instead
//! of dangling, and ids are never reused while the device is open.
//!
//! Mutable objects keep three layers of state: `committed` (on screen),
//! `pending` (handed to a present worker) and `staged` (set through
//! `set_property`, not yet committed). Only the dispatch thread folds
//! `pending` into `committed`.

use crate::commit::InFlight;
use crate::config::ShimConfig;
use crate::error::{DeviceError, PropertyError, ValidationError};
use crate::format::{Fourcc, ALL_FORMATS};
use crate::gbm_device::BufferObject;
use crate::hal::{DisplayMode, DisplayType, FloatRect, HalDisplayId, HalDisplayInfo};
use crate::hotplug::{DisplayPhase, DisplayTracker};
use crate::mode::{physical_size_mm, ModeInfo};
use crate::property::{
    Prop, PropertyInfo, PropertyRegistry, PropertyValue, DRM_MODE_DPMS_ON,
    DRM_PLANE_TYPE_CURSOR, DRM_PLANE_TYPE_OVERLAY, DRM_PLANE_TYPE_PRIMARY,
};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub const DRM_MODE_OBJECT_CRTC: u32 = 0xcccc_cccc;
pub const DRM_MODE_OBJECT_CONNECTOR: u32 = 0xc0c0_c0c0;
pub const DRM_MODE_OBJECT_ENCODER: u32 = 0xe0e0_e0e0;
pub const DRM_MODE_OBJECT_PROPERTY: u32 = 0xb0b0_b0b0;
pub const DRM_MODE_OBJECT_FB: u32 = 0xfbfb_fbfb;
pub const DRM_MODE_OBJECT_BLOB: u32 = 0xbbbb_bbbb;
pub const DRM_MODE_OBJECT_PLANE: u32 = 0xeeee_eeee;

pub const DRM_MODE_CONNECTOR_HDMIA: u32 = 11;
pub const DRM_MODE_CONNECTOR_VIRTUAL: u32 = 15;
pub const DRM_MODE_CONNECTOR_DSI: u32 = 16;

pub const DRM_MODE_ENCODER_TMDS: u32 = 2;
pub const DRM_MODE_ENCODER_VIRTUAL: u32 = 5;
pub const DRM_MODE_ENCODER_DSI: u32 = 6;

/// Entries in the GAMMA_LUT of every CRTC
pub const GAMMA_SIZE: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Connector,
    Encoder,
    Crtc,
    Plane,
    Framebuffer,
    Blob,
    Property,
}

impl ObjectType {
    pub fn drm_type(self) -> u32 {
        match self {
            ObjectType::Connector => DRM_MODE_OBJECT_CONNECTOR,
            ObjectType::Encoder => DRM_MODE_OBJECT_ENCODER,
            ObjectType::Crtc => DRM_MODE_OBJECT_CRTC,
            ObjectType::Plane => DRM_MODE_OBJECT_PLANE,
            ObjectType::Framebuffer => DRM_MODE_OBJECT_FB,
            ObjectType::Blob => DRM_MODE_OBJECT_BLOB,
            ObjectType::Property => DRM_MODE_OBJECT_PROPERTY,
        }
    }

    pub fn from_drm(raw: u32) -> Option<ObjectType> {
        Some(match raw {
            DRM_MODE_OBJECT_CONNECTOR => ObjectType::Connector,
            DRM_MODE_OBJECT_ENCODER => ObjectType::Encoder,
            DRM_MODE_OBJECT_CRTC => ObjectType::Crtc,
            DRM_MODE_OBJECT_PLANE => ObjectType::Plane,
            DRM_MODE_OBJECT_FB => ObjectType::Framebuffer,
            DRM_MODE_OBJECT_BLOB => ObjectType::Blob,
            DRM_MODE_OBJECT_PROPERTY => ObjectType::Property,
            _ => return None,
        })
    }
}

/// A KMS object id; never 0
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub fn from_raw(raw: u32) -> Option<ObjectId> {
        (raw != 0).then_some(ObjectId(raw))
    }

    pub(crate) fn from_value(raw: u64) -> Option<ObjectId> {
        u32::try_from(raw).ok().and_then(ObjectId::from_raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl From<ObjectId> for u32 {
    fn from(id: ObjectId) -> u32 {
        id.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id source shared by every object type
pub(crate) struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self { next: 1 }
    }

    pub(crate) fn alloc(&mut self) -> Result<ObjectId> {
        let id = self.next;
        self.next = id.checked_add(1).ok_or(Error::IdsExhausted)?;
        Ok(ObjectId(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected = 1,
    Disconnected = 2,
    Unknown = 3,
}

/// DRM plane types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Primary,
    Cursor,
    Overlay,
}

impl PlaneType {
    pub fn drm_value(self) -> u64 {
        match self {
            PlaneType::Primary => DRM_PLANE_TYPE_PRIMARY,
            PlaneType::Cursor => DRM_PLANE_TYPE_CURSOR,
            PlaneType::Overlay => DRM_PLANE_TYPE_OVERLAY,
        }
    }
}

/// Destination rectangle in CRTC pixels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && i64::from(self.x) < other.right()
            && i64::from(other.x) < self.right()
            && i64::from(self.y) < other.bottom()
            && i64::from(other.y) < self.bottom()
    }
}

/// Source rectangle in 16.16 fixed point, as the SRC_* properties carry it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SrcRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SrcRect {
    pub fn from_pixels(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x: x << 16,
            y: y << 16,
            width: width << 16,
            height: height << 16,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the rectangle lies within a `width` x `height` buffer
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let w = u64::from(width) << 16;
        let h = u64::from(height) << 16;
        u64::from(self.x) + u64::from(self.width) <= w
            && u64::from(self.y) + u64::from(self.height) <= h
    }

    pub fn to_float(&self) -> FloatRect {
        let f = |v: u32| v as f32 / 65536.0;
        FloatRect {
            left: f(self.x),
            top: f(self.y),
            right: f(self.x) + f(self.width),
            bottom: f(self.y) + f(self.height),
        }
    }
}

/// A registered framebuffer: a buffer object plus the layout it is scanned out with
#[derive(Debug)]
pub struct Framebuffer {
    pub id: ObjectId,
    pub bo: BufferObject,
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub pitch: u32,
    pub offset: u32,
    pub modifier: u64,
}

#[derive(Debug)]
pub struct PropertyBlob {
    pub id: ObjectId,
    pub data: Vec<u8>,
}

/// A MODE_ID blob together with the mode it decodes to
#[derive(Clone, Debug)]
pub struct ModeBlob {
    pub blob: Arc<PropertyBlob>,
    pub mode: ModeInfo,
}

#[derive(Clone, Debug, Default)]
pub struct PlaneState {
    pub crtc: Option<ObjectId>,
    pub fb: Option<Arc<Framebuffer>>,
    pub src: SrcRect,
    pub dst: Rect,
    pub zpos: u32,
}

impl PartialEq for PlaneState {
    fn eq(&self, other: &Self) -> bool {
        self.crtc == other.crtc
            && self.fb.as_ref().map(|f| f.id) == other.fb.as_ref().map(|f| f.id)
            && self.src == other.src
            && self.dst == other.dst
            && self.zpos == other.zpos
    }
}

#[derive(Clone, Debug, Default)]
pub struct CrtcState {
    pub active: bool,
    pub mode: Option<ModeBlob>,
    pub gamma: Option<Arc<PropertyBlob>>,
}

impl CrtcState {
    pub fn mode_info(&self) -> Option<&ModeInfo> {
        self.mode.as_ref().map(|m| &m.mode)
    }
}

impl PartialEq for CrtcState {
    fn eq(&self, other: &Self) -> bool {
        self.active == other.active
            && self.mode.as_ref().map(|m| m.blob.id) == other.mode.as_ref().map(|m| m.blob.id)
            && self.gamma.as_ref().map(|b| b.id) == other.gamma.as_ref().map(|b| b.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorState {
    pub crtc: Option<ObjectId>,
    pub dpms: u64,
}

impl Default for ConnectorState {
    fn default() -> Self {
        Self {
            crtc: None,
            dpms: DRM_MODE_DPMS_ON,
        }
    }
}

/// Committed, pending and staged versions of one object's state
#[derive(Debug)]
pub(crate) struct Staged<T> {
    committed: T,
    pending: Option<T>,
    staged: Option<T>,
}

impl<T: Clone> Staged<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            committed: value,
            pending: None,
            staged: None,
        }
    }

    /// What a reader sees: staged, else pending, else committed
    pub(crate) fn current(&self) -> &T {
        self.staged
            .as_ref()
            .or(self.pending.as_ref())
            .unwrap_or(&self.committed)
    }

    /// The newest state handed to the hardware
    pub(crate) fn latest(&self) -> &T {
        self.pending.as_ref().unwrap_or(&self.committed)
    }

    pub(crate) fn committed(&self) -> &T {
        &self.committed
    }

    pub(crate) fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn stage_mut(&mut self) -> &mut T {
        let staged = match self.staged.take() {
            Some(staged) => staged,
            None => self.latest().clone(),
        };
        self.staged.insert(staged)
    }

    /// Hand a proposal to the hardware; staged edits are folded into it
    pub(crate) fn begin(&mut self, proposal: T) {
        self.pending = Some(proposal);
        self.staged = None;
    }

    pub(crate) fn settle(&mut self, accepted: bool) {
        let pending = self.pending.take();
        if accepted {
            if let Some(pending) = pending {
                self.committed = pending;
            }
        } else {
            self.staged = None;
        }
    }

    pub(crate) fn reset(&mut self, value: T) {
        self.committed = value;
        self.pending = None;
        self.staged = None;
    }
}

pub(crate) struct ConnectorObj {
    pub(crate) id: ObjectId,
    pub(crate) hal_display: HalDisplayId,
    pub(crate) encoder: ObjectId,
    pub(crate) connector_type: u32,
    pub(crate) type_id: u32,
    pub(crate) status: Connection,
    pub(crate) modes: Vec<ModeInfo>,
    pub(crate) hal_modes: Vec<DisplayMode>,
    pub(crate) width_mm: u32,
    pub(crate) height_mm: u32,
    pub(crate) state: Staged<ConnectorState>,
}

pub(crate) struct EncoderObj {
    pub(crate) id: ObjectId,
    pub(crate) connector: ObjectId,
    pub(crate) encoder_type: u32,
    pub(crate) possible_crtcs: u32,
}

pub(crate) struct CrtcObj {
    pub(crate) id: ObjectId,
    pub(crate) index: u32,
    pub(crate) hal_display: HalDisplayId,
    pub(crate) formats: Vec<Fourcc>,
    pub(crate) max_device_layers: Option<usize>,
    pub(crate) planes: Vec<ObjectId>,
    pub(crate) state: Staged<CrtcState>,
    pub(crate) in_flight: Option<InFlight>,
}

impl CrtcObj {
    pub(crate) fn mask(&self) -> u32 {
        1 << self.index
    }
}

pub(crate) struct PlaneObj {
    pub(crate) id: ObjectId,
    pub(crate) plane_type: PlaneType,
    pub(crate) possible_crtcs: u32,
    pub(crate) formats: Vec<Fourcc>,
    pub(crate) default_zpos: u32,
    pub(crate) state: Staged<PlaneState>,
}

// Read-only snapshots handed to callers

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo {
    pub id: ObjectId,
    pub encoder_id: ObjectId,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: Connection,
    pub width_mm: u32,
    pub height_mm: u32,
    pub modes: Vec<ModeInfo>,
    pub crtc_id: Option<ObjectId>,
    pub properties: Vec<PropertyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderInfo {
    pub id: ObjectId,
    pub encoder_type: u32,
    pub crtc_id: Option<ObjectId>,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrtcInfo {
    pub id: ObjectId,
    pub index: u32,
    pub active: bool,
    pub mode: Option<ModeInfo>,
    pub fb_id: Option<ObjectId>,
    pub gamma_size: u32,
    pub planes: Vec<ObjectId>,
    pub properties: Vec<PropertyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaneInfo {
    pub id: ObjectId,
    pub plane_type: PlaneType,
    pub possible_crtcs: u32,
    pub formats: Vec<Fourcc>,
    pub crtc_id: Option<ObjectId>,
    pub fb_id: Option<ObjectId>,
    pub src: SrcRect,
    pub dst: Rect,
    pub zpos: u32,
    pub properties: Vec<PropertyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferInfo {
    pub id: ObjectId,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub depth: u32,
    pub format: Fourcc,
    pub modifier: u64,
    pub buffer_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobInfo {
    pub id: ObjectId,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrmObject {
    Connector(ConnectorInfo),
    Encoder(EncoderInfo),
    Crtc(CrtcInfo),
    Plane(PlaneInfo),
    Framebuffer(FramebufferInfo),
    Blob(BlobInfo),
}

impl DrmObject {
    pub fn id(&self) -> ObjectId {
        match self {
            DrmObject::Connector(c) => c.id,
            DrmObject::Encoder(e) => e.id,
            DrmObject::Crtc(c) => c.id,
            DrmObject::Plane(p) => p.id,
            DrmObject::Framebuffer(f) => f.id,
            DrmObject::Blob(b) => b.id,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            DrmObject::Connector(_) => ObjectType::Connector,
            DrmObject::Encoder(_) => ObjectType::Encoder,
            DrmObject::Crtc(_) => ObjectType::Crtc,
            DrmObject::Plane(_) => ObjectType::Plane,
            DrmObject::Framebuffer(_) => ObjectType::Framebuffer,
            DrmObject::Blob(_) => ObjectType::Blob,
        }
    }

    pub fn properties(&self) -> &[PropertyValue] {
        match self {
            DrmObject::Connector(c) => &c.properties,
            DrmObject::Crtc(c) => &c.properties,
            DrmObject::Plane(p) => &p.properties,
            _ => &[],
        }
    }

    pub fn property(&self, name: &str) -> Option<u64> {
        self.properties()
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }
}

/// DRM resources enumeration
#[derive(Debug, Clone, PartialEq)]
pub struct DrmResources {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub connectors: Vec<ObjectId>,
    pub encoders: Vec<ObjectId>,
    pub crtcs: Vec<ObjectId>,
    pub planes: Vec<ObjectId>,
    pub fbs: Vec<ObjectId>,
}

/// Everything `enumerate` reports, in a comparable form
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSnapshot {
    pub resources: DrmResources,
    pub objects: Vec<DrmObject>,
}

impl ObjectSnapshot {
    pub fn get(&self, id: ObjectId) -> Option<&DrmObject> {
        self.objects.iter().find(|o| o.id() == id)
    }

    pub fn connectors(&self) -> impl Iterator<Item = &ConnectorInfo> {
        self.objects.iter().filter_map(|o| match o {
            DrmObject::Connector(c) => Some(c),
            _ => None,
        })
    }

    pub fn encoders(&self) -> impl Iterator<Item = &EncoderInfo> {
        self.objects.iter().filter_map(|o| match o {
            DrmObject::Encoder(e) => Some(e),
            _ => None,
        })
    }

    pub fn crtcs(&self) -> impl Iterator<Item = &CrtcInfo> {
        self.objects.iter().filter_map(|o| match o {
            DrmObject::Crtc(c) => Some(c),
            _ => None,
        })
    }

    pub fn planes(&self) -> impl Iterator<Item = &PlaneInfo> {
        self.objects.iter().filter_map(|o| match o {
            DrmObject::Plane(p) => Some(p),
            _ => None,
        })
    }
}

/// A property value after its references have been resolved
#[derive(Debug, Clone)]
pub(crate) enum Decoded {
    Scalar(u64),
    Fb(Option<Arc<Framebuffer>>),
    Object(Option<ObjectId>),
    Mode(Option<ModeBlob>),
    Blob(Option<Arc<PropertyBlob>>),
}

pub(crate) fn apply_plane(state: &mut PlaneState, prop: Prop, value: Decoded) {
    match (prop, value) {
        (Prop::FbId, Decoded::Fb(fb)) => state.fb = fb,
        (Prop::CrtcId, Decoded::Object(crtc)) => state.crtc = crtc,
        (Prop::SrcX, Decoded::Scalar(v)) => state.src.x = v as u32,
        (Prop::SrcY, Decoded::Scalar(v)) => state.src.y = v as u32,
        (Prop::SrcW, Decoded::Scalar(v)) => state.src.width = v as u32,
        (Prop::SrcH, Decoded::Scalar(v)) => state.src.height = v as u32,
        (Prop::CrtcX, Decoded::Scalar(v)) => state.dst.x = v as i64 as i32,
        (Prop::CrtcY, Decoded::Scalar(v)) => state.dst.y = v as i64 as i32,
        (Prop::CrtcW, Decoded::Scalar(v)) => state.dst.width = v as u32,
        (Prop::CrtcH, Decoded::Scalar(v)) => state.dst.height = v as u32,
        (Prop::Zpos, Decoded::Scalar(v)) => state.zpos = v as u32,
        _ => {}
    }
}

pub(crate) fn apply_crtc(state: &mut CrtcState, prop: Prop, value: Decoded) {
    match (prop, value) {
        (Prop::Active, Decoded::Scalar(v)) => state.active = v != 0,
        (Prop::ModeId, Decoded::Mode(mode)) => state.mode = mode,
        (Prop::GammaLut, Decoded::Blob(blob)) => state.gamma = blob,
        _ => {}
    }
}

pub(crate) fn apply_connector(state: &mut ConnectorState, prop: Prop, value: Decoded) {
    match (prop, value) {
        (Prop::CrtcId, Decoded::Object(crtc)) => state.crtc = crtc,
        (Prop::Dpms, Decoded::Scalar(v)) => state.dpms = v,
        _ => {}
    }
}

/// Outcome of reconciling a connected display into the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AttachedDisplay {
    pub(crate) crtc: ObjectId,
    pub(crate) connector: ObjectId,
    pub(crate) new_crtc: bool,
    pub(crate) changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DetachedDisplay {
    pub(crate) crtc: ObjectId,
    pub(crate) connector: ObjectId,
}

pub struct ObjectModel {
    pub(crate) ids: IdAllocator,
    pub(crate) props: PropertyRegistry,
    pub(crate) connectors: BTreeMap<ObjectId, ConnectorObj>,
    pub(crate) encoders: BTreeMap<ObjectId, EncoderObj>,
    pub(crate) crtcs: BTreeMap<ObjectId, CrtcObj>,
    pub(crate) planes: BTreeMap<ObjectId, PlaneObj>,
    pub(crate) framebuffers: BTreeMap<ObjectId, Arc<Framebuffer>>,
    pub(crate) blobs: BTreeMap<ObjectId, Arc<PropertyBlob>>,
    pub(crate) display_crtcs: BTreeMap<HalDisplayId, ObjectId>,
    pub(crate) displays: DisplayTracker,
    type_counters: HashMap<u32, u32>,
    overlay_planes: u32,
    pub(crate) cursor_size: u32,
    pub(crate) max_fb_dimension: u32,
    pub(crate) lost: Option<DeviceError>,
}

impl ObjectModel {
    pub fn new(config: &ShimConfig) -> Result<Self> {
        let mut ids = IdAllocator::new();
        let zpos_max = u64::from(config.planes_per_crtc().saturating_sub(1));
        let props = PropertyRegistry::new(&mut ids, zpos_max)?;
        Ok(Self {
            ids,
            props,
            connectors: BTreeMap::new(),
            encoders: BTreeMap::new(),
            crtcs: BTreeMap::new(),
            planes: BTreeMap::new(),
            framebuffers: BTreeMap::new(),
            blobs: BTreeMap::new(),
            display_crtcs: BTreeMap::new(),
            displays: DisplayTracker::default(),
            type_counters: HashMap::new(),
            overlay_planes: config.overlay_planes,
            cursor_size: config.cursor_size,
            max_fb_dimension: config.max_fb_dimension,
            lost: None,
        })
    }

    pub fn object_type(&self, id: ObjectId) -> Option<ObjectType> {
        if self.connectors.contains_key(&id) {
            Some(ObjectType::Connector)
        } else if self.encoders.contains_key(&id) {
            Some(ObjectType::Encoder)
        } else if self.crtcs.contains_key(&id) {
            Some(ObjectType::Crtc)
        } else if self.planes.contains_key(&id) {
            Some(ObjectType::Plane)
        } else if self.framebuffers.contains_key(&id) {
            Some(ObjectType::Framebuffer)
        } else if self.blobs.contains_key(&id) {
            Some(ObjectType::Blob)
        } else if self.props.contains(id) {
            Some(ObjectType::Property)
        } else {
            None
        }
    }

    fn resolve(&self, raw: u32) -> std::result::Result<(ObjectId, ObjectType), ValidationError> {
        let id = ObjectId::from_raw(raw).ok_or(ValidationError::NotFound(raw))?;
        let ty = self.object_type(id).ok_or(ValidationError::NotFound(raw))?;
        Ok((id, ty))
    }

    pub fn property_id(&self, prop: Prop) -> ObjectId {
        self.props.id(prop)
    }

    pub fn property_info(&self, raw: u32) -> std::result::Result<PropertyInfo, ValidationError> {
        let prop = self
            .props
            .lookup(raw)
            .ok_or(ValidationError::NotFound(raw))?;
        Ok(self.props.info(prop))
    }

    /// Find a property attached to `object` by name
    pub fn find_property(&self, object: ObjectId, name: &str) -> Option<ObjectId> {
        let ty = self.object_type(object)?;
        Prop::for_type(ty)
            .iter()
            .find(|p| p.name() == name)
            .map(|p| self.props.id(*p))
    }

    /// Resolve a raw property value, checking ranges and references
    pub(crate) fn decode(&self, prop: Prop, raw: u64) -> std::result::Result<Decoded, PropertyError> {
        self.props.check_scalar(prop, raw)?;
        let unknown = PropertyError::UnknownObject {
            property: prop.name(),
            value: raw,
        };
        let reference = ObjectId::from_value(raw);
        Ok(match prop {
            Prop::FbId => match raw {
                0 => Decoded::Fb(None),
                _ => {
                    let fb = reference.and_then(|id| self.framebuffers.get(&id));
                    Decoded::Fb(Some(Arc::clone(fb.ok_or(unknown)?)))
                }
            },
            Prop::CrtcId => match raw {
                0 => Decoded::Object(None),
                _ => match reference.filter(|id| self.crtcs.contains_key(id)) {
                    Some(id) => Decoded::Object(Some(id)),
                    None => return Err(unknown),
                },
            },
            Prop::ModeId => match raw {
                0 => Decoded::Mode(None),
                _ => {
                    let blob = reference
                        .and_then(|id| self.blobs.get(&id))
                        .ok_or(unknown)?;
                    let mode = ModeInfo::from_bytes(&blob.data).ok_or(PropertyError::InvalidBlob {
                        property: prop.name(),
                        blob: raw,
                    })?;
                    Decoded::Mode(Some(ModeBlob {
                        blob: Arc::clone(blob),
                        mode,
                    }))
                }
            },
            Prop::GammaLut => match raw {
                0 => Decoded::Blob(None),
                _ => {
                    let blob = reference
                        .and_then(|id| self.blobs.get(&id))
                        .ok_or(unknown)?;
                    if blob.data.len() != GAMMA_SIZE as usize * 8 {
                        return Err(PropertyError::InvalidBlob {
                            property: prop.name(),
                            blob: raw,
                        });
                    }
                    Decoded::Blob(Some(Arc::clone(blob)))
                }
            },
            _ => Decoded::Scalar(raw),
        })
    }

    /// Look up which property `raw` names and check it may be set on `object`
    pub(crate) fn settable(
        &self,
        object: u32,
        property: u32,
    ) -> std::result::Result<(ObjectId, ObjectType, Prop), ValidationError> {
        let (id, ty) = self.resolve(object)?;
        let prop = self
            .props
            .lookup(property)
            .ok_or(PropertyError::UnknownProperty(property))?;
        if !prop.applies_to(ty) {
            return Err(PropertyError::NotAttached {
                object: id,
                property: prop.name(),
            }
            .into());
        }
        if prop.is_immutable() {
            return Err(PropertyError::Immutable(prop.name()).into());
        }
        Ok((id, ty, prop))
    }

    /// Stage a property change; nothing reaches the HAL until a commit
    pub fn set_property(
        &mut self,
        object: u32,
        property: u32,
        value: u64,
    ) -> std::result::Result<(), ValidationError> {
        if self.lost.is_some() {
            return Err(ValidationError::DeviceGone);
        }
        let (id, ty, prop) = self.settable(object, property)?;
        let decoded = self.decode(prop, value)?;
        match ty {
            ObjectType::Plane => {
                if let Some(plane) = self.planes.get_mut(&id) {
                    apply_plane(plane.state.stage_mut(), prop, decoded);
                }
            }
            ObjectType::Crtc => {
                if let Some(crtc) = self.crtcs.get_mut(&id) {
                    apply_crtc(crtc.state.stage_mut(), prop, decoded);
                }
            }
            ObjectType::Connector => {
                if let Some(conn) = self.connectors.get_mut(&id) {
                    apply_connector(conn.state.stage_mut(), prop, decoded);
                }
            }
            _ => {}
        }
        debug!("Staged {}={} on object {}", prop.name(), value, id);
        Ok(())
    }

    /// Drop every staged, uncommitted change
    pub fn discard_staged(&mut self) {
        for plane in self.planes.values_mut() {
            plane.state.staged = None;
        }
        for crtc in self.crtcs.values_mut() {
            crtc.state.staged = None;
        }
        for conn in self.connectors.values_mut() {
            conn.state.staged = None;
        }
    }

    pub fn create_blob(&mut self, data: Vec<u8>) -> Result<ObjectId> {
        let id = self.ids.alloc()?;
        debug!("Created blob {} ({} bytes)", id, data.len());
        self.blobs.insert(id, Arc::new(PropertyBlob { id, data }));
        Ok(id)
    }

    /// Destroy a blob. CRTCs already using it keep their copy.
    pub fn destroy_blob(&mut self, raw: u32) -> std::result::Result<(), ValidationError> {
        let (id, ty) = self.resolve(raw)?;
        if ty != ObjectType::Blob {
            return Err(ValidationError::WrongType {
                id,
                expected: ObjectType::Blob,
                actual: ty,
            });
        }
        self.blobs.remove(&id);
        Ok(())
    }

    pub fn blob_data(&self, raw: u32) -> Option<&[u8]> {
        ObjectId::from_raw(raw)
            .and_then(|id| self.blobs.get(&id))
            .map(|b| b.data.as_slice())
    }

    /// Register a buffer as a framebuffer. `format` may differ from the
    /// buffer's own format only in whether alpha is used.
    pub fn add_framebuffer(&mut self, bo: &BufferObject, format: Fourcc) -> Result<ObjectId> {
        if self.lost.is_some() {
            return Err(ValidationError::DeviceGone.into());
        }
        if !format.is_compatible_with(bo.format()) {
            return Err(ValidationError::Framebuffer(format!(
                "format {:?} does not match buffer format {:?}",
                format,
                bo.format()
            ))
            .into());
        }
        if bo.width() > self.max_fb_dimension || bo.height() > self.max_fb_dimension {
            return Err(ValidationError::Framebuffer(format!(
                "{}x{} exceeds the {} pixel limit",
                bo.width(),
                bo.height(),
                self.max_fb_dimension
            ))
            .into());
        }
        if bo.is_freed() {
            return Err(ValidationError::Framebuffer("buffer already freed".into()).into());
        }
        let min_pitch = u64::from(bo.width()) * u64::from(format.bytes_per_pixel().unwrap_or(4));
        if u64::from(bo.stride()) < min_pitch {
            return Err(ValidationError::Framebuffer(format!(
                "pitch {} is below {} bytes for a {} pixel wide {:?} buffer",
                bo.stride(),
                min_pitch,
                bo.width(),
                format
            ))
            .into());
        }

        let id = self.ids.alloc()?;
        info!(
            "Adding framebuffer {}: {}x{} {:?} pitch={}",
            id,
            bo.width(),
            bo.height(),
            format,
            bo.stride()
        );
        self.framebuffers.insert(
            id,
            Arc::new(Framebuffer {
                id,
                bo: bo.retain(),
                width: bo.width(),
                height: bo.height(),
                format,
                pitch: bo.stride(),
                offset: bo.offset(),
                modifier: bo.modifier(),
            }),
        );
        Ok(id)
    }

    /// Unregister a framebuffer. Planes still scanning it out keep the
    /// buffer alive until they move on.
    pub fn remove_framebuffer(
        &mut self,
        raw: u32,
    ) -> std::result::Result<Arc<Framebuffer>, ValidationError> {
        let (id, ty) = self.resolve(raw)?;
        if ty != ObjectType::Framebuffer {
            return Err(ValidationError::WrongType {
                id,
                expected: ObjectType::Framebuffer,
                actual: ty,
            });
        }
        info!("Removing framebuffer {}", id);
        self.framebuffers
            .remove(&id)
            .ok_or(ValidationError::NotFound(raw))
    }

    pub fn framebuffer(&self, id: ObjectId) -> Option<Arc<Framebuffer>> {
        self.framebuffers.get(&id).cloned()
    }

    pub(crate) fn crtc_for_display(&self, display: HalDisplayId) -> Option<ObjectId> {
        self.display_crtcs.get(&display).copied()
    }

    pub(crate) fn connector_for_display(&self, display: HalDisplayId) -> Option<ObjectId> {
        self.connectors
            .values()
            .find(|c| c.hal_display == display)
            .map(|c| c.id)
    }

    pub(crate) fn primary_plane(&self, crtc: ObjectId) -> Option<ObjectId> {
        let crtc = self.crtcs.get(&crtc)?;
        crtc.planes
            .iter()
            .copied()
            .find(|p| matches!(self.planes.get(p), Some(plane) if plane.plane_type == PlaneType::Primary))
    }

    fn create_crtc(&mut self, info: &HalDisplayInfo) -> Result<ObjectId> {
        let index = self.crtcs.len() as u32;
        if index >= 32 {
            return Err(Error::HwcInit(format!(
                "display {} exceeds the 32 CRTC limit",
                info.id
            )));
        }
        let formats = if info.formats.is_empty() {
            ALL_FORMATS.to_vec()
        } else {
            info.formats.clone()
        };

        let crtc_id = self.ids.alloc()?;
        let mut planes = Vec::new();
        let layout = std::iter::once(PlaneType::Primary)
            .chain((0..self.overlay_planes).map(|_| PlaneType::Overlay))
            .chain(std::iter::once(PlaneType::Cursor));
        for (zpos, plane_type) in layout.enumerate() {
            let id = self.ids.alloc()?;
            let plane_formats = match plane_type {
                PlaneType::Cursor => vec![Fourcc::ARGB8888],
                _ => formats.clone(),
            };
            let state = PlaneState {
                zpos: zpos as u32,
                ..Default::default()
            };
            self.planes.insert(
                id,
                PlaneObj {
                    id,
                    plane_type,
                    possible_crtcs: 1 << index,
                    formats: plane_formats,
                    default_zpos: zpos as u32,
                    state: Staged::new(state),
                },
            );
            planes.push(id);
        }

        info!(
            "CRTC {} (index {}) for display {} with {} planes",
            crtc_id,
            index,
            info.id,
            planes.len()
        );
        self.crtcs.insert(
            crtc_id,
            CrtcObj {
                id: crtc_id,
                index,
                hal_display: info.id,
                formats,
                max_device_layers: info.max_device_layers,
                planes,
                state: Staged::new(CrtcState::default()),
                in_flight: None,
            },
        );
        self.display_crtcs.insert(info.id, crtc_id);
        Ok(crtc_id)
    }

    /// Bring a connected display into the model. Reuses the display's CRTC
    /// if it was seen before; a display that is already connected is only
    /// refreshed.
    pub(crate) fn attach_display(
        &mut self,
        info: &HalDisplayInfo,
        hal_modes: Vec<DisplayMode>,
        fallback: Option<(u32, u32, u32)>,
    ) -> Result<AttachedDisplay> {
        let hal_modes = if hal_modes.is_empty() {
            match fallback {
                Some((w, h, refresh)) => {
                    info!("Display {} reported no modes, using {}x{}@{}", info.id, w, h, refresh);
                    vec![DisplayMode::new(0, w, h, refresh)]
                }
                None => Vec::new(),
            }
        } else {
            hal_modes
        };
        let modes: Vec<ModeInfo> = hal_modes
            .iter()
            .enumerate()
            .map(|(i, m)| ModeInfo::from_display_mode(m, i == 0))
            .collect();
        let (width_mm, height_mm) = hal_modes.first().map(physical_size_mm).unwrap_or((0, 0));

        let (crtc, new_crtc) = match self.display_crtcs.get(&info.id) {
            Some(&crtc) => (crtc, false),
            None => (self.create_crtc(info)?, true),
        };
        if let Some(c) = self.crtcs.get_mut(&crtc) {
            c.max_device_layers = info.max_device_layers;
        }

        if let Some(existing) = self.connector_for_display(info.id) {
            if let Some(conn) = self.connectors.get_mut(&existing) {
                let changed = conn.status != Connection::Connected || conn.modes != modes;
                conn.status = Connection::Connected;
                conn.modes = modes;
                conn.hal_modes = hal_modes;
                conn.width_mm = width_mm;
                conn.height_mm = height_mm;
                return Ok(AttachedDisplay {
                    crtc,
                    connector: existing,
                    new_crtc,
                    changed,
                });
            }
        }

        let (connector_type, encoder_type) = match info.display_type {
            DisplayType::Primary => (DRM_MODE_CONNECTOR_DSI, DRM_MODE_ENCODER_DSI),
            DisplayType::External => (DRM_MODE_CONNECTOR_HDMIA, DRM_MODE_ENCODER_TMDS),
            DisplayType::Virtual => (DRM_MODE_CONNECTOR_VIRTUAL, DRM_MODE_ENCODER_VIRTUAL),
        };
        let counter = self.type_counters.entry(connector_type).or_insert(0);
        *counter += 1;
        let type_id = *counter;

        let encoder = self.ids.alloc()?;
        let connector = self.ids.alloc()?;
        let mask = self.crtcs.get(&crtc).map(|c| c.mask()).unwrap_or(0);
        self.encoders.insert(
            encoder,
            EncoderObj {
                id: encoder,
                connector,
                encoder_type,
                possible_crtcs: mask,
            },
        );
        info!(
            "Connector {} for display {} ({} modes, {}x{} mm)",
            connector,
            info.id,
            modes.len(),
            width_mm,
            height_mm
        );
        self.connectors.insert(
            connector,
            ConnectorObj {
                id: connector,
                hal_display: info.id,
                encoder,
                connector_type,
                type_id,
                status: Connection::Connected,
                modes,
                hal_modes,
                width_mm,
                height_mm,
                state: Staged::new(ConnectorState::default()),
            },
        );
        self.displays.transition(info.id, DisplayPhase::Connected);
        Ok(AttachedDisplay {
            crtc,
            connector,
            new_crtc,
            changed: true,
        })
    }

    /// Remove a display's connector and encoder. Its CRTC and planes stay,
    /// switched off, for a future reconnect.
    pub(crate) fn detach_display(&mut self, hal_display: HalDisplayId) -> Option<DetachedDisplay> {
        let connector = self.connector_for_display(hal_display)?;
        let conn = self.connectors.remove(&connector)?;
        self.encoders.remove(&conn.encoder);
        self.displays.transition(hal_display, DisplayPhase::Disconnected);

        let crtc = self.crtc_for_display(hal_display)?;
        self.deactivate_crtc(crtc);
        // Connectors of other displays can still point here from a stale
        // staged state; the CRTC is off so validation rejects those commits.
        self.displays.transition(hal_display, DisplayPhase::Removed);
        info!("Display {} disconnected, connector {} removed", hal_display, connector);
        Some(DetachedDisplay { crtc, connector })
    }

    /// Switch a CRTC off and detach its planes, dropping their framebuffers
    pub(crate) fn deactivate_crtc(&mut self, crtc: ObjectId) {
        let Some(c) = self.crtcs.get_mut(&crtc) else {
            return;
        };
        c.state.reset(CrtcState::default());
        let planes = c.planes.clone();
        for id in planes {
            if let Some(plane) = self.planes.get_mut(&id) {
                let state = PlaneState {
                    zpos: plane.default_zpos,
                    ..Default::default()
                };
                plane.state.reset(state);
            }
        }
    }

    /// After a fatal HAL error every connector reads as disconnected
    pub(crate) fn mark_lost(&mut self, error: DeviceError) {
        self.lost = Some(error);
        for conn in self.connectors.values_mut() {
            conn.status = Connection::Disconnected;
            conn.state.staged = None;
            self.displays.transition(conn.hal_display, DisplayPhase::Disconnected);
        }
    }

    /// Release every framebuffer and blob reference, for shutdown
    pub(crate) fn clear(&mut self) {
        let crtcs: Vec<ObjectId> = self.crtcs.keys().copied().collect();
        for crtc in crtcs {
            self.deactivate_crtc(crtc);
            if let Some(c) = self.crtcs.get_mut(&crtc) {
                c.in_flight = None;
            }
        }
        self.framebuffers.clear();
        self.blobs.clear();
    }

    fn plane_info(&self, plane: &PlaneObj) -> PlaneInfo {
        let state = plane.state.current();
        let p = &self.props;
        let fb_id = state.fb.as_ref().map(|f| f.id);
        let properties = vec![
            p.value(Prop::Type, plane.plane_type.drm_value()),
            p.value(Prop::FbId, fb_id.map_or(0, |id| u64::from(id.raw()))),
            p.value(Prop::CrtcId, state.crtc.map_or(0, |id| u64::from(id.raw()))),
            p.value(Prop::SrcX, u64::from(state.src.x)),
            p.value(Prop::SrcY, u64::from(state.src.y)),
            p.value(Prop::SrcW, u64::from(state.src.width)),
            p.value(Prop::SrcH, u64::from(state.src.height)),
            p.value(Prop::CrtcX, i64::from(state.dst.x) as u64),
            p.value(Prop::CrtcY, i64::from(state.dst.y) as u64),
            p.value(Prop::CrtcW, u64::from(state.dst.width)),
            p.value(Prop::CrtcH, u64::from(state.dst.height)),
            p.value(Prop::Zpos, u64::from(state.zpos)),
        ];
        PlaneInfo {
            id: plane.id,
            plane_type: plane.plane_type,
            possible_crtcs: plane.possible_crtcs,
            formats: plane.formats.clone(),
            crtc_id: state.crtc,
            fb_id,
            src: state.src,
            dst: state.dst,
            zpos: state.zpos,
            properties,
        }
    }

    fn crtc_info(&self, crtc: &CrtcObj) -> CrtcInfo {
        let state = crtc.state.current();
        let p = &self.props;
        let properties = vec![
            p.value(Prop::Active, u64::from(state.active)),
            p.value(
                Prop::ModeId,
                state.mode.as_ref().map_or(0, |m| u64::from(m.blob.id.raw())),
            ),
            p.value(
                Prop::GammaLut,
                state.gamma.as_ref().map_or(0, |b| u64::from(b.id.raw())),
            ),
        ];
        let fb_id = self
            .primary_plane(crtc.id)
            .and_then(|id| self.planes.get(&id))
            .and_then(|plane| plane.state.current().fb.as_ref().map(|f| f.id));
        CrtcInfo {
            id: crtc.id,
            index: crtc.index,
            active: state.active,
            mode: state.mode_info().cloned(),
            fb_id,
            gamma_size: GAMMA_SIZE,
            planes: crtc.planes.clone(),
            properties,
        }
    }

    fn connector_info(&self, conn: &ConnectorObj) -> ConnectorInfo {
        let state = conn.state.current();
        let p = &self.props;
        let properties = vec![
            p.value(Prop::CrtcId, state.crtc.map_or(0, |id| u64::from(id.raw()))),
            p.value(Prop::Dpms, state.dpms),
        ];
        ConnectorInfo {
            id: conn.id,
            encoder_id: conn.encoder,
            connector_type: conn.connector_type,
            connector_type_id: conn.type_id,
            connection: conn.status,
            width_mm: conn.width_mm,
            height_mm: conn.height_mm,
            modes: conn.modes.clone(),
            crtc_id: state.crtc,
            properties,
        }
    }

    fn encoder_info(&self, enc: &EncoderObj) -> EncoderInfo {
        let crtc_id = self
            .connectors
            .get(&enc.connector)
            .and_then(|c| c.state.current().crtc);
        EncoderInfo {
            id: enc.id,
            encoder_type: enc.encoder_type,
            crtc_id,
            possible_crtcs: enc.possible_crtcs,
            possible_clones: 0,
        }
    }

    fn fb_info(fb: &Framebuffer) -> FramebufferInfo {
        FramebufferInfo {
            id: fb.id,
            width: fb.width,
            height: fb.height,
            pitch: fb.pitch,
            bpp: fb.format.bytes_per_pixel().unwrap_or(4) * 8,
            depth: fb.format.depth(),
            format: fb.format,
            modifier: fb.modifier,
            buffer_id: fb.bo.id(),
        }
    }

    /// Look up one object
    pub fn get(&self, raw: u32) -> std::result::Result<DrmObject, ValidationError> {
        let (id, _) = self.resolve(raw)?;
        if let Some(c) = self.connectors.get(&id) {
            return Ok(DrmObject::Connector(self.connector_info(c)));
        }
        if let Some(e) = self.encoders.get(&id) {
            return Ok(DrmObject::Encoder(self.encoder_info(e)));
        }
        if let Some(c) = self.crtcs.get(&id) {
            return Ok(DrmObject::Crtc(self.crtc_info(c)));
        }
        if let Some(p) = self.planes.get(&id) {
            return Ok(DrmObject::Plane(self.plane_info(p)));
        }
        if let Some(fb) = self.framebuffers.get(&id) {
            return Ok(DrmObject::Framebuffer(Self::fb_info(fb)));
        }
        if let Some(b) = self.blobs.get(&id) {
            return Ok(DrmObject::Blob(BlobInfo {
                id,
                length: b.data.len(),
            }));
        }
        Err(ValidationError::NotFound(raw))
    }

    pub fn resources(&self) -> DrmResources {
        DrmResources {
            min_width: 1,
            max_width: self.max_fb_dimension,
            min_height: 1,
            max_height: self.max_fb_dimension,
            connectors: self.connectors.keys().copied().collect(),
            encoders: self.encoders.keys().copied().collect(),
            crtcs: self.crtcs.keys().copied().collect(),
            planes: self.planes.keys().copied().collect(),
            fbs: self.framebuffers.keys().copied().collect(),
        }
    }

    /// Snapshot of the whole graph
    pub fn enumerate(&self) -> ObjectSnapshot {
        let mut objects = Vec::new();
        objects.extend(
            self.connectors
                .values()
                .map(|c| DrmObject::Connector(self.connector_info(c))),
        );
        objects.extend(
            self.encoders
                .values()
                .map(|e| DrmObject::Encoder(self.encoder_info(e))),
        );
        objects.extend(self.crtcs.values().map(|c| DrmObject::Crtc(self.crtc_info(c))));
        objects.extend(self.planes.values().map(|p| DrmObject::Plane(self.plane_info(p))));
        objects.extend(
            self.framebuffers
                .values()
                .map(|fb| DrmObject::Framebuffer(Self::fb_info(fb))),
        );
        objects.extend(self.blobs.values().map(|b| {
            DrmObject::Blob(BlobInfo {
                id: b.id,
                length: b.data.len(),
            })
        }));
        ObjectSnapshot {
            resources: self.resources(),
            objects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gbm_device::{HwcGbmDevice, NativeBuffer};
    use crate::hal::mock::{phone_display, MockHal};

    fn model_with_display() -> (ObjectModel, AttachedDisplay) {
        let mut model = ObjectModel::new(&ShimConfig::default()).unwrap();
        let (info, modes) = phone_display(0);
        let attached = model.attach_display(&info, modes, None).unwrap();
        (model, attached)
    }

    #[test]
    fn test_ids_are_monotonic_and_typed() {
        let (mut model, attached) = model_with_display();
        assert!(attached.new_crtc);
        assert_eq!(model.object_type(attached.crtc), Some(ObjectType::Crtc));
        assert_eq!(
            model.object_type(attached.connector),
            Some(ObjectType::Connector)
        );
        let blob = model.create_blob(vec![1, 2, 3]).unwrap();
        assert!(blob > attached.connector);
        model.destroy_blob(blob.raw()).unwrap();
        let next = model.create_blob(vec![]).unwrap();
        assert!(next > blob);
        assert_eq!(model.get(blob.raw()), Err(ValidationError::NotFound(blob.raw())));
    }

    #[test]
    fn test_plane_layout() {
        let (model, attached) = model_with_display();
        let snapshot = model.enumerate();
        let crtc = snapshot.crtcs().next().unwrap();
        assert_eq!(crtc.planes.len(), 5);
        let types: Vec<PlaneType> = snapshot.planes().map(|p| p.plane_type).collect();
        assert_eq!(types[0], PlaneType::Primary);
        assert_eq!(types[4], PlaneType::Cursor);
        assert!(snapshot.planes().all(|p| p.possible_crtcs == 1));
        let connector = snapshot.connectors().next().unwrap();
        assert_eq!(connector.id, attached.connector);
        assert_eq!(connector.connection, Connection::Connected);
        assert_eq!(connector.modes.len(), 2);
        assert!(connector.modes[0].is_preferred());
        assert_eq!(connector.connector_type, DRM_MODE_CONNECTOR_DSI);
    }

    #[test]
    fn test_enumerate_is_idempotent() {
        let (model, _) = model_with_display();
        assert_eq!(model.enumerate(), model.enumerate());
    }

    #[test]
    fn test_set_property_stages_only() {
        let (mut model, attached) = model_with_display();
        let plane = model.primary_plane(attached.crtc).unwrap();
        let zpos = model.property_id(Prop::Zpos);
        model.set_property(plane.raw(), zpos.raw(), 3).unwrap();

        let p = &model.planes[&plane];
        assert_eq!(p.state.current().zpos, 3);
        assert_eq!(p.state.committed().zpos, 0);
        assert_eq!(model.get(plane.raw()).unwrap().property("zpos"), Some(3));

        model.discard_staged();
        assert_eq!(model.get(plane.raw()).unwrap().property("zpos"), Some(0));
    }

    #[test]
    fn test_set_property_validation() {
        let (mut model, attached) = model_with_display();
        let plane = model.primary_plane(attached.crtc).unwrap().raw();
        let crtc = attached.crtc.raw();

        assert_eq!(
            model.set_property(9999, model.property_id(Prop::Zpos).raw(), 0),
            Err(ValidationError::NotFound(9999))
        );
        assert!(matches!(
            model.set_property(plane, model.property_id(Prop::Type).raw(), 0),
            Err(ValidationError::Property(PropertyError::Immutable("type")))
        ));
        assert!(matches!(
            model.set_property(crtc, model.property_id(Prop::Zpos).raw(), 0),
            Err(ValidationError::Property(PropertyError::NotAttached { .. }))
        ));
        assert!(matches!(
            model.set_property(plane, model.property_id(Prop::FbId).raw(), 4242),
            Err(ValidationError::Property(PropertyError::UnknownObject { .. }))
        ));
        let junk = model.create_blob(vec![0; 12]).unwrap();
        assert!(matches!(
            model.set_property(crtc, model.property_id(Prop::ModeId).raw(), u64::from(junk.raw())),
            Err(ValidationError::Property(PropertyError::InvalidBlob { .. }))
        ));
        assert!(matches!(
            model.set_property(plane, 1234, 0),
            Err(ValidationError::Property(PropertyError::UnknownProperty(1234)))
        ));
    }

    #[test]
    fn test_staged_layers() {
        let mut state = Staged::new(1u32);
        *state.stage_mut() = 2;
        assert_eq!(*state.current(), 2);
        assert_eq!(*state.latest(), 1);

        state.begin(2);
        assert!(state.is_pending());
        assert!(!state.is_staged());
        *state.stage_mut() = 3;
        state.settle(false);
        assert_eq!(*state.current(), 1);

        state.begin(5);
        state.settle(true);
        assert_eq!(*state.committed(), 5);
    }

    #[test]
    fn test_framebuffer_keeps_buffer_alive() {
        let hal = Arc::new(MockHal::new());
        let gbm = HwcGbmDevice::new(hal.clone(), &ShimConfig::default()).unwrap();
        let (mut model, attached) = model_with_display();
        let bo = gbm.create_bo(64, 64, Fourcc::ARGB8888, 0).unwrap().accept();

        let fb = model.add_framebuffer(&bo, Fourcc::XRGB8888).unwrap();
        assert!(model.add_framebuffer(&bo, Fourcc::XBGR8888).is_err());
        drop(bo);

        let plane = model.primary_plane(attached.crtc).unwrap();
        let fb_prop = model.property_id(Prop::FbId);
        model
            .set_property(plane.raw(), fb_prop.raw(), u64::from(fb.raw()))
            .unwrap();
        let removed = model.remove_framebuffer(fb.raw()).unwrap();
        assert!(!removed.bo.is_freed());
        drop(removed);

        let staged = model.planes[&plane].state.current().fb.clone().unwrap();
        assert_eq!(staged.id, fb);
        assert!(!staged.bo.is_freed());
        assert!(model.framebuffer(fb).is_none());
    }

    #[test]
    fn test_framebuffer_rejects_short_pitch() {
        let hal = Arc::new(MockHal::new());
        let gbm = HwcGbmDevice::new(hal.clone(), &ShimConfig::default()).unwrap();
        let (mut model, _) = model_with_display();
        let native = hal
            .create_native_buffer(64, 64, crate::hal::HAL_PIXEL_FORMAT_RGBA_8888, 0)
            .unwrap();
        // A HAL reporting a stride narrower than the buffer
        let short = NativeBuffer { stride: 16, ..native };
        let bo = gbm.wrap_native(&short).unwrap();

        let err = model.add_framebuffer(&bo, Fourcc::ABGR8888).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Validation(ValidationError::Framebuffer(_))
        ));
        assert!(model.enumerate().resources.fbs.is_empty());
    }

    #[test]
    fn test_detach_keeps_crtc() {
        let (mut model, attached) = model_with_display();
        let detached = model.detach_display(0).unwrap();
        assert_eq!(detached.crtc, attached.crtc);
        let snapshot = model.enumerate();
        assert_eq!(snapshot.connectors().count(), 0);
        assert!(snapshot.resources.encoders.is_empty());
        assert_eq!(snapshot.crtcs().next().unwrap().id, attached.crtc);
        assert_eq!(model.displays.phase(0), DisplayPhase::Removed);

        let (info, modes) = phone_display(0);
        let again = model.attach_display(&info, modes, None).unwrap();
        assert_eq!(again.crtc, attached.crtc);
        assert!(!again.new_crtc);
        assert!(again.connector > attached.connector);
    }

    #[test]
    fn test_fallback_mode() {
        let mut model = ObjectModel::new(&ShimConfig::default()).unwrap();
        let (info, _) = phone_display(3);
        model
            .attach_display(&info, Vec::new(), Some((720, 1440, 60)))
            .unwrap();
        let snapshot = model.enumerate();
        let conn = snapshot.connectors().next().unwrap();
        assert_eq!(conn.modes[0].hdisplay, 720);
        assert_eq!(conn.connector_type, DRM_MODE_CONNECTOR_HDMIA);
    }

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0, 0, 100, 100);
        assert!(a.intersects(&Rect::new(50, 50, 100, 100)));
        assert!(!a.intersects(&Rect::new(100, 0, 10, 10)));
        assert!(!a.intersects(&Rect::new(10, 10, 0, 10)));
        assert!(SrcRect::from_pixels(0, 0, 64, 64).fits_within(64, 64));
        assert!(!SrcRect::from_pixels(1, 0, 64, 64).fits_within(64, 64));
    }
}
