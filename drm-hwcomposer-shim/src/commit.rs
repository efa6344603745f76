//! Atomic commits
//!
//! A commit is resolved against the staged object state, validated as a
//! whole, and only then handed to the per-CRTC present workers. Nothing in
//! the model changes for a commit that fails validation or is `TEST_ONLY`.

use crate::error::CommitError;
use crate::hal::{HalConfigId, HalDisplayId};
use crate::model::{
    apply_connector, apply_crtc, apply_plane, Connection, ConnectorState, CrtcState, Framebuffer,
    ObjectId, ObjectModel, ObjectType, PlaneState, PlaneType, Rect, SrcRect,
};
use crate::property::Prop;
use crate::worker::PresentJob;
use crossbeam_channel::Sender;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;
pub const DRM_MODE_ATOMIC_TEST_ONLY: u32 = 0x0100;
pub const DRM_MODE_ATOMIC_NONBLOCK: u32 = 0x0200;
pub const DRM_MODE_ATOMIC_ALLOW_MODESET: u32 = 0x0400;

const KNOWN_FLAGS: u32 = DRM_MODE_PAGE_FLIP_EVENT
    | DRM_MODE_ATOMIC_TEST_ONLY
    | DRM_MODE_ATOMIC_NONBLOCK
    | DRM_MODE_ATOMIC_ALLOW_MODESET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Raw { object: u32, property: u32, value: u64 },
    Typed { object: ObjectId, prop: Prop, value: u64 },
}

/// An atomic property update, the equivalent of `drmModeAtomicReq`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitRequest {
    entries: Vec<Entry>,
    pub flags: u32,
    pub user_data: u64,
}

/// Everything needed to put one framebuffer on one plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneUpdate {
    pub plane: ObjectId,
    pub crtc: Option<ObjectId>,
    pub fb: Option<ObjectId>,
    pub src: SrcRect,
    pub dst: Rect,
    pub zpos: Option<u32>,
}

impl PlaneUpdate {
    pub fn new(plane: ObjectId, crtc: ObjectId, fb: ObjectId, src: SrcRect, dst: Rect) -> Self {
        Self {
            plane,
            crtc: Some(crtc),
            fb: Some(fb),
            src,
            dst,
            zpos: None,
        }
    }

    /// Detach the plane from its CRTC
    pub fn disable(plane: ObjectId) -> Self {
        Self {
            plane,
            crtc: None,
            fb: None,
            src: SrcRect::default(),
            dst: Rect::default(),
            zpos: None,
        }
    }

    pub fn with_zpos(mut self, zpos: u32) -> Self {
        self.zpos = Some(zpos);
        self
    }
}

fn id_value(id: Option<ObjectId>) -> u64 {
    id.map_or(0, |id| u64::from(id.raw()))
}

impl CommitRequest {
    pub fn new(flags: u32) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    /// Add a raw `(object, property, value)` triple as a client would
    pub fn add_property(&mut self, object: u32, property: u32, value: u64) -> &mut Self {
        self.entries.push(Entry::Raw {
            object,
            property,
            value,
        });
        self
    }

    pub fn set(&mut self, object: ObjectId, prop: Prop, value: u64) -> &mut Self {
        self.entries.push(Entry::Typed {
            object,
            prop,
            value,
        });
        self
    }

    pub fn plane(&mut self, update: PlaneUpdate) -> &mut Self {
        let p = update.plane;
        self.set(p, Prop::FbId, id_value(update.fb))
            .set(p, Prop::CrtcId, id_value(update.crtc))
            .set(p, Prop::SrcX, u64::from(update.src.x))
            .set(p, Prop::SrcY, u64::from(update.src.y))
            .set(p, Prop::SrcW, u64::from(update.src.width))
            .set(p, Prop::SrcH, u64::from(update.src.height))
            .set(p, Prop::CrtcX, i64::from(update.dst.x) as u64)
            .set(p, Prop::CrtcY, i64::from(update.dst.y) as u64)
            .set(p, Prop::CrtcW, u64::from(update.dst.width))
            .set(p, Prop::CrtcH, u64::from(update.dst.height));
        if let Some(zpos) = update.zpos {
            self.set(p, Prop::Zpos, u64::from(zpos));
        }
        self
    }

    pub fn crtc(&mut self, crtc: ObjectId, active: bool, mode_blob: Option<ObjectId>) -> &mut Self {
        self.set(crtc, Prop::Active, u64::from(active))
            .set(crtc, Prop::ModeId, id_value(mode_blob))
    }

    pub fn connector(&mut self, connector: ObjectId, crtc: Option<ObjectId>) -> &mut Self {
        self.set(connector, Prop::CrtcId, id_value(crtc))
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_test_only(&self) -> bool {
        self.flags & DRM_MODE_ATOMIC_TEST_ONLY != 0
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags & DRM_MODE_ATOMIC_NONBLOCK != 0
    }

    pub fn allows_modeset(&self) -> bool {
        self.flags & DRM_MODE_ATOMIC_ALLOW_MODESET != 0
    }
}

/// How a CRTC's layers reached the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composition {
    /// Every plane went to the HAL as its own layer
    Device,
    /// The bottom `flattened` planes were drawn into one buffer first
    Client { flattened: usize },
    /// The CRTC was switched off
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcOutcome {
    pub crtc: ObjectId,
    pub composition: Composition,
    /// Per-CRTC flip counter, starting at 1
    pub sequence: u64,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// `TEST_ONLY`: the commit is valid; the composition each CRTC is
    /// expected to need, without asking the HAL
    Tested {
        predictions: Vec<(ObjectId, Composition)>,
    },
    /// `NONBLOCK`: queued; completion arrives as FlipComplete events
    Queued { commit_id: u64, crtcs: Vec<ObjectId> },
    Completed {
        commit_id: u64,
        outcomes: Vec<CrtcOutcome>,
    },
}

/// Objects whose pending state a commit will settle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommitObjects {
    pub(crate) planes: Vec<ObjectId>,
    pub(crate) crtcs: Vec<ObjectId>,
    pub(crate) connectors: Vec<ObjectId>,
}

impl CommitObjects {
    pub(crate) fn is_empty(&self) -> bool {
        self.planes.is_empty() && self.crtcs.is_empty() && self.connectors.is_empty()
    }

    pub(crate) fn extend(&mut self, other: CommitObjects) {
        self.planes.extend(other.planes);
        self.crtcs.extend(other.crtcs);
        self.connectors.extend(other.connectors);
    }

    /// Fold pending state into committed, or drop it on rejection
    pub(crate) fn settle(&self, model: &mut ObjectModel, accepted: bool) {
        for id in &self.planes {
            if let Some(plane) = model.planes.get_mut(id) {
                plane.state.settle(accepted);
            }
        }
        for id in &self.crtcs {
            if let Some(crtc) = model.crtcs.get_mut(id) {
                crtc.state.settle(accepted);
            }
        }
        for id in &self.connectors {
            if let Some(conn) = model.connectors.get_mut(id) {
                conn.state.settle(accepted);
            }
        }
    }
}

pub(crate) type CommitReply = Sender<Result<CrtcOutcome, CommitError>>;

/// The commit a CRTC is waiting on
pub(crate) struct InFlight {
    pub(crate) commit_id: u64,
    pub(crate) started: Instant,
    pub(crate) objects: CommitObjects,
    pub(crate) user_data: u64,
    pub(crate) reply: Option<CommitReply>,
    /// Every CRTC of the commit; none settles before all have reported
    pub(crate) group: Arc<[ObjectId]>,
    /// Re-presenting committed state after the rest of the group failed
    pub(crate) restoring: bool,
}

impl InFlight {
    pub(crate) fn restoring(commit_id: u64, crtc: ObjectId) -> Self {
        Self {
            commit_id,
            started: Instant::now(),
            objects: CommitObjects::default(),
            user_data: 0,
            reply: None,
            group: Arc::from(vec![crtc]),
            restoring: true,
        }
    }
}

/// New state for every object a commit touches, built from staged state
/// plus the request's own properties
#[derive(Default)]
pub(crate) struct Proposal {
    planes: BTreeMap<ObjectId, PlaneState>,
    crtcs: BTreeMap<ObjectId, CrtcState>,
    connectors: BTreeMap<ObjectId, ConnectorState>,
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedLayer {
    pub(crate) plane: ObjectId,
    pub(crate) plane_type: PlaneType,
    pub(crate) fb: Arc<Framebuffer>,
    pub(crate) src: SrcRect,
    pub(crate) dst: Rect,
    pub(crate) zpos: u32,
}

/// What one CRTC has to do for a commit
#[derive(Debug)]
pub(crate) struct CrtcPlan {
    pub(crate) crtc: ObjectId,
    pub(crate) display: HalDisplayId,
    pub(crate) active: bool,
    pub(crate) power_change: Option<bool>,
    pub(crate) config: Option<HalConfigId>,
    pub(crate) mode_size: (u32, u32),
    pub(crate) layers: Vec<PlannedLayer>,
    pub(crate) max_device_layers: Option<usize>,
    pub(crate) objects: CommitObjects,
}

impl CrtcPlan {
    pub(crate) fn predict(&self) -> Composition {
        if !self.active {
            return Composition::Disabled;
        }
        match self.max_device_layers {
            Some(limit) => match split_layers(self.layers.len(), Some(limit)) {
                0 => Composition::Device,
                n => Composition::Client { flattened: n },
            },
            None => Composition::Device,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Plan {
    pub(crate) crtcs: Vec<CrtcPlan>,
    /// Objects that end up on no CRTC at all
    pub(crate) unbound: CommitObjects,
}

/// How many of the bottom layers to flatten so that at most `limit` layers
/// reach the HAL. With no usable limit everything is flattened.
pub fn split_layers(count: usize, limit: Option<usize>) -> usize {
    match limit {
        Some(l) if count <= l => 0,
        Some(l) if l >= 2 => count - l + 1,
        _ => count,
    }
}

fn plane_view<'a>(model: &'a ObjectModel, proposal: &'a Proposal, id: ObjectId) -> Option<&'a PlaneState> {
    proposal
        .planes
        .get(&id)
        .or_else(|| model.planes.get(&id).map(|p| p.state.current()))
}

fn crtc_view<'a>(model: &'a ObjectModel, proposal: &'a Proposal, id: ObjectId) -> Option<&'a CrtcState> {
    proposal
        .crtcs
        .get(&id)
        .or_else(|| model.crtcs.get(&id).map(|c| c.state.current()))
}

fn connector_view<'a>(
    model: &'a ObjectModel,
    proposal: &'a Proposal,
    id: ObjectId,
) -> Option<&'a ConnectorState> {
    proposal
        .connectors
        .get(&id)
        .or_else(|| model.connectors.get(&id).map(|c| c.state.current()))
}

/// Build the proposed state: everything staged through `set_property`, with
/// the request's properties applied on top
pub(crate) fn resolve(model: &ObjectModel, req: &CommitRequest) -> Result<Proposal, CommitError> {
    if let Some(lost) = &model.lost {
        return Err(CommitError::Device(lost.clone()));
    }
    if req.flags & !KNOWN_FLAGS != 0 {
        return Err(CommitError::invalid(0u32, format!("unknown flags {:#x}", req.flags)));
    }
    if req.is_test_only() && req.flags & DRM_MODE_PAGE_FLIP_EVENT != 0 {
        return Err(CommitError::invalid(0u32, "TEST_ONLY cannot request a flip event"));
    }

    let mut proposal = Proposal::default();
    for plane in model.planes.values().filter(|p| p.state.is_staged()) {
        proposal.planes.insert(plane.id, plane.state.current().clone());
    }
    for crtc in model.crtcs.values().filter(|c| c.state.is_staged()) {
        proposal.crtcs.insert(crtc.id, crtc.state.current().clone());
    }
    for conn in model.connectors.values().filter(|c| c.state.is_staged()) {
        proposal.connectors.insert(conn.id, conn.state.current().clone());
    }

    for entry in &req.entries {
        let (id, ty, prop, value) = match *entry {
            Entry::Raw {
                object,
                property,
                value,
            } => {
                let (id, ty, prop) = model
                    .settable(object, property)
                    .map_err(|e| CommitError::invalid(object, e))?;
                (id, ty, prop, value)
            }
            Entry::Typed { object, prop, value } => {
                let ty = model
                    .object_type(object)
                    .ok_or_else(|| CommitError::invalid(object, "no such object"))?;
                if !prop.applies_to(ty) || prop.is_immutable() {
                    return Err(CommitError::invalid(
                        object,
                        format!("property {} cannot be set on a {:?}", prop.name(), ty),
                    ));
                }
                (object, ty, prop, value)
            }
        };
        let decoded = model
            .decode(prop, value)
            .map_err(|e| CommitError::invalid(id, e))?;
        match ty {
            ObjectType::Plane => {
                if let Some(plane) = model.planes.get(&id) {
                    let state = proposal
                        .planes
                        .entry(id)
                        .or_insert_with(|| plane.state.current().clone());
                    apply_plane(state, prop, decoded);
                }
            }
            ObjectType::Crtc => {
                if let Some(crtc) = model.crtcs.get(&id) {
                    let state = proposal
                        .crtcs
                        .entry(id)
                        .or_insert_with(|| crtc.state.current().clone());
                    apply_crtc(state, prop, decoded);
                }
            }
            ObjectType::Connector => {
                if let Some(conn) = model.connectors.get(&id) {
                    let state = proposal
                        .connectors
                        .entry(id)
                        .or_insert_with(|| conn.state.current().clone());
                    apply_connector(state, prop, decoded);
                }
            }
            _ => {}
        }
    }
    Ok(proposal)
}

fn validate_plane(
    model: &ObjectModel,
    id: ObjectId,
    state: &PlaneState,
) -> Result<(), CommitError> {
    let Some(plane) = model.planes.get(&id) else {
        return Err(CommitError::invalid(id, "no such plane"));
    };
    let (crtc, fb) = match (state.crtc, &state.fb) {
        (None, None) => return Ok(()),
        (Some(crtc), Some(fb)) => (crtc, fb),
        _ => {
            return Err(CommitError::invalid(
                id,
                "FB_ID and CRTC_ID must be set or cleared together",
            ))
        }
    };
    let Some(crtc_obj) = model.crtcs.get(&crtc) else {
        return Err(CommitError::invalid(crtc, "no such CRTC"));
    };
    if plane.possible_crtcs & crtc_obj.mask() == 0 {
        return Err(CommitError::invalid(
            id,
            format!("plane cannot be used on CRTC {}", crtc),
        ));
    }
    if !plane.formats.contains(&fb.format) || !crtc_obj.formats.contains(&fb.format) {
        return Err(CommitError::invalid(
            id,
            format!("format {:?} is not supported here", fb.format),
        ));
    }
    let registered = model.framebuffers.contains_key(&fb.id);
    let on_screen = plane.state.latest().fb.as_ref().map(|f| f.id) == Some(fb.id);
    if !registered && !on_screen {
        return Err(CommitError::invalid(fb.id, "framebuffer was removed"));
    }
    if state.src.is_empty() || state.dst.is_empty() {
        return Err(CommitError::invalid(id, "empty source or destination rectangle"));
    }
    if !state.src.fits_within(fb.width, fb.height) {
        return Err(CommitError::invalid(
            id,
            format!("source rectangle exceeds the {}x{} framebuffer", fb.width, fb.height),
        ));
    }
    if plane.plane_type == PlaneType::Cursor
        && (state.dst.width > model.cursor_size || state.dst.height > model.cursor_size)
    {
        return Err(CommitError::invalid(
            id,
            format!("cursor larger than {}x{}", model.cursor_size, model.cursor_size),
        ));
    }
    Ok(())
}

fn plan_crtc(
    model: &ObjectModel,
    proposal: &Proposal,
    crtc: ObjectId,
    flags: u32,
) -> Result<CrtcPlan, CommitError> {
    let Some(crtc_obj) = model.crtcs.get(&crtc) else {
        return Err(CommitError::invalid(crtc, "no such CRTC"));
    };
    let state = crtc_view(model, proposal, crtc).unwrap_or_else(|| crtc_obj.state.latest());
    let latest = crtc_obj.state.latest();

    let mut layers = Vec::new();
    for &id in &crtc_obj.planes {
        let (Some(plane), Some(view)) = (model.planes.get(&id), plane_view(model, proposal, id))
        else {
            continue;
        };
        if let (Some(c), Some(fb)) = (view.crtc, &view.fb) {
            if c == crtc {
                layers.push(PlannedLayer {
                    plane: id,
                    plane_type: plane.plane_type,
                    fb: Arc::clone(fb),
                    src: view.src,
                    dst: view.dst,
                    zpos: view.zpos,
                });
            }
        }
    }
    layers.sort_by_key(|l| (l.zpos, l.plane));

    let bound: Vec<ObjectId> = model
        .connectors
        .keys()
        .copied()
        .filter(|&id| connector_view(model, proposal, id).and_then(|s| s.crtc) == Some(crtc))
        .collect();
    let binding_changed = proposal.connectors.iter().any(|(id, s)| {
        let old = model.connectors.get(id).and_then(|c| c.state.latest().crtc);
        old != s.crtc && (old == Some(crtc) || s.crtc == Some(crtc))
    });

    let mut config = None;
    let mut mode_size = (0, 0);
    let mut mode_changed = false;
    if state.active {
        let mode = state
            .mode_info()
            .ok_or_else(|| CommitError::invalid(crtc, "active CRTC needs a MODE_ID"))?;
        let &[connector] = bound.as_slice() else {
            return Err(CommitError::invalid(
                crtc,
                format!("active CRTC needs exactly one connector, found {}", bound.len()),
            ));
        };
        let Some(conn) = model.connectors.get(&connector) else {
            return Err(CommitError::invalid(connector, "no such connector"));
        };
        if conn.status != Connection::Connected {
            return Err(CommitError::invalid(connector, "connector is disconnected"));
        }
        let encoder_ok = model
            .encoders
            .get(&conn.encoder)
            .is_some_and(|e| e.possible_crtcs & crtc_obj.mask() != 0);
        if !encoder_ok {
            return Err(CommitError::invalid(
                connector,
                format!("connector cannot be driven by CRTC {}", crtc),
            ));
        }
        let index = conn
            .modes
            .iter()
            .position(|m| m.same_timing(mode))
            .ok_or_else(|| CommitError::invalid(crtc, format!("mode {} not supported", mode.name)))?;
        mode_changed = !latest.active || latest.mode_info().map_or(true, |m| !m.same_timing(mode));
        config = conn.hal_modes.get(index).map(|m| m.config_id);
        mode_size = (u32::from(mode.hdisplay), u32::from(mode.vdisplay));

        for (i, a) in layers.iter().enumerate() {
            if let Some(b) = layers[i + 1..]
                .iter()
                .find(|b| b.zpos == a.zpos && b.dst.intersects(&a.dst))
            {
                return Err(CommitError::invalid(
                    b.plane,
                    format!("overlaps plane {} at zpos {}", a.plane, a.zpos),
                ));
            }
        }
    } else {
        if let Some(layer) = layers.first() {
            return Err(CommitError::invalid(
                layer.plane,
                format!("plane enabled on inactive CRTC {}", crtc),
            ));
        }
        if let Some(&connector) = bound.first() {
            return Err(CommitError::invalid(
                connector,
                format!("connector bound to inactive CRTC {}", crtc),
            ));
        }
    }

    let active_changed = state.active != latest.active;
    if (active_changed || mode_changed || binding_changed) && flags & DRM_MODE_ATOMIC_ALLOW_MODESET == 0
    {
        return Err(CommitError::invalid(crtc, "modeset requires ALLOW_MODESET"));
    }

    Ok(CrtcPlan {
        crtc,
        display: crtc_obj.hal_display,
        active: state.active,
        power_change: active_changed.then_some(state.active),
        config: if mode_changed { config } else { None },
        mode_size,
        layers,
        max_device_layers: crtc_obj.max_device_layers,
        objects: CommitObjects::default(),
    })
}

/// Check a proposal as a whole and work out what each affected CRTC must do
pub(crate) fn validate(
    model: &ObjectModel,
    proposal: &Proposal,
    flags: u32,
) -> Result<Plan, CommitError> {
    for (&id, state) in &proposal.planes {
        validate_plane(model, id, state)?;
    }

    // A CRTC is touched if any object moves onto or off it
    let mut touched: BTreeSet<ObjectId> = proposal.crtcs.keys().copied().collect();
    for (id, state) in &proposal.planes {
        let old = model.planes.get(id).and_then(|p| p.state.latest().crtc);
        touched.extend(old.into_iter().chain(state.crtc));
    }
    for (id, state) in &proposal.connectors {
        let old = model.connectors.get(id).and_then(|c| c.state.latest().crtc);
        touched.extend(old.into_iter().chain(state.crtc));
    }

    let mut crtcs = touched
        .iter()
        .map(|&crtc| plan_crtc(model, proposal, crtc, flags))
        .collect::<Result<Vec<_>, _>>()?;

    let mut unbound = CommitObjects::default();
    let owner = |new: Option<ObjectId>, old: Option<ObjectId>| new.or(old);
    for (&id, state) in &proposal.planes {
        let old = model.planes.get(&id).and_then(|p| p.state.latest().crtc);
        match crtcs
            .iter_mut()
            .find(|p| Some(p.crtc) == owner(state.crtc, old))
        {
            Some(plan) => plan.objects.planes.push(id),
            None => unbound.planes.push(id),
        }
    }
    for plan in crtcs.iter_mut() {
        if proposal.crtcs.contains_key(&plan.crtc) {
            plan.objects.crtcs.push(plan.crtc);
        }
    }
    for (&id, state) in &proposal.connectors {
        let old = model.connectors.get(&id).and_then(|c| c.state.latest().crtc);
        match crtcs
            .iter_mut()
            .find(|p| Some(p.crtc) == owner(state.crtc, old))
        {
            Some(plan) => plan.objects.connectors.push(id),
            None => unbound.connectors.push(id),
        }
    }
    Ok(Plan { crtcs, unbound })
}

/// What `stage` decided for a commit
pub(crate) enum Staging {
    Tested(Vec<(ObjectId, Composition)>),
    Queued {
        jobs: Vec<PresentJob>,
        /// Objects to settle without a present, when no CRTC is involved
        unbound: Option<CommitObjects>,
    },
}

/// Validate a commit and, unless it is `TEST_ONLY`, move its state to
/// pending and register it as in flight on every CRTC it touches
pub(crate) fn stage(
    model: &mut ObjectModel,
    req: &CommitRequest,
    commit_id: u64,
    reply: Option<&CommitReply>,
) -> Result<Staging, CommitError> {
    let proposal = resolve(model, req)?;
    let mut plan = validate(model, &proposal, req.flags)?;

    if req.is_test_only() {
        let predictions = plan.crtcs.iter().map(|p| (p.crtc, p.predict())).collect();
        return Ok(Staging::Tested(predictions));
    }

    for p in &plan.crtcs {
        if model.crtcs.get(&p.crtc).is_some_and(|c| c.in_flight.is_some()) {
            return Err(CommitError::Busy { crtc: p.crtc });
        }
    }

    let Proposal {
        planes,
        crtcs,
        connectors,
    } = proposal;
    for (id, state) in planes {
        if let Some(plane) = model.planes.get_mut(&id) {
            plane.state.begin(state);
        }
    }
    for (id, state) in crtcs {
        if let Some(crtc) = model.crtcs.get_mut(&id) {
            crtc.state.begin(state);
        }
    }
    for (id, state) in connectors {
        if let Some(conn) = model.connectors.get_mut(&id) {
            conn.state.begin(state);
        }
    }

    let mut unbound = Some(std::mem::take(&mut plan.unbound)).filter(|u| !u.is_empty());
    if let (Some(first), Some(objects)) = (plan.crtcs.first_mut(), unbound.take()) {
        first.objects.extend(objects);
    }

    let mut jobs = Vec::with_capacity(plan.crtcs.len());
    let started = Instant::now();
    let group: Arc<[ObjectId]> = plan.crtcs.iter().map(|p| p.crtc).collect();
    for p in plan.crtcs {
        if let Some(crtc) = model.crtcs.get_mut(&p.crtc) {
            crtc.in_flight = Some(InFlight {
                commit_id,
                started,
                objects: p.objects,
                user_data: req.user_data,
                reply: reply.cloned(),
                group: Arc::clone(&group),
                restoring: false,
            });
        }
        debug!(
            "Commit {} on CRTC {}: {} layers, power {:?}, config {:?}",
            commit_id,
            p.crtc,
            p.layers.len(),
            p.power_change,
            p.config
        );
        jobs.push(PresentJob {
            commit_id,
            crtc: p.crtc,
            display: p.display,
            active: p.active,
            power_change: p.power_change,
            config: p.config,
            mode_size: p.mode_size,
            layers: p.layers,
            max_device_layers: p.max_device_layers,
        });
    }
    Ok(Staging::Queued { jobs, unbound })
}

/// Put a CRTC's committed state back on its display, undoing its share of
/// a commit that another CRTC failed
pub(crate) fn restore_job(model: &ObjectModel, crtc: ObjectId, commit_id: u64) -> Option<PresentJob> {
    let crtc_obj = model.crtcs.get(&crtc)?;
    let state = crtc_obj.state.committed();
    let mut layers: Vec<PlannedLayer> = crtc_obj
        .planes
        .iter()
        .filter_map(|&id| {
            let plane = model.planes.get(&id)?;
            let view = plane.state.committed();
            let fb = view.fb.as_ref().filter(|_| view.crtc == Some(crtc))?;
            Some(PlannedLayer {
                plane: id,
                plane_type: plane.plane_type,
                fb: Arc::clone(fb),
                src: view.src,
                dst: view.dst,
                zpos: view.zpos,
            })
        })
        .collect();
    layers.sort_by_key(|l| (l.zpos, l.plane));

    let mode = state.mode_info().filter(|_| state.active);
    let config = mode.and_then(|mode| {
        let conn = model
            .connectors
            .values()
            .find(|c| c.state.committed().crtc == Some(crtc))?;
        let index = conn.modes.iter().position(|m| m.same_timing(mode))?;
        conn.hal_modes.get(index).map(|m| m.config_id)
    });
    Some(PresentJob {
        commit_id,
        crtc,
        display: crtc_obj.hal_display,
        active: state.active,
        power_change: None,
        config,
        mode_size: mode.map_or((0, 0), |m| (u32::from(m.hdisplay), u32::from(m.vdisplay))),
        layers,
        max_device_layers: crtc_obj.max_device_layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShimConfig;
    use crate::format::Fourcc;
    use crate::gbm_device::HwcGbmDevice;
    use crate::hal::mock::{phone_display, MockHal};
    use crate::model::AttachedDisplay;

    struct Fixture {
        model: ObjectModel,
        display: AttachedDisplay,
        gbm: HwcGbmDevice,
        mode: ObjectId,
        _hal: Arc<MockHal>,
    }

    fn fixture() -> Fixture {
        let config = ShimConfig::default();
        let hal = Arc::new(MockHal::new());
        let gbm = HwcGbmDevice::new(hal.clone(), &config).unwrap();
        let mut model = ObjectModel::new(&config).unwrap();
        let (info, modes) = phone_display(0);
        let display = model.attach_display(&info, modes, None).unwrap();
        let bytes = model.connectors[&display.connector].modes[0].to_bytes().to_vec();
        let mode = model.create_blob(bytes).unwrap();
        Fixture {
            model,
            display,
            gbm,
            mode,
            _hal: hal,
        }
    }

    impl Fixture {
        fn fb(&mut self, width: u32, height: u32, format: Fourcc) -> ObjectId {
            let bo = self.gbm.create_bo(width, height, format, 0).unwrap().accept();
            self.model.add_framebuffer(&bo, format).unwrap()
        }

        fn modeset(&self) -> CommitRequest {
            let mut req = CommitRequest::new(DRM_MODE_ATOMIC_ALLOW_MODESET);
            req.crtc(self.display.crtc, true, Some(self.mode))
                .connector(self.display.connector, Some(self.display.crtc));
            req
        }

        fn plane(&self, index: usize) -> ObjectId {
            self.model.crtcs[&self.display.crtc].planes[index]
        }

        fn settle_all(&mut self) {
            let crtcs: Vec<ObjectId> = self.model.crtcs.keys().copied().collect();
            for id in crtcs {
                let objects = self
                    .model
                    .crtcs
                    .get_mut(&id)
                    .and_then(|c| c.in_flight.take())
                    .map(|f| f.objects);
                if let Some(objects) = objects {
                    objects.settle(&mut self.model, true);
                }
            }
        }
    }

    fn full_screen(f: &Fixture, plane: ObjectId, fb: ObjectId) -> PlaneUpdate {
        PlaneUpdate::new(
            plane,
            f.display.crtc,
            fb,
            SrcRect::from_pixels(0, 0, 1080, 2340),
            Rect::new(0, 0, 1080, 2340),
        )
    }

    #[test]
    fn test_split_layers() {
        assert_eq!(split_layers(3, Some(4)), 0);
        assert_eq!(split_layers(5, Some(3)), 3);
        assert_eq!(split_layers(5, Some(2)), 4);
        assert_eq!(split_layers(5, Some(1)), 5);
        assert_eq!(split_layers(5, None), 5);
        assert_eq!(split_layers(0, None), 0);
    }

    #[test]
    fn test_modeset_stages_pending_state() {
        let mut f = fixture();
        let fb = f.fb(1080, 2340, Fourcc::XRGB8888);
        let mut req = f.modeset();
        req.plane(full_screen(&f, f.plane(0), fb));

        let Staging::Queued { jobs, unbound } = stage(&mut f.model, &req, 1, None).unwrap() else {
            panic!("expected queued commit");
        };
        assert!(unbound.is_none());
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.power_change, Some(true));
        assert_eq!(job.config, Some(0));
        assert_eq!(job.mode_size, (1080, 2340));
        assert_eq!(job.layers.len(), 1);

        let crtc = &f.model.crtcs[&f.display.crtc];
        assert!(crtc.state.is_pending());
        assert!(!crtc.state.committed().active);
        let objects = &crtc.in_flight.as_ref().unwrap().objects;
        assert_eq!(objects.crtcs, vec![f.display.crtc]);
        assert_eq!(objects.connectors, vec![f.display.connector]);

        f.settle_all();
        assert!(f.model.crtcs[&f.display.crtc].state.committed().active);
    }

    #[test]
    fn test_modeset_requires_flag() {
        let mut f = fixture();
        let req = f.modeset().with_flags(0);
        let err = stage(&mut f.model, &req, 1, None).err().unwrap();
        assert!(matches!(err, CommitError::Invalid { .. }));
        assert!(!f.model.crtcs[&f.display.crtc].state.is_pending());
    }

    #[test]
    fn test_test_only_changes_nothing() {
        let mut f = fixture();
        let fb = f.fb(1080, 2340, Fourcc::XRGB8888);
        let mut req = f.modeset().with_flags(DRM_MODE_ATOMIC_ALLOW_MODESET | DRM_MODE_ATOMIC_TEST_ONLY);
        req.plane(full_screen(&f, f.plane(0), fb));
        let before = f.model.enumerate();

        let Staging::Tested(predictions) = stage(&mut f.model, &req, 1, None).unwrap() else {
            panic!("expected a test result");
        };
        assert_eq!(predictions, vec![(f.display.crtc, Composition::Device)]);
        assert_eq!(f.model.enumerate(), before);
        assert!(f.model.crtcs[&f.display.crtc].in_flight.is_none());
    }

    #[test]
    fn test_busy_while_in_flight() {
        let mut f = fixture();
        let req = f.modeset();
        stage(&mut f.model, &req, 1, None).unwrap();
        let err = stage(&mut f.model, &req, 2, None).err().unwrap();
        assert_eq!(err, CommitError::Busy { crtc: f.display.crtc });
    }

    #[test]
    fn test_plane_rules() {
        let mut f = fixture();
        let fb = f.fb(256, 256, Fourcc::XRGB8888);
        let modeset = f.modeset();
        stage(&mut f.model, &modeset, 1, None).unwrap();
        f.settle_all();

        let check = |f: &mut Fixture, update: PlaneUpdate| {
            let mut req = CommitRequest::new(0);
            req.plane(update);
            stage(&mut f.model, &req, 2, None).err()
        };

        // Source larger than the framebuffer
        let too_big = PlaneUpdate::new(
            f.plane(1),
            f.display.crtc,
            fb,
            SrcRect::from_pixels(0, 0, 512, 256),
            Rect::new(0, 0, 512, 256),
        );
        assert!(check(&mut f, too_big).is_some());

        // Cursor only takes ARGB and at most 64x64
        let cursor = f.plane(4);
        let argb = f.fb(128, 128, Fourcc::ARGB8888);
        let wrong_format = PlaneUpdate::new(
            cursor,
            f.display.crtc,
            fb,
            SrcRect::from_pixels(0, 0, 64, 64),
            Rect::new(0, 0, 64, 64),
        );
        assert!(check(&mut f, wrong_format).is_some());
        let oversized = PlaneUpdate::new(
            cursor,
            f.display.crtc,
            argb,
            SrcRect::from_pixels(0, 0, 128, 128),
            Rect::new(0, 0, 128, 128),
        );
        assert!(check(&mut f, oversized).is_some());

        // Half-set plane
        let mut req = CommitRequest::new(0);
        req.set(f.plane(1), Prop::FbId, u64::from(fb.raw()));
        assert!(stage(&mut f.model, &req, 3, None).is_err());

        // Two planes at the same zpos that overlap
        let a = PlaneUpdate::new(
            f.plane(1),
            f.display.crtc,
            fb,
            SrcRect::from_pixels(0, 0, 256, 256),
            Rect::new(0, 0, 256, 256),
        )
        .with_zpos(2);
        let b = PlaneUpdate { plane: f.plane(2), ..a };
        let mut req = CommitRequest::new(0);
        req.plane(a).plane(b);
        assert!(stage(&mut f.model, &req, 4, None).is_err());

        // Moved apart they are fine
        let b = PlaneUpdate {
            dst: Rect::new(300, 0, 256, 256),
            ..b
        };
        let mut req = CommitRequest::new(0);
        req.plane(a).plane(b);
        let Staging::Queued { jobs, .. } = stage(&mut f.model, &req, 5, None).unwrap() else {
            panic!("expected queued commit");
        };
        assert_eq!(jobs[0].layers.len(), 2);
        assert_eq!(jobs[0].power_change, None);
        assert_eq!(jobs[0].config, None);
    }

    #[test]
    fn test_plane_on_inactive_crtc_is_rejected() {
        let mut f = fixture();
        let fb = f.fb(1080, 2340, Fourcc::XRGB8888);
        let mut req = CommitRequest::new(DRM_MODE_ATOMIC_ALLOW_MODESET);
        req.plane(full_screen(&f, f.plane(0), fb));
        assert!(matches!(
            stage(&mut f.model, &req, 1, None),
            Err(CommitError::Invalid { .. })
        ));
    }

    #[test]
    fn test_raw_properties_and_unknown_flags() {
        let mut f = fixture();
        let active = f.model.property_id(Prop::Active).raw();
        let mut req = CommitRequest::new(DRM_MODE_ATOMIC_ALLOW_MODESET);
        req.add_property(f.display.crtc.raw(), active, 2);
        assert!(stage(&mut f.model, &req, 1, None).is_err());

        let req = CommitRequest::new(0x8000);
        assert!(stage(&mut f.model, &req, 1, None).is_err());

        let mut req = CommitRequest::new(0);
        req.add_property(9999, active, 1);
        assert_eq!(
            stage(&mut f.model, &req, 1, None).err(),
            Some(CommitError::invalid(9999u32, crate::error::ValidationError::NotFound(9999)))
        );
    }

    #[test]
    fn test_staged_properties_join_the_commit() {
        let mut f = fixture();
        let crtc = f.display.crtc.raw();
        let active = f.model.property_id(Prop::Active).raw();
        let mode_id = f.model.property_id(Prop::ModeId).raw();
        let crtc_id = f.model.property_id(Prop::CrtcId).raw();
        f.model.set_property(crtc, active, 1).unwrap();
        f.model
            .set_property(crtc, mode_id, u64::from(f.mode.raw()))
            .unwrap();
        f.model
            .set_property(f.display.connector.raw(), crtc_id, u64::from(crtc))
            .unwrap();

        let req = CommitRequest::new(DRM_MODE_ATOMIC_ALLOW_MODESET);
        let Staging::Queued { jobs, .. } = stage(&mut f.model, &req, 1, None).unwrap() else {
            panic!("expected queued commit");
        };
        assert_eq!(jobs[0].power_change, Some(true));
        assert!(!f.model.crtcs[&f.display.crtc].state.is_staged());
    }

    #[test]
    fn test_lost_device_refuses_commits() {
        let mut f = fixture();
        f.model.mark_lost(crate::error::DeviceError::HalCrashed("gone".into()));
        let modeset = f.modeset();
        assert!(matches!(
            stage(&mut f.model, &modeset, 1, None),
            Err(CommitError::Device(_))
        ));
    }

    #[test]
    fn test_prediction_uses_layer_limit() {
        let mut f = fixture();
        f.model
            .crtcs
            .get_mut(&f.display.crtc)
            .unwrap()
            .max_device_layers = Some(2);
        let fb = f.fb(1080, 2340, Fourcc::XRGB8888);
        let small = f.fb(64, 64, Fourcc::ARGB8888);
        let mut req = f.modeset().with_flags(DRM_MODE_ATOMIC_ALLOW_MODESET | DRM_MODE_ATOMIC_TEST_ONLY);
        req.plane(full_screen(&f, f.plane(0), fb));
        for (i, x) in [(1, 0), (2, 100)] {
            req.plane(PlaneUpdate::new(
                f.plane(i),
                f.display.crtc,
                small,
                SrcRect::from_pixels(0, 0, 64, 64),
                Rect::new(x, 0, 64, 64),
            ));
        }
        let Staging::Tested(predictions) = stage(&mut f.model, &req, 1, None).unwrap() else {
            panic!("expected a test result");
        };
        assert_eq!(
            predictions,
            vec![(f.display.crtc, Composition::Client { flattened: 2 })]
        );
    }
}
