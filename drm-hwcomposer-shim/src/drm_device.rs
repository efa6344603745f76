//! DRM device shim that wraps hwcomposer
//!
//! `HwcDrmDevice` is the compositor-facing side: object enumeration,
//! property staging, atomic commits, framebuffers and the event stream.
//! Behind it every CRTC has a present worker talking to the HAL and a single
//! dispatch thread folds HAL callbacks and present results back into the
//! object model.

use crate::commit::{
    self, CommitRequest, CommitResult, PlaneUpdate, Staging, DRM_MODE_ATOMIC_ALLOW_MODESET,
    DRM_MODE_ATOMIC_NONBLOCK, DRM_MODE_PAGE_FLIP_EVENT,
};
use crate::config::ShimConfig;
use crate::dispatch::{DispatchMsg, Dispatcher};
use crate::egl::{CpuGlBackend, EglBridge, GlBackend};
use crate::error::{CommitError, DeviceError, Error, ValidationError};
use crate::event::{EventHub, EventSource};
use crate::format::Fourcc;
use crate::gbm_device::{BufferObject, HwcGbmDevice, LeakedBuffer};
use crate::hal::{HalBridge, HalDisplayId};
use crate::hotplug::HotplugNotice;
use crate::mode::ModeInfo;
use crate::model::{
    DrmObject, DrmResources, ObjectId, ObjectModel, ObjectSnapshot, Rect, SrcRect,
};
use crate::property::{Prop, PropertyInfo};
use crate::worker::{CrtcCompletion, PresentWorker};
use crate::Result;
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const DRM_CAP_DUMB_BUFFER: u64 = 0x1;
pub const DRM_CAP_VBLANK_HIGH_CRTC: u64 = 0x2;
pub const DRM_CAP_DUMB_PREFERRED_DEPTH: u64 = 0x3;
pub const DRM_CAP_DUMB_PREFER_SHADOW: u64 = 0x4;
pub const DRM_CAP_PRIME: u64 = 0x5;
pub const DRM_CAP_TIMESTAMP_MONOTONIC: u64 = 0x6;
pub const DRM_CAP_ASYNC_PAGE_FLIP: u64 = 0x7;
pub const DRM_CAP_CURSOR_WIDTH: u64 = 0x8;
pub const DRM_CAP_CURSOR_HEIGHT: u64 = 0x9;
pub const DRM_CAP_ADDFB2_MODIFIERS: u64 = 0x10;
pub const DRM_CAP_CRTC_IN_VBLANK_EVENT: u64 = 0x12;

const DRM_PRIME_CAP_IMPORT: u64 = 0x1;
const DRM_PRIME_CAP_EXPORT: u64 = 0x2;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the device, its workers and the dispatch thread
pub(crate) struct Shared {
    pub(crate) config: ShimConfig,
    pub(crate) hal: Arc<dyn HalBridge>,
    pub(crate) gbm: HwcGbmDevice,
    pub(crate) egl: EglBridge,
    pub(crate) model: Mutex<ObjectModel>,
    pub(crate) events: EventHub,
    pub(crate) workers: Mutex<BTreeMap<ObjectId, PresentWorker>>,
    pub(crate) dispatch_tx: Sender<DispatchMsg>,
    /// First failure of a nonblocking commit nobody has collected yet
    pub(crate) async_failure: Mutex<Option<CommitError>>,
    next_commit: AtomicU64,
}

impl Shared {
    /// Start presenting on a CRTC: its worker thread and its display's
    /// vsync feed
    pub(crate) fn spawn_worker(&self, crtc: ObjectId) -> io::Result<()> {
        let display = lock(&self.model).crtcs.get(&crtc).map(|c| c.hal_display);
        let mut workers = lock(&self.workers);
        if workers.contains_key(&crtc) {
            return Ok(());
        }
        let worker = PresentWorker::spawn(
            crtc,
            Arc::clone(&self.hal),
            self.gbm.clone(),
            self.egl.clone(),
            self.dispatch_tx.clone(),
        )?;
        workers.insert(crtc, worker);
        drop(workers);

        if let Some(display) = display {
            self.watch_vsync(display);
        }
        Ok(())
    }

    fn watch_vsync(&self, display: HalDisplayId) {
        let tx = self.dispatch_tx.clone();
        self.hal.register_vsync_callback(
            display,
            Box::new(move |display, timestamp| {
                // Vsync is droppable; never block a HAL thread on it
                let _ = tx.try_send(DispatchMsg::Vsync {
                    display,
                    timestamp_ns: timestamp.max(0) as u64,
                });
            }),
        );
    }
}

/// What was still alive when the device closed
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub leaked: Vec<LeakedBuffer>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
    }
}

/// A virtual DRM device backed by hwcomposer
pub struct HwcDrmDevice {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HwcDrmDevice {
    /// Open a device: query the HAL's displays, build the object model and
    /// start the present workers and the dispatch thread
    pub fn open(
        hal: Arc<dyn HalBridge>,
        gl: Arc<dyn GlBackend>,
        config: ShimConfig,
    ) -> Result<Self> {
        info!("Creating HwcDrmDevice");

        let gbm = HwcGbmDevice::new(Arc::clone(&hal), &config)?;
        let egl = EglBridge::new(gl, gbm.clone());
        let mut model = ObjectModel::new(&config)?;

        let displays = hal.enumerate_displays()?;
        if displays.is_empty() {
            return Err(Error::NoDisplay);
        }
        let mut crtcs = Vec::with_capacity(displays.len());
        for info in &displays {
            let modes = hal.get_modes(info.id)?;
            let attached = model.attach_display(info, modes, config.fallback_mode())?;
            info!(
                "Display {} ({}) on CRTC {}, connector {}",
                info.id, info.name, attached.crtc, attached.connector
            );
            crtcs.push(attached.crtc);
        }

        let (dispatch_tx, dispatch_rx) = bounded(config.dispatch_queue_depth.max(1));
        let events = EventHub::new(&config);
        let shared = Arc::new(Shared {
            config,
            hal,
            gbm,
            egl,
            model: Mutex::new(model),
            events,
            workers: Mutex::new(BTreeMap::new()),
            dispatch_tx,
            async_failure: Mutex::new(None),
            next_commit: AtomicU64::new(1),
        });
        for crtc in crtcs {
            shared.spawn_worker(crtc)?;
        }

        let tx = shared.dispatch_tx.clone();
        shared
            .hal
            .register_hotplug_callback(Box::new(move |display, connected| {
                // Hotplugs must not be lost, so this blocks while the queue is full
                let _ = tx.send(DispatchMsg::Hotplug(HotplugNotice { display, connected }));
            }));

        let dispatcher = Dispatcher::new(Arc::clone(&shared), dispatch_rx);
        let handle = thread::Builder::new()
            .name("drm-dispatch".to_string())
            .spawn(move || dispatcher.run())?;

        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Open with the default configuration and the CPU GL backend
    pub fn with_defaults(hal: Arc<dyn HalBridge>) -> Result<Self> {
        Self::open(hal, Arc::new(CpuGlBackend::new()), ShimConfig::default())
    }

    pub fn config(&self) -> &ShimConfig {
        &self.shared.config
    }

    pub fn gbm(&self) -> &HwcGbmDevice {
        &self.shared.gbm
    }

    pub fn egl(&self) -> &EglBridge {
        &self.shared.egl
    }

    /// The fatal error the device stopped on, if any
    pub fn lost(&self) -> Option<DeviceError> {
        lock(&self.shared.model).lost.clone()
    }

    /// Take the error of a nonblocking commit that failed after it was
    /// queued. Its `CommitFailed` event carries no reason.
    pub fn take_async_failure(&self) -> Option<CommitError> {
        lock(&self.shared.async_failure).take()
    }

    fn model(&self) -> MutexGuard<'_, ObjectModel> {
        lock(&self.shared.model)
    }

    /// Snapshot of every object and its current property values
    pub fn enumerate(&self) -> ObjectSnapshot {
        self.model().enumerate()
    }

    pub fn resources(&self) -> DrmResources {
        self.model().resources()
    }

    pub fn get(&self, object: u32) -> std::result::Result<DrmObject, ValidationError> {
        self.model().get(object)
    }

    pub fn property_id(&self, prop: Prop) -> ObjectId {
        self.model().property_id(prop)
    }

    pub fn property_info(&self, property: u32) -> std::result::Result<PropertyInfo, ValidationError> {
        self.model().property_info(property)
    }

    pub fn find_property(&self, object: ObjectId, name: &str) -> Option<ObjectId> {
        self.model().find_property(object, name)
    }

    /// Stage a property value; only a commit makes it visible
    pub fn set_property(
        &self,
        object: u32,
        property: u32,
        value: u64,
    ) -> std::result::Result<(), ValidationError> {
        self.model().set_property(object, property, value)
    }

    pub fn discard_staged(&self) {
        self.model().discard_staged();
    }

    pub fn create_blob(&self, data: Vec<u8>) -> Result<ObjectId> {
        self.model().create_blob(data)
    }

    pub fn create_mode_blob(&self, mode: &ModeInfo) -> Result<ObjectId> {
        self.create_blob(mode.to_bytes().to_vec())
    }

    pub fn destroy_blob(&self, blob: u32) -> std::result::Result<(), ValidationError> {
        self.model().destroy_blob(blob)
    }

    pub fn blob_data(&self, blob: u32) -> Option<Vec<u8>> {
        self.model().blob_data(blob).map(<[u8]>::to_vec)
    }

    pub fn add_framebuffer(&self, bo: &BufferObject, format: Fourcc) -> Result<ObjectId> {
        self.model().add_framebuffer(bo, format)
    }

    pub fn remove_framebuffer(&self, fb: u32) -> std::result::Result<(), ValidationError> {
        let removed = self.model().remove_framebuffer(fb)?;
        // The last reference may free the buffer; do that outside the lock
        drop(removed);
        Ok(())
    }

    pub fn subscribe(&self) -> io::Result<EventSource> {
        self.shared.events.subscribe()
    }

    /// Answer a `drmGetCap` query
    pub fn get_cap(&self, cap: u64) -> Option<u64> {
        let cursor = u64::from(self.shared.config.cursor_size);
        Some(match cap {
            DRM_CAP_DUMB_BUFFER => 1,
            DRM_CAP_VBLANK_HIGH_CRTC => 1,
            DRM_CAP_DUMB_PREFERRED_DEPTH => 24,
            DRM_CAP_DUMB_PREFER_SHADOW => 0,
            DRM_CAP_PRIME => DRM_PRIME_CAP_IMPORT | DRM_PRIME_CAP_EXPORT,
            DRM_CAP_TIMESTAMP_MONOTONIC => 1,
            DRM_CAP_ASYNC_PAGE_FLIP => 0,
            DRM_CAP_CURSOR_WIDTH | DRM_CAP_CURSOR_HEIGHT => cursor,
            DRM_CAP_ADDFB2_MODIFIERS => 0,
            DRM_CAP_CRTC_IN_VBLANK_EVENT => 1,
            _ => return None,
        })
    }

    /// Apply an atomic commit
    ///
    /// Validation and staging happen on the caller's thread. A blocking
    /// commit then waits for every CRTC it touches to present; a
    /// `NONBLOCK` commit returns once the presents are queued.
    pub fn commit(&self, req: &CommitRequest) -> std::result::Result<CommitResult, CommitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CommitError::Device(DeviceError::Closed));
        }
        let commit_id = self.shared.next_commit.fetch_add(1, Ordering::Relaxed);
        let blocking = !req.is_test_only() && !req.is_nonblocking();
        let (reply_tx, reply_rx) = unbounded();

        let staging = commit::stage(
            &mut self.model(),
            req,
            commit_id,
            blocking.then_some(&reply_tx),
        )?;
        drop(reply_tx);
        let (jobs, unbound) = match staging {
            Staging::Tested(predictions) => return Ok(CommitResult::Tested { predictions }),
            Staging::Queued { jobs, unbound } => (jobs, unbound),
        };

        if let Some(objects) = unbound {
            let (tx, rx) = bounded(1);
            self.shared
                .dispatch_tx
                .send(DispatchMsg::Settle {
                    objects,
                    reply: Some(tx),
                })
                .map_err(|_| CommitError::Device(DeviceError::Closed))?;
            rx.recv()
                .map_err(|_| CommitError::Device(DeviceError::Closed))?;
        }

        let crtcs: Vec<ObjectId> = jobs.iter().map(|j| j.crtc).collect();
        for job in jobs {
            let crtc = job.crtc;
            let submitted = match lock(&self.shared.workers).get(&crtc) {
                Some(worker) => worker.submit(job),
                None => Err(CommitError::Rejected {
                    crtc,
                    reason: "no present worker".to_string(),
                }),
            };
            if let Err(e) = submitted {
                warn!("Cannot queue commit {} on CRTC {}: {}", commit_id, crtc, e);
                // Roll back through the dispatch thread like any failed present
                let failed = DispatchMsg::Completed(CrtcCompletion {
                    crtc,
                    commit_id,
                    result: Err(e),
                });
                self.shared
                    .dispatch_tx
                    .send(failed)
                    .map_err(|_| CommitError::Device(DeviceError::Closed))?;
            }
        }

        if !blocking {
            debug!("Commit {} queued on {} CRTCs", commit_id, crtcs.len());
            return Ok(CommitResult::Queued { commit_id, crtcs });
        }

        let deadline = Instant::now() + self.shared.config.watchdog_timeout() * 2;
        let mut outcomes = Vec::with_capacity(crtcs.len());
        let mut failure = None;
        for crtc in &crtcs {
            match reply_rx.recv_deadline(deadline) {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let elapsed = self.shared.config.watchdog_timeout() * 2;
                    failure.get_or_insert(CommitError::Device(DeviceError::WatchdogTimeout {
                        crtc: *crtc,
                        elapsed,
                    }));
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    failure.get_or_insert(CommitError::Device(DeviceError::Closed));
                    break;
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        outcomes.sort_by_key(|o| o.crtc);
        Ok(CommitResult::Completed {
            commit_id,
            outcomes,
        })
    }

    /// Legacy page flip: show `fb` on the CRTC's primary plane and report
    /// completion as a FlipComplete event carrying `user_data`
    pub fn page_flip(
        &self,
        crtc: ObjectId,
        fb: ObjectId,
        user_data: u64,
    ) -> std::result::Result<CommitResult, CommitError> {
        let update = {
            let model = self.model();
            let plane = model
                .primary_plane(crtc)
                .ok_or_else(|| CommitError::invalid(crtc, "not a CRTC"))?;
            let framebuffer = model
                .framebuffer(fb)
                .ok_or_else(|| CommitError::invalid(fb, "unknown framebuffer"))?;
            let shown = model.planes.get(&plane).map(|p| {
                let state = p.state.current();
                (state.crtc, state.src, state.dst)
            });
            match shown {
                Some((Some(on), src, dst)) if on == crtc && !dst.is_empty() => {
                    PlaneUpdate::new(plane, crtc, fb, src, dst)
                }
                _ => {
                    let (w, h) = model
                        .crtcs
                        .get(&crtc)
                        .and_then(|c| c.state.current().mode_info().cloned())
                        .map(|m| (u32::from(m.hdisplay), u32::from(m.vdisplay)))
                        .unwrap_or((framebuffer.width, framebuffer.height));
                    PlaneUpdate::new(
                        plane,
                        crtc,
                        fb,
                        SrcRect::from_pixels(0, 0, framebuffer.width, framebuffer.height),
                        Rect::new(0, 0, w, h),
                    )
                }
            }
        };
        let mut req = CommitRequest::new(DRM_MODE_PAGE_FLIP_EVENT | DRM_MODE_ATOMIC_NONBLOCK)
            .with_user_data(user_data);
        req.plane(update);
        self.commit(&req)
    }

    /// Legacy modeset: light `crtc` with `mode` on `connector` and show
    /// `fb` full screen, or switch the CRTC off when `fb` is `None`
    pub fn set_crtc(
        &self,
        crtc: ObjectId,
        fb: Option<ObjectId>,
        connector: ObjectId,
        mode: &ModeInfo,
    ) -> std::result::Result<CommitResult, CommitError> {
        let plane = self
            .model()
            .primary_plane(crtc)
            .ok_or_else(|| CommitError::invalid(crtc, "not a CRTC"))?;
        let mut req = CommitRequest::new(DRM_MODE_ATOMIC_ALLOW_MODESET);
        let Some(fb) = fb else {
            req.plane(PlaneUpdate::disable(plane))
                .crtc(crtc, false, None)
                .connector(connector, None);
            return self.commit(&req);
        };

        let (fb_width, fb_height) = self
            .model()
            .framebuffer(fb)
            .map(|f| (f.width, f.height))
            .ok_or_else(|| CommitError::invalid(fb, "unknown framebuffer"))?;
        let blob = self
            .create_mode_blob(mode)
            .map_err(|e| CommitError::invalid(crtc, e))?;
        let (w, h) = (u32::from(mode.hdisplay), u32::from(mode.vdisplay));
        req.crtc(crtc, true, Some(blob))
            .connector(connector, Some(crtc))
            .plane(PlaneUpdate::new(
                plane,
                crtc,
                fb,
                SrcRect::from_pixels(0, 0, fb_width.min(w), fb_height.min(h)),
                Rect::new(0, 0, w, h),
            ));
        let result = self.commit(&req);
        // The CRTC holds its own reference to the mode
        let _ = self.destroy_blob(blob.raw());
        result
    }

    /// Shut the device down: stop the dispatch thread and workers, drop
    /// every framebuffer and return any buffers the compositor leaked
    pub fn close(&self) -> ShutdownReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        info!("Closing DRM device");

        let _ = self.shared.dispatch_tx.send(DispatchMsg::Shutdown);
        if let Some(handle) = lock(&self.dispatcher).take() {
            if handle.join().is_err() {
                error!("Dispatch thread panicked");
            }
        }

        let workers = std::mem::take(&mut *lock(&self.shared.workers));
        for worker in workers.into_values() {
            worker.shutdown();
        }

        {
            let mut model = self.model();
            let crtcs: Vec<ObjectId> = model.crtcs.keys().copied().collect();
            for id in crtcs {
                let in_flight = model.crtcs.get_mut(&id).and_then(|c| c.in_flight.take());
                if let Some(reply) = in_flight.and_then(|f| f.reply) {
                    let _ = reply.send(Err(CommitError::Device(DeviceError::Closed)));
                }
            }
            if model.lost.is_none() {
                model.mark_lost(DeviceError::Closed);
            }
            model.clear();
        }
        self.shared.events.close_all();

        let leaked = self.shared.gbm.shutdown();
        ShutdownReport { leaked }
    }
}

impl Drop for HwcDrmDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{Composition, CrtcOutcome};
    use crate::event::{EventKind, EventRecord};
    use crate::gbm_device::gbm_usage::GBM_BO_USE_SCANOUT;
    use crate::gbm_device::ImportMetadata;
    use crate::hal::mock::{phone_display, HalCall, MockHal};
    use crate::hal::HalBufferHandle;
    use crate::model::{Connection, PlaneType};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::os::fd::AsFd;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Rig {
        hal: Arc<MockHal>,
        device: HwcDrmDevice,
        events: EventSource,
        crtc: ObjectId,
        connector: ObjectId,
        primary: ObjectId,
        overlays: Vec<ObjectId>,
        mode: ObjectId,
    }

    fn rig_with(config: ShimConfig) -> Rig {
        let hal = MockHal::with_primary();
        let device =
            HwcDrmDevice::open(hal.clone(), Arc::new(CpuGlBackend::new()), config).unwrap();
        let snapshot = device.enumerate();
        let crtc = snapshot.crtcs().next().unwrap().id;
        let conn = snapshot.connectors().next().unwrap();
        let mode = device.create_mode_blob(&conn.modes[0]).unwrap();
        let primary = snapshot
            .planes()
            .find(|p| p.plane_type == PlaneType::Primary)
            .unwrap()
            .id;
        let overlays = snapshot
            .planes()
            .filter(|p| p.plane_type == PlaneType::Overlay)
            .map(|p| p.id)
            .collect();
        let events = device.subscribe().unwrap();
        Rig {
            hal,
            connector: conn.id,
            device,
            events,
            crtc,
            primary,
            overlays,
            mode,
        }
    }

    fn rig() -> Rig {
        rig_with(ShimConfig::default())
    }

    impl Rig {
        fn buffer(&self) -> BufferObject {
            self.device
                .gbm()
                .create_bo(64, 64, Fourcc::ARGB8888, GBM_BO_USE_SCANOUT)
                .unwrap()
                .accept()
        }

        fn fb(&self) -> ObjectId {
            let bo = self.buffer();
            self.device.add_framebuffer(&bo, Fourcc::ARGB8888).unwrap()
        }

        fn show(&self, plane: ObjectId, fb: ObjectId, x: i32) -> PlaneUpdate {
            PlaneUpdate::new(
                plane,
                self.crtc,
                fb,
                SrcRect::from_pixels(0, 0, 64, 64),
                Rect::new(x, 0, 64, 64),
            )
        }

        fn modeset(&self, fb: ObjectId) -> CommitRequest {
            let mut req = CommitRequest::new(DRM_MODE_ATOMIC_ALLOW_MODESET);
            req.crtc(self.crtc, true, Some(self.mode))
                .connector(self.connector, Some(self.crtc))
                .plane(self.show(self.primary, fb, 0));
            req
        }

        fn light_up(&self) -> ObjectId {
            let fb = self.fb();
            self.device.commit(&self.modeset(fb)).unwrap();
            self.drain_until(EventKind::FlipComplete);
            fb
        }

        /// Next event of `kind`, skipping vsyncs and anything else
        fn drain_until(&self, kind: EventKind) -> EventRecord {
            let deadline = Instant::now() + WAIT;
            while Instant::now() < deadline {
                if let Some(record) = self.events.wait_next(Duration::from_millis(100)) {
                    if record.kind == kind {
                        return record;
                    }
                }
            }
            panic!("no {:?} event", kind);
        }

        fn wait_for_present(&self, count: usize) {
            let deadline = Instant::now() + WAIT;
            while self.hal.presents_started() < count {
                assert!(Instant::now() < deadline, "present never reached the HAL");
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_test_only_never_touches_hardware() {
        let r = rig();
        r.hal.clear_calls();
        let fb = r.fb();
        let plane = r.primary.raw();
        let zpos = r.device.property_id(Prop::Zpos).raw();
        r.device.set_property(plane, zpos, 1).unwrap();

        let req = r
            .modeset(fb)
            .with_flags(DRM_MODE_ATOMIC_ALLOW_MODESET | commit::DRM_MODE_ATOMIC_TEST_ONLY);
        let result = r.device.commit(&req).unwrap();
        assert_eq!(
            result,
            CommitResult::Tested {
                predictions: vec![(r.crtc, Composition::Device)]
            }
        );
        assert!(r.hal.calls().iter().all(|c| !c.touches_hardware()));
        assert!(r.events.try_next().is_none());
        assert!(!r.device.enumerate().crtcs().next().unwrap().active);
    }

    #[test]
    fn test_one_completion_per_commit() {
        let r = rig();
        let fb = r.light_up();
        let mut last = 1;
        for frame in 0..5u64 {
            r.device.page_flip(r.crtc, fb, 100 + frame).unwrap();
            let record = r.drain_until(EventKind::FlipComplete);
            assert_eq!(record.crtc_id, r.crtc.raw());
            assert_eq!(record.user_data, 100 + frame);
            assert!(record.sequence > last);
            last = record.sequence;
        }
        assert!(r.events.try_next().map_or(true, |e| e.kind != EventKind::FlipComplete));
        assert_eq!(r.hal.presents().len(), 6);
    }

    #[test]
    fn test_blocking_commit_reports_outcome() {
        let r = rig();
        let fb = r.fb();
        match r.device.commit(&r.modeset(fb)).unwrap() {
            CommitResult::Completed { outcomes, .. } => {
                assert_eq!(outcomes.len(), 1);
                let CrtcOutcome {
                    crtc,
                    composition,
                    sequence,
                    ..
                } = outcomes[0];
                assert_eq!(crtc, r.crtc);
                assert_eq!(composition, Composition::Device);
                assert_eq!(sequence, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        let snapshot = r.device.enumerate();
        let crtc = snapshot.crtcs().next().unwrap();
        assert!(crtc.active);
        assert_eq!(crtc.fb_id, Some(fb));
        assert!(r.hal.calls().contains(&HalCall::SetPower {
            display: 0,
            on: true
        }));
    }

    #[test]
    fn test_second_commit_is_busy() {
        let r = rig();
        let fb = r.light_up();
        r.hal.hold_presents();
        r.device.page_flip(r.crtc, fb, 1).unwrap();
        r.wait_for_present(2);

        let err = r.device.page_flip(r.crtc, fb, 2).unwrap_err();
        assert_eq!(err, CommitError::Busy { crtc: r.crtc });

        r.hal.release_presents();
        assert_eq!(r.drain_until(EventKind::FlipComplete).user_data, 1);
        r.device.page_flip(r.crtc, fb, 3).unwrap();
        assert_eq!(r.drain_until(EventKind::FlipComplete).user_data, 3);
    }

    #[test]
    fn test_fallback_reduces_layer_count() {
        let r = rig();
        r.hal.set_layer_limit(Some(2));
        let mut req = r.modeset(r.fb());
        for (i, plane) in r.overlays.iter().enumerate() {
            req.plane(r.show(*plane, r.fb(), 32 * (i as i32 + 1)));
        }
        let result = r.device.commit(&req).unwrap();
        let CommitResult::Completed { outcomes, .. } = result else {
            panic!("expected a completed commit");
        };
        assert_eq!(outcomes[0].composition, Composition::Client { flattened: 3 });

        let presents = r.hal.presents();
        let accepted: Vec<_> = presents.iter().filter(|p| p.accepted).collect();
        assert_eq!(accepted.len(), 1);
        assert!(accepted[0].layers.len() <= 2);
        assert_eq!(presents[0].layers.len(), 4);
    }

    #[test]
    fn test_bad_client_buffer_never_costs_the_device() {
        let r = rig();
        r.light_up();
        r.hal.set_layer_limit(Some(1));
        let source = r.buffer();
        let fd = r.device.gbm().export(&source).unwrap();
        let meta = ImportMetadata {
            width: 64,
            height: 64,
            format: Fourcc::ARGB8888,
            stride: 16,
            offset: 0,
            modifier: crate::format::DRM_FORMAT_MOD_LINEAR,
        };
        assert!(matches!(
            r.device.gbm().import_dmabuf(fd.as_fd(), &meta),
            Err(crate::error::ImportError::BadLayout(_))
        ));

        // The well-formed import still composes through the fallback
        let meta = ImportMetadata {
            stride: source.stride(),
            ..meta
        };
        let imported = r.device.gbm().import_dmabuf(fd.as_fd(), &meta).unwrap();
        let fb = r.device.add_framebuffer(&imported, Fourcc::ARGB8888).unwrap();
        let mut req = CommitRequest::new(0);
        req.plane(r.show(r.primary, r.fb(), 0))
            .plane(r.show(r.overlays[0], fb, 32));
        let result = r.device.commit(&req).unwrap();
        let CommitResult::Completed { outcomes, .. } = result else {
            panic!("expected a completed commit");
        };
        assert_eq!(outcomes[0].composition, Composition::Client { flattened: 2 });
        assert!(r.device.lost().is_none());
    }

    #[test]
    fn test_rejected_commit_rolls_back() {
        let r = rig();
        let fb = r.light_up();
        let other = r.fb();
        r.hal
            .fail_presents_with(Some(crate::hal::HalError::BadParameter("no".into())));
        let mut req = CommitRequest::new(0);
        req.plane(r.show(r.primary, other, 10));
        let err = r.device.commit(&req).unwrap_err();
        assert!(matches!(err, CommitError::Rejected { .. }));
        assert_eq!(r.drain_until(EventKind::CommitFailed).crtc_id, r.crtc.raw());

        let snapshot = r.device.enumerate();
        let plane = snapshot.planes().find(|p| p.id == r.primary).unwrap();
        assert_eq!(plane.fb_id, Some(fb));
        assert_eq!(plane.dst.x, 0);
    }

    #[test]
    fn test_nonblocking_failure_is_kept_for_the_caller() {
        let r = rig();
        let fb = r.light_up();
        assert!(r.device.take_async_failure().is_none());
        r.hal
            .fail_presents_with(Some(crate::hal::HalError::BadParameter("no".into())));
        r.device.page_flip(r.crtc, fb, 5).unwrap();
        let failed = r.drain_until(EventKind::CommitFailed);
        assert_eq!(failed.user_data, 5);
        assert!(matches!(
            r.device.take_async_failure(),
            Some(CommitError::Rejected { crtc, .. }) if crtc == r.crtc
        ));
        assert!(r.device.take_async_failure().is_none());

        // Blocking callers already got theirs
        let mut req = CommitRequest::new(0);
        req.plane(r.show(r.primary, fb, 8));
        assert!(r.device.commit(&req).is_err());
        r.drain_until(EventKind::CommitFailed);
        assert!(r.device.take_async_failure().is_none());
    }

    #[test]
    fn test_rejected_mode_change_restores_hal_config() {
        let r = rig();
        let fb = r.light_up();
        let mode = r.device.enumerate().connectors().next().unwrap().modes[1].clone();
        r.hal.clear_calls();
        r.hal
            .fail_presents_with(Some(crate::hal::HalError::BadParameter("no".into())));
        let err = r
            .device
            .set_crtc(r.crtc, Some(fb), r.connector, &mode)
            .unwrap_err();
        assert!(matches!(err, CommitError::Rejected { .. }));

        let crtc = r.device.enumerate().crtcs().next().unwrap().clone();
        assert_eq!(crtc.mode.map(|m| m.hdisplay), Some(1080));
        let panel: Vec<HalCall> = r
            .hal
            .calls()
            .into_iter()
            .filter(HalCall::touches_hardware)
            .collect();
        assert_eq!(
            panel.last(),
            Some(&HalCall::SetActiveConfig {
                display: 0,
                config: 0
            })
        );
    }

    #[test]
    fn test_validation_errors_change_nothing() {
        let r = rig();
        let fb = r.fb();
        let mut req = CommitRequest::new(0);
        req.crtc(r.crtc, true, Some(r.mode))
            .connector(r.connector, Some(r.crtc))
            .plane(r.show(r.primary, fb, 0));
        assert!(matches!(
            r.device.commit(&req),
            Err(CommitError::Invalid { .. })
        ));

        let mut req = r.modeset(fb);
        req.add_property(r.primary.raw(), 0xdead, 1);
        assert!(matches!(
            r.device.commit(&req),
            Err(CommitError::Invalid { .. })
        ));
        assert!(r.hal.presents().is_empty());
        assert_eq!(
            r.device
                .set_property(9999, r.device.property_id(Prop::Zpos).raw(), 0),
            Err(ValidationError::NotFound(9999))
        );
    }

    #[test]
    fn test_hotplug_waits_for_commit() {
        let r = rig();
        let fb = r.light_up();
        r.hal.hold_presents();
        r.device.page_flip(r.crtc, fb, 7).unwrap();
        r.wait_for_present(2);

        r.hal.disconnect(0);
        // Deferred until the flip settles
        thread::sleep(Duration::from_millis(20));
        assert_eq!(r.device.enumerate().connectors().count(), 1);

        r.hal.release_presents();
        let failed = r.drain_until(EventKind::CommitFailed);
        assert_eq!(failed.user_data, 7);
        let hotplug = r.drain_until(EventKind::Hotplug);
        assert_eq!(hotplug.crtc_id, r.crtc.raw());

        let snapshot = r.device.enumerate();
        assert_eq!(snapshot.connectors().count(), 0);
        let crtc = snapshot.crtcs().next().unwrap();
        assert_eq!(crtc.id, r.crtc);
        assert!(!crtc.active);
    }

    #[test]
    fn test_hotplug_adds_display() {
        let r = rig();
        let (info, modes) = phone_display(1);
        r.hal.connect(info, modes);
        let record = r.drain_until(EventKind::Hotplug);

        let snapshot = r.device.enumerate();
        assert_eq!(snapshot.connectors().count(), 2);
        assert_eq!(snapshot.crtcs().count(), 2);
        let new_crtc = snapshot.crtcs().map(|c| c.id).max().unwrap();
        assert_eq!(record.crtc_id, new_crtc.raw());
        assert!(r.hal.has_vsync_callback(1));
    }

    #[test]
    fn test_two_display_commit_is_all_or_nothing() {
        let r = rig();
        let fb = r.light_up();
        let (info, modes) = phone_display(1);
        r.hal.connect(info, modes);
        r.drain_until(EventKind::Hotplug);

        let snapshot = r.device.enumerate();
        let second = snapshot.crtcs().find(|c| c.id != r.crtc).unwrap().clone();
        let conn = snapshot
            .connectors()
            .find(|c| c.id != r.connector)
            .unwrap()
            .clone();
        let primary = snapshot
            .planes()
            .find(|p| second.planes.contains(&p.id) && p.plane_type == PlaneType::Primary)
            .unwrap()
            .id;
        let mode = r.device.create_mode_blob(&conn.modes[0]).unwrap();
        let presents_on_first = r.hal.presents().iter().filter(|p| p.display == 0).count();

        r.hal.fail_display_presents_with(
            1,
            Some(crate::hal::HalError::BadParameter("no".into())),
        );
        let mut req = CommitRequest::new(DRM_MODE_ATOMIC_ALLOW_MODESET);
        req.plane(r.show(r.primary, r.fb(), 16))
            .crtc(second.id, true, Some(mode))
            .connector(conn.id, Some(second.id))
            .plane(PlaneUpdate::new(
                primary,
                second.id,
                r.fb(),
                SrcRect::from_pixels(0, 0, 64, 64),
                Rect::new(0, 0, 64, 64),
            ));
        let err = r.device.commit(&req).unwrap_err();
        assert!(matches!(err, CommitError::Rejected { crtc, .. } if crtc == second.id));

        let mut failed = vec![
            r.drain_until(EventKind::CommitFailed).crtc_id,
            r.drain_until(EventKind::CommitFailed).crtc_id,
        ];
        failed.sort_unstable();
        let mut expected = vec![r.crtc.raw(), second.id.raw()];
        expected.sort_unstable();
        assert_eq!(failed, expected);

        // The first display took the new frame, then got the old one back
        let deadline = Instant::now() + WAIT;
        let first: Vec<_> = loop {
            let first: Vec<_> = r
                .hal
                .presents()
                .into_iter()
                .filter(|p| p.display == 0)
                .collect();
            if first.len() >= presents_on_first + 2 {
                break first;
            }
            assert!(Instant::now() < deadline, "first display was never restored");
            thread::sleep(Duration::from_millis(1));
        };
        let restored = &first[presents_on_first + 1];
        assert!(restored.accepted);
        assert_eq!(restored.layers[0].display_frame.left, 0);
        assert_eq!(first[presents_on_first].layers[0].display_frame.left, 16);

        let snapshot = r.device.enumerate();
        let plane = snapshot.planes().find(|p| p.id == r.primary).unwrap();
        assert_eq!(plane.fb_id, Some(fb));
        assert_eq!(plane.dst.x, 0);
        let crtc = snapshot.crtcs().find(|c| c.id == second.id).unwrap();
        assert!(!crtc.active);
        let on_second: Vec<HalCall> = r
            .hal
            .calls()
            .into_iter()
            .filter(|c| matches!(c, HalCall::SetPower { display: 1, .. }))
            .collect();
        assert_eq!(
            on_second.last(),
            Some(&HalCall::SetPower {
                display: 1,
                on: false
            })
        );
    }

    #[test]
    fn test_vsync_events() {
        let r = rig();
        for ts in 1..=5 {
            r.hal.fire_vsync(0, ts * 1000);
        }
        let record = r.drain_until(EventKind::Vsync);
        assert_eq!(record.crtc_id, r.crtc.raw());
        assert!(r.events.pending() <= 1);
    }

    #[test]
    fn test_watchdog_marks_device_lost() {
        let config = ShimConfig {
            watchdog_timeout_ms: 200,
            ..ShimConfig::default()
        };
        let r = rig_with(config);
        let fb = r.light_up();
        r.hal.hold_presents();
        r.device.page_flip(r.crtc, fb, 9).unwrap();

        let failed = r.drain_until(EventKind::CommitFailed);
        assert_eq!(failed.user_data, 9);
        r.drain_until(EventKind::DeviceLost);
        assert!(matches!(
            r.device.lost(),
            Some(DeviceError::WatchdogTimeout { .. })
        ));
        assert!(matches!(
            r.device.page_flip(r.crtc, fb, 10),
            Err(CommitError::Device(_))
        ));
        let snapshot = r.device.enumerate();
        assert!(snapshot
            .connectors()
            .all(|c| c.connection == Connection::Disconnected));
        r.hal.release_presents();
    }

    #[test]
    fn test_hal_crash_is_fatal() {
        let r = rig();
        let fb = r.light_up();
        r.hal
            .fail_presents_with(Some(crate::hal::HalError::Dead("binder".into())));
        r.device.page_flip(r.crtc, fb, 0).unwrap();
        r.drain_until(EventKind::DeviceLost);
        assert!(matches!(
            r.device.lost(),
            Some(DeviceError::HalCrashed(_))
        ));
    }

    #[test]
    fn test_enumerate_is_idempotent() {
        let r = rig();
        r.light_up();
        assert_eq!(r.device.enumerate(), r.device.enumerate());
    }

    #[test]
    fn test_caps() {
        let r = rig();
        assert_eq!(r.device.get_cap(DRM_CAP_PRIME), Some(3));
        assert_eq!(r.device.get_cap(DRM_CAP_CURSOR_WIDTH), Some(64));
        assert_eq!(r.device.get_cap(DRM_CAP_ASYNC_PAGE_FLIP), Some(0));
        assert_eq!(r.device.get_cap(0xff), None);
    }

    #[test]
    fn test_set_crtc_and_disable() {
        let r = rig();
        let fb = r.fb();
        let mode = r.device.enumerate().connectors().next().unwrap().modes[1].clone();
        r.device.set_crtc(r.crtc, Some(fb), r.connector, &mode).unwrap();
        let crtc = r.device.enumerate().crtcs().next().unwrap().clone();
        assert!(crtc.active);
        assert_eq!(crtc.mode.map(|m| m.hdisplay), Some(720));
        assert!(r.hal.calls().contains(&HalCall::SetActiveConfig {
            display: 0,
            config: 1
        }));

        r.device.set_crtc(r.crtc, None, r.connector, &mode).unwrap();
        let crtc = r.device.enumerate().crtcs().next().unwrap().clone();
        assert!(!crtc.active);
        assert!(r.hal.calls().contains(&HalCall::SetPower {
            display: 0,
            on: false
        }));
    }

    #[test]
    fn test_live_framebuffers_keep_buffers() {
        let r = rig();
        let mut handles: HashMap<ObjectId, HalBufferHandle> = HashMap::new();
        let first = r.buffer();
        let lit = r.device.add_framebuffer(&first, Fourcc::ARGB8888).unwrap();
        handles.insert(lit, first.hal_handle());
        drop(first);
        r.device.commit(&r.modeset(lit)).unwrap();
        r.drain_until(EventKind::FlipComplete);

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut registered: Vec<ObjectId> = Vec::new();
        let mut client: Vec<BufferObject> = Vec::new();

        for _ in 0..200 {
            match rng.gen_range(0..4) {
                0 => {
                    let bo = r.buffer();
                    let fb = r.device.add_framebuffer(&bo, Fourcc::ARGB8888).unwrap();
                    handles.insert(fb, bo.hal_handle());
                    registered.push(fb);
                    if rng.gen_bool(0.5) {
                        client.push(bo);
                    }
                }
                1 if !registered.is_empty() => {
                    let fb = registered.swap_remove(rng.gen_range(0..registered.len()));
                    r.device.remove_framebuffer(fb.raw()).unwrap();
                }
                2 if !registered.is_empty() => {
                    let fb = registered[rng.gen_range(0..registered.len())];
                    let plane = if rng.gen_bool(0.5) {
                        r.primary
                    } else {
                        r.overlays[0]
                    };
                    let mut req = CommitRequest::new(0);
                    req.plane(r.show(plane, fb, 0));
                    r.device.commit(&req).unwrap();
                    while r.events.try_next().is_some() {}
                }
                3 if !client.is_empty() => {
                    client.swap_remove(rng.gen_range(0..client.len()));
                }
                _ => {}
            }

            for plane in r.device.enumerate().planes() {
                if let Some(fb) = plane.fb_id {
                    assert!(r.hal.is_live(handles[&fb]), "framebuffer {} freed while shown", fb);
                }
            }
        }
    }

    #[test]
    fn test_close_releases_everything() {
        let r = rig();
        let fb = r.light_up();
        r.device.page_flip(r.crtc, fb, 0).unwrap();
        r.drain_until(EventKind::FlipComplete);

        let report = r.device.close();
        assert!(report.is_clean(), "leaked {:?}", report.leaked);
        assert_eq!(r.hal.live_buffers(), 0);
        assert!(matches!(
            r.device.commit(&CommitRequest::new(0)),
            Err(CommitError::Device(DeviceError::Closed))
        ));
        assert!(r.device.close().is_clean());
    }
}
