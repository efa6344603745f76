//! Per-CRTC present workers
//!
//! HAL present calls can block for a frame or more, so each CRTC gets its
//! own thread. A slow display then never holds up another display's
//! commits, and the model lock is never held across a HAL call.

use crate::commit::{split_layers, Composition, PlannedLayer};
use crate::dispatch::DispatchMsg;
use crate::egl::EglBridge;
use crate::error::{CommitError, DeviceError};
use crate::format::Fourcc;
use crate::gbm_device::gbm_usage::{GBM_BO_USE_RENDERING, GBM_BO_USE_SCANOUT};
use crate::gbm_device::{BufferObject, HwcGbmDevice, HwcGbmSurface};
use crate::hal::{
    BlendMode, FloatRect, HalBridge, HalConfigId, HalDisplayId, HalError, HalLayer, HalRect,
    PresentOutcome,
};
use crate::model::{ObjectId, Rect};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Buffers in the flattening ring; one on screen, one being drawn
const SCRATCH_BUFFERS: usize = 2;

/// One CRTC's share of a commit
#[derive(Debug)]
pub(crate) struct PresentJob {
    pub(crate) commit_id: u64,
    pub(crate) crtc: ObjectId,
    pub(crate) display: HalDisplayId,
    pub(crate) active: bool,
    pub(crate) power_change: Option<bool>,
    pub(crate) config: Option<HalConfigId>,
    pub(crate) mode_size: (u32, u32),
    pub(crate) layers: Vec<PlannedLayer>,
    pub(crate) max_device_layers: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Presented {
    pub(crate) composition: Composition,
    pub(crate) timestamp_ns: u64,
}

#[derive(Debug)]
pub(crate) struct CrtcCompletion {
    pub(crate) crtc: ObjectId,
    pub(crate) commit_id: u64,
    pub(crate) result: Result<Presented, CommitError>,
}

fn map_hal_error(crtc: ObjectId, err: HalError) -> CommitError {
    if err.is_fatal() {
        CommitError::Device(DeviceError::HalCrashed(err.to_string()))
    } else {
        CommitError::Rejected {
            crtc,
            reason: err.to_string(),
        }
    }
}

fn hal_layer(buffer: &BufferObject, src: FloatRect, dst: Rect, z_order: u32) -> HalLayer {
    HalLayer {
        buffer: buffer.hal_handle(),
        source_crop: src,
        display_frame: HalRect {
            left: dst.x,
            top: dst.y,
            right: dst.x.saturating_add(dst.width as i32),
            bottom: dst.y.saturating_add(dst.height as i32),
        },
        z_order,
        blend: if buffer.format().has_alpha() {
            BlendMode::Premultiplied
        } else {
            BlendMode::None
        },
        plane_alpha: 1.0,
    }
}

/// What the worker last told the HAL about its display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DisplayState {
    powered: bool,
    vsync: bool,
    config: Option<HalConfigId>,
}

/// Drives one HAL display
struct Presenter {
    crtc: ObjectId,
    hal: Arc<dyn HalBridge>,
    gbm: HwcGbmDevice,
    egl: EglBridge,
    scratch: Option<HwcGbmSurface>,
    /// Flattened buffer the HAL is currently scanning out
    front: Option<BufferObject>,
    applied: DisplayState,
}

impl Presenter {
    /// Run a job. A rejected job leaves the display as it found it.
    fn execute(&mut self, job: &PresentJob) -> Result<Presented, CommitError> {
        let before = self.applied;
        let result = self.apply(job);
        if let Err(CommitError::Rejected { .. }) = &result {
            self.restore(job.display, before);
        }
        result
    }

    /// Bring the HAL back to `before`. Power comes up first and goes down
    /// last, so config and vsync are never set on a dark panel.
    fn restore(&mut self, hal_display: HalDisplayId, before: DisplayState) {
        let mut now = self.applied;
        if now == before {
            return;
        }
        warn!(
            "CRTC {}: restoring display {} to {:?} after a rejected commit",
            self.crtc, hal_display, before
        );
        let hal = Arc::clone(&self.hal);
        if before.powered && !now.powered {
            match hal.set_power_mode(hal_display, true) {
                Ok(()) => now.powered = true,
                Err(e) => warn!("Cannot power display {} back on: {}", hal_display, e),
            }
        }
        if let Some(config) = before.config.filter(|_| now.config != before.config) {
            match hal.set_active_config(hal_display, config) {
                Ok(()) => now.config = before.config,
                Err(e) => warn!("Cannot restore config {} on display {}: {}", config, hal_display, e),
            }
        }
        if now.vsync != before.vsync {
            match hal.set_vsync_enabled(hal_display, before.vsync) {
                Ok(()) => now.vsync = before.vsync,
                Err(e) => warn!("Cannot restore vsync on display {}: {}", hal_display, e),
            }
        }
        if !before.powered && now.powered {
            match hal.set_power_mode(hal_display, false) {
                Ok(()) => now.powered = false,
                Err(e) => warn!("Cannot power display {} back off: {}", hal_display, e),
            }
        }
        self.applied = now;
    }

    fn apply(&mut self, job: &PresentJob) -> Result<Presented, CommitError> {
        let hal = Arc::clone(&self.hal);
        let err = |e| map_hal_error(job.crtc, e);

        if !job.active {
            if self.applied.vsync {
                match hal.set_vsync_enabled(job.display, false) {
                    Ok(()) => self.applied.vsync = false,
                    Err(e) => warn!("Failed to disable vsync on display {}: {}", job.display, e),
                }
            }
            if self.applied.powered || job.power_change == Some(false) {
                info!("Powering off display {} (CRTC {})", job.display, job.crtc);
                hal.set_power_mode(job.display, false).map_err(err)?;
                self.applied.powered = false;
            }
            self.release_scratch();
            return Ok(Presented {
                composition: Composition::Disabled,
                timestamp_ns: crate::event::monotonic_ns(),
            });
        }

        if !self.applied.powered || job.power_change == Some(true) {
            info!("Powering on display {} (CRTC {})", job.display, job.crtc);
            hal.set_power_mode(job.display, true).map_err(err)?;
            self.applied.powered = true;
        }
        if !self.applied.vsync {
            hal.set_vsync_enabled(job.display, true).map_err(err)?;
            self.applied.vsync = true;
        }
        if let Some(config) = job.config.filter(|&c| self.applied.config != Some(c)) {
            debug!("Display {}: active config {}", job.display, config);
            hal.set_active_config(job.display, config).map_err(err)?;
            self.applied.config = Some(config);
        }

        let count = job.layers.len();
        let mut flatten = 0;
        loop {
            match self.present(job, flatten)? {
                PresentOutcome::Presented { timestamp_ns } => {
                    let composition = match flatten {
                        0 => Composition::Device,
                        n => Composition::Client { flattened: n },
                    };
                    return Ok(Presented {
                        composition,
                        timestamp_ns,
                    });
                }
                PresentOutcome::Unsupported { max_layers } => {
                    let limit = max_layers.or(job.max_device_layers);
                    let next = match split_layers(count, limit) {
                        n if n > flatten => n,
                        _ if flatten < count => count,
                        _ => {
                            return Err(CommitError::Rejected {
                                crtc: job.crtc,
                                reason: format!(
                                    "HAL cannot present {} layers even after client composition",
                                    count
                                ),
                            })
                        }
                    };
                    info!(
                        "CRTC {}: HAL refused {} layers (limit {:?}), flattening the bottom {}",
                        job.crtc,
                        count,
                        limit,
                        next
                    );
                    flatten = next;
                }
            }
        }
    }

    /// Present with the bottom `flatten` layers drawn into a scratch buffer
    fn present(&mut self, job: &PresentJob, flatten: usize) -> Result<PresentOutcome, CommitError> {
        let (flattened, on_top) = job.layers.split_at(flatten.min(job.layers.len()));
        let scratch = if flattened.is_empty() {
            None
        } else {
            Some(self.flatten(job, flattened)?)
        };

        let mut layers = Vec::with_capacity(on_top.len() + 1);
        if let Some(bo) = &scratch {
            let (w, h) = job.mode_size;
            let full = FloatRect {
                left: 0.0,
                top: 0.0,
                right: w as f32,
                bottom: h as f32,
            };
            layers.push(hal_layer(bo, full, Rect::new(0, 0, w, h), 0));
        }
        for layer in on_top {
            let z = layers.len() as u32;
            layers.push(hal_layer(&layer.fb.bo, layer.src.to_float(), layer.dst, z));
        }

        let outcome = self.hal.present(job.display, &layers);
        match (&outcome, scratch) {
            (Ok(PresentOutcome::Presented { .. }), Some(bo)) => self.swap_front(Some(bo)),
            (Ok(PresentOutcome::Presented { .. }), None) => self.swap_front(None),
            (_, Some(bo)) => self.give_back(&bo),
            (_, None) => {}
        }
        outcome.map_err(|e| map_hal_error(job.crtc, e))
    }

    fn flatten(&mut self, job: &PresentJob, layers: &[PlannedLayer]) -> Result<BufferObject, CommitError> {
        let (w, h) = job.mode_size;
        let rejected = |reason: String| CommitError::Rejected {
            crtc: job.crtc,
            reason,
        };
        if self.scratch.as_ref().map(|s| s.dimensions()) != Some((w, h)) {
            self.release_scratch();
            let surface = self
                .gbm
                .create_surface(
                    w,
                    h,
                    Fourcc::ARGB8888,
                    GBM_BO_USE_SCANOUT | GBM_BO_USE_RENDERING,
                    SCRATCH_BUFFERS,
                )
                .map_err(|e| rejected(format!("no client composition buffer: {}", e)))?;
            self.scratch = Some(surface);
        }
        let target = self
            .scratch
            .as_mut()
            .and_then(|s| s.lock_front_buffer())
            .ok_or_else(|| rejected("client composition buffers exhausted".to_string()))?;

        let sources: Vec<_> = layers
            .iter()
            .map(|l| (&l.fb.bo, l.src.to_float(), l.dst))
            .collect();
        if let Err(e) = self.egl.compose(&target, &sources) {
            self.give_back(&target);
            return Err(rejected(format!("client composition failed: {}", e)));
        }
        debug!(
            "CRTC {}: flattened {} layers into buffer {}",
            job.crtc,
            layers.len(),
            target.id()
        );
        Ok(target)
    }

    fn give_back(&mut self, bo: &BufferObject) {
        if let Some(surface) = self.scratch.as_mut() {
            surface.release_buffer(bo);
        }
    }

    fn swap_front(&mut self, next: Option<BufferObject>) {
        if let Some(old) = std::mem::replace(&mut self.front, next) {
            self.give_back(&old);
        }
    }

    fn release_scratch(&mut self) {
        self.front = None;
        if self.scratch.take().is_some() {
            debug!("CRTC {}: released client composition buffers", self.crtc);
        }
    }
}

/// Handle to the thread presenting one CRTC
pub(crate) struct PresentWorker {
    crtc: ObjectId,
    jobs: Option<Sender<PresentJob>>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PresentWorker {
    pub(crate) fn spawn(
        crtc: ObjectId,
        hal: Arc<dyn HalBridge>,
        gbm: HwcGbmDevice,
        egl: EglBridge,
        completions: Sender<DispatchMsg>,
    ) -> io::Result<Self> {
        let (jobs, rx) = bounded::<PresentJob>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let busy_flag = Arc::clone(&busy);
        let mut presenter = Presenter {
            crtc,
            hal,
            gbm,
            egl,
            scratch: None,
            front: None,
            applied: DisplayState::default(),
        };

        let handle = thread::Builder::new()
            .name(format!("present-crtc-{}", crtc))
            .spawn(move || {
                for job in rx {
                    busy_flag.store(true, Ordering::Release);
                    let result = presenter.execute(&job);
                    if let Err(e) = &result {
                        error!("Commit {} on CRTC {} failed: {}", job.commit_id, job.crtc, e);
                    }
                    let completion = CrtcCompletion {
                        crtc: job.crtc,
                        commit_id: job.commit_id,
                        result,
                    };
                    // Free the job's framebuffer references before reporting
                    drop(job);
                    let sent = completions.send(DispatchMsg::Completed(completion));
                    busy_flag.store(false, Ordering::Release);
                    if sent.is_err() {
                        break;
                    }
                }
                presenter.release_scratch();
                debug!("Present worker for CRTC {} exiting", presenter.crtc);
            })?;

        Ok(Self {
            crtc,
            jobs: Some(jobs),
            busy,
            handle: Some(handle),
        })
    }

    /// Hand a job to the worker. The model guarantees one commit per CRTC
    /// at a time, so the queue being full means the worker is wedged.
    pub(crate) fn submit(&self, job: PresentJob) -> Result<(), CommitError> {
        let Some(jobs) = &self.jobs else {
            return Err(CommitError::Device(DeviceError::Closed));
        };
        match jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CommitError::Busy { crtc: self.crtc }),
            Err(TrySendError::Disconnected(_)) => Err(CommitError::Device(DeviceError::Closed)),
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Stop the worker. A worker stuck inside the HAL is left detached
    /// rather than hanging the caller.
    pub(crate) fn shutdown(mut self) {
        self.jobs = None;
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.is_busy() {
            warn!(
                "Present worker for CRTC {} is stuck in the HAL, detaching it",
                self.crtc
            );
            return;
        }
        if handle.join().is_err() {
            error!("Present worker for CRTC {} panicked", self.crtc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShimConfig;
    use crate::egl::CpuGlBackend;
    use crate::hal::mock::{phone_display, HalCall, MockHal};
    use crate::model::{Framebuffer, PlaneType, SrcRect};
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    struct Harness {
        hal: Arc<MockHal>,
        gbm: HwcGbmDevice,
        worker: PresentWorker,
        done: Receiver<DispatchMsg>,
        crtc: ObjectId,
    }

    fn harness() -> Harness {
        let hal = MockHal::with_primary();
        let gbm = HwcGbmDevice::new(hal.clone(), &ShimConfig::default()).unwrap();
        let egl = EglBridge::new(Arc::new(CpuGlBackend::new()), gbm.clone());
        let (tx, done) = unbounded();
        let crtc = ObjectId::from_raw(40).unwrap();
        let worker = PresentWorker::spawn(crtc, hal.clone(), gbm.clone(), egl, tx).unwrap();
        Harness {
            hal,
            gbm,
            worker,
            done,
            crtc,
        }
    }

    impl Harness {
        fn layer(&self, index: u32, x: i32) -> PlannedLayer {
            let bo = self
                .gbm
                .create_bo(64, 64, Fourcc::ARGB8888, 0)
                .unwrap()
                .accept();
            let fb = Framebuffer {
                id: ObjectId::from_raw(100 + index).unwrap(),
                width: 64,
                height: 64,
                format: Fourcc::ARGB8888,
                pitch: bo.stride(),
                offset: 0,
                modifier: 0,
                bo,
            };
            PlannedLayer {
                plane: ObjectId::from_raw(200 + index).unwrap(),
                plane_type: PlaneType::Overlay,
                fb: Arc::new(fb),
                src: SrcRect::from_pixels(0, 0, 64, 64),
                dst: Rect::new(x, 0, 64, 64),
                zpos: index,
            }
        }

        fn job(&self, layers: Vec<PlannedLayer>, max_device_layers: Option<usize>) -> PresentJob {
            let (_, modes) = phone_display(0);
            PresentJob {
                commit_id: 1,
                crtc: self.crtc,
                display: 0,
                active: true,
                power_change: Some(true),
                config: Some(modes[0].config_id),
                mode_size: (modes[0].width, modes[0].height),
                layers,
                max_device_layers,
            }
        }

        fn run(&self, job: PresentJob) -> Result<Presented, CommitError> {
            self.worker.submit(job).unwrap();
            match self.done.recv_timeout(Duration::from_secs(5)).unwrap() {
                DispatchMsg::Completed(c) => c.result,
                _ => panic!("expected a completion"),
            }
        }
    }

    #[test]
    fn test_device_composition() {
        let h = harness();
        let layers = (0..3).map(|i| h.layer(i, i as i32 * 100)).collect();
        let presented = h.run(h.job(layers, None)).unwrap();
        assert_eq!(presented.composition, Composition::Device);
        let presents = h.hal.presents();
        assert_eq!(presents.len(), 1);
        assert_eq!(presents[0].layers.len(), 3);
    }

    #[test]
    fn test_fallback_respects_hal_limit() {
        let h = harness();
        h.hal.set_layer_limit(Some(2));
        let layers = (0..5).map(|i| h.layer(i, i as i32 * 100)).collect();
        let presented = h.run(h.job(layers, None)).unwrap();
        assert_eq!(presented.composition, Composition::Client { flattened: 4 });

        let presents = h.hal.presents();
        assert_eq!(presents.len(), 2);
        assert_eq!(presents[0].layers.len(), 5);
        assert!(!presents[0].accepted);
        assert_eq!(presents[1].layers.len(), 2);
        assert!(presents[1].accepted);
    }

    #[test]
    fn test_fallback_without_hint_flattens_everything() {
        let h = harness();
        h.hal.set_layer_limit(Some(1));
        h.hal.hide_layer_limit(true);
        let layers = (0..3).map(|i| h.layer(i, i as i32 * 100)).collect();
        let presented = h.run(h.job(layers, None)).unwrap();
        assert_eq!(presented.composition, Composition::Client { flattened: 3 });
        assert_eq!(h.hal.presents().last().unwrap().layers.len(), 1);
    }

    #[test]
    fn test_hal_errors_map_to_commit_errors() {
        let h = harness();
        h.hal
            .fail_presents_with(Some(HalError::BadParameter("nope".into())));
        let err = h.run(h.job(vec![h.layer(0, 0)], None)).unwrap_err();
        assert!(matches!(err, CommitError::Rejected { .. }));

        h.hal.fail_presents_with(Some(HalError::Dead("binder died".into())));
        let err = h.run(h.job(vec![h.layer(0, 0)], None)).unwrap_err();
        assert!(matches!(
            err,
            CommitError::Device(DeviceError::HalCrashed(_))
        ));
    }

    fn display_calls(hal: &MockHal) -> Vec<HalCall> {
        hal.calls()
            .into_iter()
            .filter(|c| c.touches_hardware() || matches!(c, HalCall::SetVsync { .. }))
            .collect()
    }

    #[test]
    fn test_rejected_mode_change_restores_config() {
        let h = harness();
        h.run(h.job(vec![h.layer(0, 0)], None)).unwrap();
        h.hal.clear_calls();

        h.hal
            .fail_presents_with(Some(HalError::BadParameter("nope".into())));
        let job = PresentJob {
            power_change: None,
            config: Some(1),
            ..h.job(vec![h.layer(1, 0)], None)
        };
        let err = h.run(job).unwrap_err();
        assert!(matches!(err, CommitError::Rejected { .. }));
        assert_eq!(
            display_calls(&h.hal),
            vec![
                HalCall::SetActiveConfig {
                    display: 0,
                    config: 1
                },
                HalCall::Present {
                    display: 0,
                    layers: 1
                },
                HalCall::SetActiveConfig {
                    display: 0,
                    config: 0
                },
            ]
        );

        // Nothing is replayed once the display matches again
        h.hal.fail_presents_with(None);
        h.hal.clear_calls();
        let job = PresentJob {
            power_change: None,
            ..h.job(vec![h.layer(2, 0)], None)
        };
        h.run(job).unwrap();
        assert_eq!(
            display_calls(&h.hal),
            vec![HalCall::Present {
                display: 0,
                layers: 1
            }]
        );
    }

    #[test]
    fn test_rejected_power_on_leaves_display_dark() {
        let h = harness();
        h.hal
            .fail_presents_with(Some(HalError::BadParameter("nope".into())));
        let err = h.run(h.job(vec![h.layer(0, 0)], None)).unwrap_err();
        assert!(matches!(err, CommitError::Rejected { .. }));

        let calls = display_calls(&h.hal);
        assert_eq!(
            calls[calls.len() - 2..],
            [
                HalCall::SetVsync {
                    display: 0,
                    enabled: false
                },
                HalCall::SetPower {
                    display: 0,
                    on: false
                },
            ]
        );
    }

    #[test]
    fn test_device_errors_skip_restore() {
        let h = harness();
        h.hal.fail_presents_with(Some(HalError::Dead("binder died".into())));
        let err = h.run(h.job(vec![h.layer(0, 0)], None)).unwrap_err();
        assert!(matches!(err, CommitError::Device(_)));
        assert!(matches!(
            display_calls(&h.hal).last(),
            Some(HalCall::Present { .. })
        ));
    }

    #[test]
    fn test_power_off() {
        let h = harness();
        let job = PresentJob {
            active: false,
            power_change: Some(false),
            config: None,
            ..h.job(Vec::new(), None)
        };
        let presented = h.run(job).unwrap();
        assert_eq!(presented.composition, Composition::Disabled);
        assert!(h.hal.presents().is_empty());
    }

    #[test]
    fn test_shutdown_joins_idle_worker() {
        let h = harness();
        assert!(!h.worker.is_busy());
        h.worker.shutdown();
    }
}
