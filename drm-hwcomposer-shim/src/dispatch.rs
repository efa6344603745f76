//! Event dispatch thread
//!
//! HAL callbacks (vsync, hotplug) and present-worker completions arrive on
//! arbitrary threads. They are forwarded here as messages and handled one at
//! a time on a single thread, which is the only place committed state
//! changes. The same loop runs the present watchdog.

use crate::commit::{self, CommitObjects, CrtcOutcome, InFlight};
use crate::drm_device::{lock, Shared};
use crate::error::{CommitError, DeviceError};
use crate::event::{monotonic_ns, EventKind, EventRecord};
use crate::hal::HalDisplayId;
use crate::hotplug::{DeferredHotplugs, DisplayPhase, HotplugNotice};
use crate::model::ObjectId;
use crate::worker::{CrtcCompletion, Presented};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MIN_TICK: Duration = Duration::from_millis(5);

pub(crate) enum DispatchMsg {
    Vsync {
        display: HalDisplayId,
        timestamp_ns: u64,
    },
    Hotplug(HotplugNotice),
    Completed(CrtcCompletion),
    /// Settle objects of a commit that touched no CRTC
    Settle {
        objects: CommitObjects,
        reply: Option<Sender<()>>,
    },
    Shutdown,
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    rx: Receiver<DispatchMsg>,
    deferred: DeferredHotplugs,
    flips: HashMap<ObjectId, u64>,
    /// Results of multi-CRTC commits still waiting on other CRTCs
    groups: HashMap<u64, Vec<(ObjectId, Result<Presented, CommitError>)>>,
    vblanks: HashMap<ObjectId, u64>,
    hotplugs: u64,
    tick: Duration,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, rx: Receiver<DispatchMsg>) -> Self {
        let tick = (shared.config.watchdog_timeout() / 4).max(MIN_TICK);
        Self {
            shared,
            rx,
            deferred: DeferredHotplugs::default(),
            flips: HashMap::new(),
            groups: HashMap::new(),
            vblanks: HashMap::new(),
            hotplugs: 0,
            tick,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("Dispatch thread started, watchdog tick {:?}", self.tick);
        loop {
            match self.rx.recv_timeout(self.tick) {
                Ok(DispatchMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.check_watchdog();
        }
        debug!("Dispatch thread exiting");
    }

    fn handle(&mut self, msg: DispatchMsg) {
        match msg {
            DispatchMsg::Vsync {
                display,
                timestamp_ns,
            } => self.on_vsync(display, timestamp_ns),
            DispatchMsg::Hotplug(notice) => self.on_hotplug(notice),
            DispatchMsg::Completed(completion) => self.on_completed(completion),
            DispatchMsg::Settle { objects, reply } => {
                objects.settle(&mut lock(&self.shared.model), true);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            DispatchMsg::Shutdown => {}
        }
    }

    fn on_vsync(&mut self, display: HalDisplayId, timestamp_ns: u64) {
        let Some(crtc) = lock(&self.shared.model).crtc_for_display(display) else {
            return;
        };
        let seq = self.vblanks.entry(crtc).or_insert(0);
        *seq += 1;
        let record = EventRecord::new(EventKind::Vsync, crtc.raw(), timestamp_ns, *seq);
        self.shared.events.publish(record);
    }

    fn on_hotplug(&mut self, notice: HotplugNotice) {
        {
            let model = lock(&self.shared.model);
            if model.lost.is_some() {
                debug!("Ignoring hotplug of display {} on a lost device", notice.display);
                return;
            }
            if let Some(crtc) = model.crtc_for_display(notice.display) {
                let busy = model
                    .crtcs
                    .get(&crtc)
                    .is_some_and(|c| c.in_flight.is_some());
                if busy {
                    drop(model);
                    self.deferred.defer(crtc, notice);
                    return;
                }
            }
        }
        self.reconcile(notice);
    }

    /// Bring the model in line with a display's new connection state
    fn reconcile(&mut self, notice: HotplugNotice) {
        let display_id = notice.display;
        let crtc = if notice.connected {
            // Query the HAL without holding the model lock
            let hal = &self.shared.hal;
            let info = match hal.enumerate_displays() {
                Ok(displays) => displays.into_iter().find(|d| d.id == display_id),
                Err(e) => {
                    warn!("Cannot query display {} after hotplug: {}", display_id, e);
                    None
                }
            };
            let Some(info) = info else {
                warn!("Hotplugged display {} is not reported by the HAL", display_id);
                return;
            };
            let modes = hal.get_modes(display_id).unwrap_or_else(|e| {
                warn!("Cannot read modes of display {}: {}", display_id, e);
                Vec::new()
            });

            let attached = {
                let mut model = lock(&self.shared.model);
                model.attach_display(&info, modes, self.shared.config.fallback_mode())
            };
            match attached {
                Ok(attached) => {
                    if attached.new_crtc {
                        if let Err(e) = self.shared.spawn_worker(attached.crtc) {
                            error!("Cannot start present worker for CRTC {}: {}", attached.crtc, e);
                        }
                    }
                    if !attached.changed {
                        return;
                    }
                    info!("Display {} connected on CRTC {}", display_id, attached.crtc);
                    attached.crtc
                }
                Err(e) => {
                    error!("Cannot add hotplugged display {}: {}", display_id, e);
                    return;
                }
            }
        } else {
            let detached = lock(&self.shared.model).detach_display(display_id);
            match detached {
                Some(detached) => detached.crtc,
                None => return,
            }
        };

        self.hotplugs += 1;
        let record = EventRecord::new(EventKind::Hotplug, crtc.raw(), monotonic_ns(), self.hotplugs);
        self.shared.events.publish(record);
    }

    fn on_completed(&mut self, completion: CrtcCompletion) {
        let CrtcCompletion {
            crtc,
            commit_id,
            result,
        } = completion;

        let (restoring, group) = {
            let model = lock(&self.shared.model);
            match model.crtcs.get(&crtc).and_then(|c| c.in_flight.as_ref()) {
                Some(f) if f.commit_id == commit_id => (f.restoring, Arc::clone(&f.group)),
                _ => {
                    debug!("Ignoring stale completion of commit {} on CRTC {}", commit_id, crtc);
                    return;
                }
            }
        };
        if restoring {
            self.on_restored(crtc, commit_id, result);
            return;
        }

        let reported = self.groups.entry(commit_id).or_default();
        reported.push((crtc, result));
        if reported.len() < group.len() {
            debug!(
                "Commit {}: CRTC {} done, waiting on {} more",
                commit_id,
                crtc,
                group.len() - reported.len()
            );
            return;
        }
        let results = self.groups.remove(&commit_id).unwrap_or_default();
        self.resolve(commit_id, results);
    }

    /// Settle a commit once every CRTC in it has reported. One failure
    /// rolls back all of them.
    fn resolve(&mut self, commit_id: u64, mut results: Vec<(ObjectId, Result<Presented, CommitError>)>) {
        // Callers waiting on the first reply should see the real cause
        results.sort_by_key(|(_, r)| r.is_ok());
        let failure = results
            .iter()
            .find_map(|(crtc, r)| r.as_ref().err().map(|e| (*crtc, e.clone())));
        let accepted = failure.is_none();
        let device_failed = matches!(failure, Some((_, CommitError::Device(_))));

        let mut restores = Vec::new();
        let settled = {
            let mut model = lock(&self.shared.model);
            let mut settled = Vec::with_capacity(results.len());
            for (crtc, result) in results {
                let Some(c) = model.crtcs.get_mut(&crtc) else {
                    continue;
                };
                let Some(in_flight) = c.in_flight.take() else {
                    continue;
                };
                let display_id = c.hal_display;
                in_flight.objects.settle(&mut model, accepted);
                settled.push((crtc, display_id, in_flight, result));
            }
            for (crtc, display_id, _, result) in &settled {
                if accepted {
                    let active = model
                        .crtcs
                        .get(crtc)
                        .is_some_and(|c| c.state.committed().active);
                    let phase = model.displays.phase(*display_id);
                    if matches!(phase, DisplayPhase::Connected | DisplayPhase::Active) {
                        let next = if active {
                            DisplayPhase::Active
                        } else {
                            DisplayPhase::Connected
                        };
                        model.displays.transition(*display_id, next);
                    }
                } else if result.is_ok() && !device_failed {
                    // This display took the new state; put the old one back
                    if let Some(job) = commit::restore_job(&model, *crtc, commit_id) {
                        if let Some(c) = model.crtcs.get_mut(crtc) {
                            c.in_flight = Some(InFlight::restoring(commit_id, *crtc));
                        }
                        restores.push(job);
                    }
                }
            }
            settled
        };

        for job in restores {
            let crtc = job.crtc;
            info!("Commit {} failed elsewhere, restoring CRTC {}", commit_id, crtc);
            let submitted = match lock(&self.shared.workers).get(&crtc) {
                Some(worker) => worker.submit(job),
                None => Err(CommitError::Rejected {
                    crtc,
                    reason: "no present worker".to_string(),
                }),
            };
            if let Err(e) = submitted {
                error!("Cannot restore CRTC {} after commit {}: {}", crtc, commit_id, e);
                if let Some(c) = lock(&self.shared.model).crtcs.get_mut(&crtc) {
                    c.in_flight = None;
                }
            }
        }

        let mut done = Vec::with_capacity(settled.len());
        for (crtc, display_id, in_flight, result) in settled {
            let outcome = match (result, &failure) {
                (Ok(presented), None) => {
                    let seq = self.flips.entry(crtc).or_insert(0);
                    *seq += 1;
                    debug!(
                        "Commit {} on CRTC {} (display {}) done: {:?}, flip {}",
                        commit_id, crtc, display_id, presented.composition, seq
                    );
                    let mut record = EventRecord::new(
                        EventKind::FlipComplete,
                        crtc.raw(),
                        presented.timestamp_ns,
                        *seq,
                    );
                    record.user_data = in_flight.user_data;
                    self.shared.events.publish(record);
                    Ok(CrtcOutcome {
                        crtc,
                        composition: presented.composition,
                        sequence: *seq,
                        timestamp_ns: presented.timestamp_ns,
                    })
                }
                (Err(e), _) => Err(e),
                (Ok(_), Some((failed, CommitError::Device(e)))) => {
                    debug!("CRTC {} goes down with CRTC {}", crtc, failed);
                    Err(CommitError::Device(e.clone()))
                }
                (Ok(_), Some((failed, e))) => Err(CommitError::Rejected {
                    crtc,
                    reason: format!("CRTC {} of the same commit failed: {}", failed, e),
                }),
            };
            if let Err(e) = &outcome {
                warn!("Commit {} on CRTC {} rolled back: {}", commit_id, crtc, e);
                if in_flight.reply.is_none() {
                    // Stored before the event so a reader of the event finds it
                    lock(&self.shared.async_failure).get_or_insert_with(|| e.clone());
                }
                let seq = self.flips.get(&crtc).copied().unwrap_or(0);
                let mut record =
                    EventRecord::new(EventKind::CommitFailed, crtc.raw(), monotonic_ns(), seq);
                record.user_data = in_flight.user_data;
                self.shared.events.publish(record);
            }
            if let Some(reply) = in_flight.reply {
                let _ = reply.send(outcome);
            }
            done.push(crtc);
        }

        if let Some((_, CommitError::Device(e))) = failure {
            self.device_lost(e);
            return;
        }
        for crtc in done {
            self.apply_deferred(crtc);
        }
    }

    fn on_restored(&mut self, crtc: ObjectId, commit_id: u64, result: Result<Presented, CommitError>) {
        if let Some(c) = lock(&self.shared.model).crtcs.get_mut(&crtc) {
            c.in_flight = None;
        }
        match result {
            Ok(_) => debug!("CRTC {} is back on its committed state after commit {}", crtc, commit_id),
            Err(CommitError::Device(e)) => {
                self.device_lost(e);
                return;
            }
            Err(e) => error!("CRTC {} could not be restored after commit {}: {}", crtc, commit_id, e),
        }
        self.apply_deferred(crtc);
    }

    fn apply_deferred(&mut self, crtc: ObjectId) {
        let busy = lock(&self.shared.model)
            .crtcs
            .get(&crtc)
            .is_some_and(|c| c.in_flight.is_some());
        if busy {
            return;
        }
        for notice in self.deferred.take(crtc) {
            debug!("Applying deferred hotplug of display {}", notice.display);
            self.reconcile(notice);
        }
    }

    fn check_watchdog(&mut self) {
        let timeout = self.shared.config.watchdog_timeout();
        let stuck = {
            let model = lock(&self.shared.model);
            if model.lost.is_some() {
                return;
            }
            model.crtcs.values().find_map(|c| {
                let elapsed = c.in_flight.as_ref()?.started.elapsed();
                (elapsed > timeout).then_some((c.id, elapsed))
            })
        };
        if let Some((crtc, elapsed)) = stuck {
            self.device_lost(DeviceError::WatchdogTimeout { crtc, elapsed });
        }
    }

    /// Fail every pending commit and report the device as gone
    fn device_lost(&mut self, error: DeviceError) {
        let flushed = {
            let mut model = lock(&self.shared.model);
            if model.lost.is_some() {
                return;
            }
            error!("Device lost: {}", error);
            model.mark_lost(error.clone());
            self.groups.clear();
            let crtcs: Vec<ObjectId> = model.crtcs.keys().copied().collect();
            let mut flushed = Vec::new();
            for id in crtcs {
                let in_flight = model.crtcs.get_mut(&id).and_then(|c| c.in_flight.take());
                if let Some(in_flight) = in_flight {
                    in_flight.objects.settle(&mut model, false);
                    flushed.push((id, in_flight));
                }
            }
            flushed
        };

        let now = monotonic_ns();
        for (crtc, in_flight) in flushed {
            if in_flight.restoring {
                continue;
            }
            let seq = self.flips.get(&crtc).copied().unwrap_or(0);
            let mut record = EventRecord::new(EventKind::CommitFailed, crtc.raw(), now, seq);
            record.user_data = in_flight.user_data;
            self.shared.events.publish(record);
            if let Some(reply) = in_flight.reply {
                let _ = reply.send(Err(CommitError::Device(error.clone())));
            }
        }
        let crtc = match &error {
            DeviceError::WatchdogTimeout { crtc, .. } => crtc.raw(),
            _ => 0,
        };
        self.shared
            .events
            .publish(EventRecord::new(EventKind::DeviceLost, crtc, now, 0));
    }
}
