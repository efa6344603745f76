//! Display lifecycle and hotplug bookkeeping
//!
//! Each HAL display moves through `Unknown -> Connected -> Active ->
//! Disconnected -> Removed`. Hotplug notices for a CRTC with a commit in
//! flight are parked here until that commit settles.

use crate::hal::HalDisplayId;
use crate::model::ObjectId;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayPhase {
    Unknown,
    Connected,
    /// Connected with its CRTC scanning out
    Active,
    Disconnected,
    Removed,
}

impl DisplayPhase {
    pub fn can_transition_to(self, next: DisplayPhase) -> bool {
        use DisplayPhase::*;
        self == next
            || matches!(
                (self, next),
                (Unknown, Connected)
                    | (Connected, Active)
                    | (Connected, Disconnected)
                    | (Active, Connected)
                    | (Active, Disconnected)
                    | (Disconnected, Removed)
                    | (Disconnected, Connected)
                    | (Removed, Connected)
            )
    }
}

#[derive(Debug, Default)]
pub struct DisplayTracker {
    phases: BTreeMap<HalDisplayId, DisplayPhase>,
}

impl DisplayTracker {
    pub fn phase(&self, display: HalDisplayId) -> DisplayPhase {
        self.phases
            .get(&display)
            .copied()
            .unwrap_or(DisplayPhase::Unknown)
    }

    /// Move a display to `next`; invalid moves are logged and refused
    pub fn transition(&mut self, id: HalDisplayId, next: DisplayPhase) -> bool {
        let current = self.phase(id);
        if !current.can_transition_to(next) {
            warn!(
                "Ignoring display {} transition {:?} -> {:?}",
                id, current, next
            );
            return false;
        }
        if current != next {
            debug!("Display {}: {:?} -> {:?}", id, current, next);
        }
        self.phases.insert(id, next);
        true
    }

    pub fn displays(&self) -> impl Iterator<Item = (HalDisplayId, DisplayPhase)> + '_ {
        self.phases.iter().map(|(id, phase)| (*id, *phase))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HotplugNotice {
    pub display: HalDisplayId,
    pub connected: bool,
}

/// Hotplug notices waiting for a CRTC's commit to settle
#[derive(Debug, Default)]
pub struct DeferredHotplugs {
    by_crtc: BTreeMap<ObjectId, Vec<HotplugNotice>>,
}

impl DeferredHotplugs {
    /// Park a notice. A newer notice for the same display replaces the
    /// older one; only the final state matters once the commit is done.
    pub fn defer(&mut self, crtc: ObjectId, notice: HotplugNotice) {
        let queue = self.by_crtc.entry(crtc).or_default();
        queue.retain(|n| n.display != notice.display);
        queue.push(notice);
        debug!(
            "Deferred hotplug of display {} until CRTC {} settles",
            notice.display, crtc
        );
    }

    pub fn take(&mut self, crtc: ObjectId) -> Vec<HotplugNotice> {
        self.by_crtc.remove(&crtc).unwrap_or_default()
    }

    pub fn is_deferred(&self, crtc: ObjectId) -> bool {
        self.by_crtc.contains_key(&crtc)
    }

    pub fn len(&self) -> usize {
        self.by_crtc.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_crtc.is_empty()
    }
}
