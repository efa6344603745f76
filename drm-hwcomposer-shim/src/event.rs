//! Event delivery to compositors
//!
//! Every subscriber gets its own queue and a pollable eventfd. Reads yield
//! fixed-size records. Vsync events for a CRTC coalesce (only the newest
//! matters), while page-flip completions are never dropped: a full flip
//! queue blocks the producer for a bounded time and then overflows.

use crate::config::ShimConfig;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Size of one record on the event fd
pub const EVENT_RECORD_SIZE: usize = 32;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Vsync = 0x01,
    FlipComplete = 0x02,
    Hotplug = 0x10,
    CommitFailed = 0x11,
    DeviceLost = 0x12,
}

impl EventKind {
    pub fn from_raw(raw: u32) -> Option<EventKind> {
        Some(match raw {
            0x01 => EventKind::Vsync,
            0x02 => EventKind::FlipComplete,
            0x10 => EventKind::Hotplug,
            0x11 => EventKind::CommitFailed,
            0x12 => EventKind::DeviceLost,
            _ => return None,
        })
    }
}

/// One event as read from the event fd
///
/// Layout (native endian): `kind: u32, crtc_id: u32, timestamp_ns: u64,
/// sequence: u64, user_data: u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub crtc_id: u32,
    pub timestamp_ns: u64,
    pub sequence: u64,
    pub user_data: u64,
}

impl EventRecord {
    pub fn new(kind: EventKind, crtc_id: u32, timestamp_ns: u64, sequence: u64) -> Self {
        Self {
            kind,
            crtc_id,
            timestamp_ns,
            sequence,
            user_data: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; EVENT_RECORD_SIZE] {
        let mut out = [0u8; EVENT_RECORD_SIZE];
        out[0..4].copy_from_slice(&(self.kind as u32).to_ne_bytes());
        out[4..8].copy_from_slice(&self.crtc_id.to_ne_bytes());
        out[8..16].copy_from_slice(&self.timestamp_ns.to_ne_bytes());
        out[16..24].copy_from_slice(&self.sequence.to_ne_bytes());
        out[24..32].copy_from_slice(&self.user_data.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<EventRecord> {
        let bytes: &[u8; EVENT_RECORD_SIZE] = bytes.get(..EVENT_RECORD_SIZE)?.try_into().ok()?;
        let u32_at = |i: usize| u32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i..i + 8]);
            u64::from_ne_bytes(b)
        };
        Some(EventRecord {
            kind: EventKind::from_raw(u32_at(0))?,
            crtc_id: u32_at(4),
            timestamp_ns: u64_at(8),
            sequence: u64_at(16),
            user_data: u64_at(24),
        })
    }
}

/// CLOCK_MONOTONIC in nanoseconds, the clock hwcomposer timestamps use
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid timespec for the kernel to fill in
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

struct Entry {
    order: u64,
    record: EventRecord,
}

#[derive(Default)]
struct QueueState {
    ordered: VecDeque<Entry>,
    vsync: BTreeMap<u32, Entry>,
    flips: HashMap<u32, usize>,
    next_order: u64,
    coalesced: u64,
    overflowed: u64,
    /// Timed out once on a full flip queue; later flips overflow at once
    stalled: bool,
    signalled: bool,
    closed: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.ordered.len() + self.vsync.len()
    }
}

pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    readable: Condvar,
    writable: Condvar,
    efd: OwnedFd,
    flip_depth: usize,
    backpressure: Duration,
}

impl EventQueue {
    fn new(flip_depth: usize, backpressure: Duration) -> io::Result<Self> {
        // SAFETY: plain syscall, the result is checked below
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            state: Mutex::new(QueueState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
            // SAFETY: eventfd returned a fresh descriptor we own
            efd: unsafe { OwnedFd::from_raw_fd(fd) },
            flip_depth: flip_depth.max(1),
            backpressure,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep the eventfd readable exactly while the queue is non-empty
    fn sync_fd(&self, state: &mut QueueState) {
        let want = state.len() > 0;
        if want == state.signalled {
            return;
        }
        let mut value: u64 = 1;
        // SAFETY: 8-byte reads and writes on our own eventfd
        let rc = unsafe {
            if want {
                libc::write(self.efd.as_raw_fd(), (&value as *const u64).cast(), 8)
            } else {
                libc::read(self.efd.as_raw_fd(), (&mut value as *mut u64).cast(), 8)
            }
        };
        if rc == 8 {
            state.signalled = want;
        } else {
            debug!("eventfd sync failed: {}", io::Error::last_os_error());
        }
    }

    fn push(&self, record: EventRecord) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        match record.kind {
            EventKind::Vsync => {
                // A newer vsync replaces the pending one and queues behind
                // whatever arrived in between
                let order = state.next_order;
                state.next_order += 1;
                if state.vsync.insert(record.crtc_id, Entry { order, record }).is_some() {
                    state.coalesced += 1;
                    return;
                }
            }
            kind => {
                if kind == EventKind::FlipComplete {
                    let crtc = record.crtc_id;
                    let full = |s: &QueueState| s.flips.get(&crtc).copied().unwrap_or(0) >= self.flip_depth;
                    let deadline = Instant::now() + self.backpressure;
                    while full(&*state) && !state.stalled && !state.closed {
                        let now = Instant::now();
                        if now >= deadline {
                            state.stalled = true;
                            warn!(
                                "Flip queue for CRTC {} full for {:?}, not waiting on this subscriber until it reads",
                                crtc, self.backpressure
                            );
                            break;
                        }
                        state = self
                            .writable
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                    if state.closed {
                        return;
                    }
                    if full(&*state) {
                        state.overflowed += 1;
                    }
                    *state.flips.entry(crtc).or_insert(0) += 1;
                }
                let order = state.next_order;
                state.next_order += 1;
                state.ordered.push_back(Entry { order, record });
            }
        }
        self.sync_fd(&mut state);
        self.readable.notify_all();
    }

    fn pop_locked(&self, state: &mut QueueState) -> Option<EventRecord> {
        let oldest_vsync = state
            .vsync
            .iter()
            .min_by_key(|(_, e)| e.order)
            .map(|(crtc, e)| (*crtc, e.order));
        let front = state.ordered.front().map(|e| e.order);

        let record = match (oldest_vsync, front) {
            (Some((crtc, v)), Some(f)) if v < f => state.vsync.remove(&crtc).map(|e| e.record),
            (Some((crtc, _)), None) => state.vsync.remove(&crtc).map(|e| e.record),
            _ => state.ordered.pop_front().map(|e| e.record),
        }?;

        if record.kind == EventKind::FlipComplete {
            if let Some(count) = state.flips.get_mut(&record.crtc_id) {
                *count = count.saturating_sub(1);
            }
            state.stalled = false;
            self.writable.notify_all();
        }
        self.sync_fd(state);
        Some(record)
    }

    fn pop(&self) -> Option<EventRecord> {
        let mut state = self.lock();
        self.pop_locked(&mut state)
    }

    fn wait_pop(&self, timeout: Duration) -> Option<EventRecord> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(record) = self.pop_locked(&mut state) {
                return Some(record);
            }
            let now = Instant::now();
            if now >= deadline || state.closed {
                return None;
            }
            state = self
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.writable.notify_all();
        self.readable.notify_all();
    }
}

/// A subscriber's end of the event stream
pub struct EventSource {
    queue: Arc<EventQueue>,
}

impl EventSource {
    pub fn try_next(&self) -> Option<EventRecord> {
        self.queue.pop()
    }

    /// Block up to `timeout` for the next event
    pub fn wait_next(&self, timeout: Duration) -> Option<EventRecord> {
        self.queue.wait_pop(timeout)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Flip completions that had to be queued past the configured depth
    pub fn overflow_count(&self) -> u64 {
        self.queue.lock().overflowed
    }

    pub fn coalesced_vsyncs(&self) -> u64 {
        self.queue.lock().coalesced
    }

    /// Copy whole records into `buf`. `WouldBlock` when nothing is queued.
    pub fn read_records(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() < EVENT_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer smaller than one event record",
            ));
        }
        let mut state = self.queue.lock();
        let mut written = 0;
        while written + EVENT_RECORD_SIZE <= buf.len() {
            match self.queue.pop_locked(&mut state) {
                Some(record) => {
                    buf[written..written + EVENT_RECORD_SIZE].copy_from_slice(&record.to_bytes());
                    written += EVENT_RECORD_SIZE;
                }
                None => break,
            }
        }
        if written == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(written)
    }
}

impl io::Read for EventSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_records(buf)
    }
}

impl AsRawFd for EventSource {
    fn as_raw_fd(&self) -> RawFd {
        self.queue.efd.as_raw_fd()
    }
}

impl AsFd for EventSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.queue.efd.as_fd()
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Fan-out of device events to every live subscriber
pub(crate) struct EventHub {
    subscribers: Mutex<Vec<Weak<EventQueue>>>,
    flip_depth: usize,
    backpressure: Duration,
}

impl EventHub {
    pub(crate) fn new(config: &ShimConfig) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            flip_depth: config.flip_queue_depth,
            backpressure: config.backpressure_timeout(),
        }
    }

    pub(crate) fn subscribe(&self) -> io::Result<EventSource> {
        let queue = Arc::new(EventQueue::new(self.flip_depth, self.backpressure)?);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&queue));
        Ok(EventSource { queue })
    }

    /// Deliver to every subscriber. May block on a full flip queue, so
    /// never call with the model lock held.
    pub(crate) fn publish(&self, record: EventRecord) {
        let queues: Vec<Arc<EventQueue>> = {
            let mut subs = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subs.retain(|q| q.strong_count() > 0);
            subs.iter().filter_map(Weak::upgrade).collect()
        };
        for queue in queues {
            queue.push(record);
        }
    }

    pub(crate) fn close_all(&self) {
        let subs = std::mem::take(
            &mut *self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for queue in subs.iter().filter_map(Weak::upgrade) {
            queue.close();
        }
    }
}
