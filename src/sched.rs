//! The request scheduler.
//!
//! Serializes access to handles: for each handle, at most one exclusive
//! holder or any number of shared holders exists at a time. Bypass-mode
//! requests are orthogonal; they proceed concurrently with anything except
//! an exclusive holder. Waiters queue in strict FIFO order and are woken in
//! cohorts: a released token wakes either the exclusive waiter at the queue
//! front, or the contiguous run of shared waiters starting there. That keeps
//! an unbounded arrival of readers from starving a queued writer, because
//! only readers already ahead of the writer join the current cohort.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::handle::{FsId, Handle};

/// Access mode of a scheduler request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read sharing: coexists with other shared holders.
    Shared,
    /// Write exclusion: coexists with nothing.
    Exclusive,
    /// Commutative operation: waits only for an exclusive holder.
    Bypass,
}

/// Status of a posted scheduler request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    /// Queued behind incompatible predecessors.
    Waiting,
    /// The token is held; the owner must release it.
    Ready,
    /// The deadline expired before the token became ready. Terminal.
    TimedOut,
    /// The request was cancelled before it became ready. Terminal.
    Cancelled,
}

/// Identifier of a scheduler request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedId(u64);

impl fmt::Display for SchedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sched#{}", self.0)
    }
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    mode: AccessMode,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct HandleQueue {
    shared_holders: usize,
    exclusive_holder: Option<u64>,
    bypass_holders: usize,
    waiters: VecDeque<Waiter>,
}

impl HandleQueue {
    fn idle(&self) -> bool {
        self.shared_holders == 0
            && self.exclusive_holder.is_none()
            && self.bypass_holders == 0
            && self.waiters.is_empty()
    }

    /// Whether a newly posted request can hold the token immediately.
    /// Queued waiters block new shared/exclusive grants to preserve FIFO.
    fn admits(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Shared => {
                self.exclusive_holder.is_none() && self.waiters.is_empty()
            }
            AccessMode::Exclusive => {
                self.exclusive_holder.is_none()
                    && self.shared_holders == 0
                    && self.bypass_holders == 0
                    && self.waiters.is_empty()
            }
            AccessMode::Bypass => self.exclusive_holder.is_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Ready,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
struct Entry {
    key: (FsId, Handle),
    mode: AccessMode,
    state: EntryState,
    /// Opaque reference supplied by the posting state machine.
    user_ref: u64,
}

#[derive(Debug, Default)]
struct SchedInner {
    queues: HashMap<(FsId, Handle), HandleQueue>,
    entries: HashMap<u64, Entry>,
}

/// Per-server request scheduler.
#[derive(Debug, Default)]
pub struct Scheduler {
    inner: Mutex<SchedInner>,
    next_id: AtomicU64,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Scheduler {
        Scheduler {
            inner: Mutex::new(SchedInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Post a request for `handle` in `mode`. The returned id becomes ready
    /// once every incompatible predecessor has released, or terminal on
    /// deadline expiry or cancellation.
    pub fn post(
        &self,
        fs_id: FsId,
        handle: Handle,
        mode: AccessMode,
        deadline: Option<Duration>,
        user_ref: u64,
    ) -> SchedId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (fs_id, handle);
        let mut inner = self.inner.lock();
        let queue = inner.queues.entry(key).or_default();
        let state = if queue.admits(mode) {
            grant(queue, id, mode);
            EntryState::Ready
        } else {
            queue.waiters.push_back(Waiter {
                id,
                mode,
                deadline: deadline.map(|d| Instant::now() + d),
            });
            EntryState::Waiting
        };
        inner.entries.insert(
            id,
            Entry {
                key,
                mode,
                state,
                user_ref,
            },
        );
        SchedId(id)
    }

    /// Post a compound request over several handles of one filesystem.
    /// Handles are deduplicated and acquired in sorted order, so concurrent
    /// compound posts cannot deadlock against each other. The compound is
    /// ready once every constituent id reports ready.
    pub fn post_multi(
        &self,
        fs_id: FsId,
        handles: &[Handle],
        mode: AccessMode,
        deadline: Option<Duration>,
        user_ref: u64,
    ) -> Vec<SchedId> {
        let mut sorted: Vec<Handle> = handles.to_vec();
        sorted.sort();
        sorted.dedup();
        sorted
            .into_iter()
            .map(|h| self.post(fs_id, h, mode, deadline, user_ref))
            .collect()
    }

    /// Non-blocking status check. Expired deadlines are converted to
    /// `TimedOut` here; terminal states are reaped on first observation.
    pub fn test(&self, id: SchedId) -> Result<SchedStatus> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&id.0)
            .ok_or_else(|| EngineError::InvalidArgument(format!("{id} is unknown")))?;
        match entry.state {
            EntryState::Ready => Ok(SchedStatus::Ready),
            EntryState::TimedOut => {
                inner.entries.remove(&id.0);
                Ok(SchedStatus::TimedOut)
            }
            EntryState::Cancelled => {
                inner.entries.remove(&id.0);
                Ok(SchedStatus::Cancelled)
            }
            EntryState::Waiting => {
                let key = entry.key;
                if self.expire(&mut inner, key, id.0) {
                    inner.entries.remove(&id.0);
                    return Ok(SchedStatus::TimedOut);
                }
                Ok(SchedStatus::Waiting)
            }
        }
    }

    /// Relinquish a ready token, waking eligible waiters.
    pub fn release(&self, id: SchedId) -> Result<()> {
        self.release_inner(id, false)
    }

    /// Forcibly release a token whose holder was reaped without releasing.
    /// Logged, because it indicates a buggy consumer that would otherwise
    /// deadlock every later request on the handle.
    pub fn force_release(&self, id: SchedId) -> Result<()> {
        self.release_inner(id, true)
    }

    /// Cancel a request that has not become ready. Ready entries cannot be
    /// cancelled; their holder must release.
    pub fn cancel(&self, id: SchedId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&id.0)
            .ok_or_else(|| EngineError::InvalidArgument(format!("{id} is unknown")))?;
        match entry.state {
            EntryState::Waiting => {
                entry.state = EntryState::Cancelled;
                let key = entry.key;
                let queue = inner
                    .queues
                    .get_mut(&key)
                    .expect("waiting entry has a queue");
                queue.waiters.retain(|w| w.id != id.0);
                // Removing a waiter can unblock the queue front.
                self.wake(&mut inner, key);
                Ok(())
            }
            EntryState::Ready => Err(EngineError::InvalidArgument(
                "cannot cancel a ready request".into(),
            )),
            EntryState::TimedOut | EntryState::Cancelled => Ok(()),
        }
    }

    /// The opaque reference the poster attached to a live request.
    pub fn user_ref(&self, id: SchedId) -> Option<u64> {
        self.inner.lock().entries.get(&id.0).map(|e| e.user_ref)
    }

    /// Number of ready holders on a handle, for diagnostics.
    pub fn holder_count(&self, fs_id: FsId, handle: Handle) -> usize {
        let inner = self.inner.lock();
        inner
            .queues
            .get(&(fs_id, handle))
            .map(|q| {
                q.shared_holders
                    + q.bypass_holders
                    + usize::from(q.exclusive_holder.is_some())
            })
            .unwrap_or(0)
    }

    fn release_inner(&self, id: SchedId, forced: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .remove(&id.0)
            .ok_or_else(|| EngineError::InvalidArgument(format!("{id} is unknown")))?;
        if entry.state != EntryState::Ready {
            inner.entries.insert(id.0, entry);
            return Err(EngineError::InvalidArgument(format!(
                "{id} is not a ready token"
            )));
        }
        if forced {
            warn!(
                "forcibly releasing {id} (mode {:?}, user_ref {}): holder reaped without release",
                entry.mode, entry.user_ref
            );
        }
        let key = entry.key;
        {
            let queue = inner.queues.get_mut(&key).expect("ready entry has a queue");
            match entry.mode {
                AccessMode::Shared => queue.shared_holders -= 1,
                AccessMode::Exclusive => queue.exclusive_holder = None,
                AccessMode::Bypass => queue.bypass_holders -= 1,
            }
        }
        self.wake(&mut inner, key);
        Ok(())
    }

    /// Apply the wake policy to a handle queue, then drop it if idle.
    fn wake(&self, inner: &mut SchedInner, key: (FsId, Handle)) {
        let now = Instant::now();
        let mut newly_ready: Vec<u64> = Vec::new();
        {
            let Some(queue) = inner.queues.get_mut(&key) else {
                return;
            };
            // Expired waiters never become ready.
            let mut expired: Vec<u64> = Vec::new();
            queue.waiters.retain(|w| {
                let dead = w.deadline.is_some_and(|d| d <= now);
                if dead {
                    expired.push(w.id);
                }
                !dead
            });
            for id in expired {
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.state = EntryState::TimedOut;
                }
            }
            let queue = inner.queues.get_mut(&key).expect("queue still present");

            if queue.exclusive_holder.is_none() {
                match queue.waiters.front().map(|w| w.mode) {
                    Some(AccessMode::Exclusive)
                        if queue.shared_holders == 0 && queue.bypass_holders == 0 =>
                    {
                        let w = queue.waiters.pop_front().expect("front exists");
                        queue.exclusive_holder = Some(w.id);
                        newly_ready.push(w.id);
                    }
                    Some(AccessMode::Shared) => {
                        // Wake the contiguous run of shared waiters at the
                        // front as one cohort.
                        while matches!(
                            queue.waiters.front().map(|w| w.mode),
                            Some(AccessMode::Shared)
                        ) {
                            let w = queue.waiters.pop_front().expect("front exists");
                            queue.shared_holders += 1;
                            newly_ready.push(w.id);
                        }
                    }
                    _ => {}
                }
                // Bypass waiters only ever queue behind an exclusive holder;
                // unless one was just woken, they all proceed now.
                if queue.exclusive_holder.is_none() {
                    let mut rest = VecDeque::with_capacity(queue.waiters.len());
                    for w in queue.waiters.drain(..) {
                        if w.mode == AccessMode::Bypass {
                            queue.bypass_holders += 1;
                            newly_ready.push(w.id);
                        } else {
                            rest.push_back(w);
                        }
                    }
                    queue.waiters = rest;
                }
            }
            if queue.idle() {
                inner.queues.remove(&key);
            }
        }
        for id in newly_ready {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.state = EntryState::Ready;
            }
        }
    }

    /// Remove `id` from its wait queue if its deadline has passed. Returns
    /// whether it expired.
    fn expire(&self, inner: &mut SchedInner, key: (FsId, Handle), id: u64) -> bool {
        let now = Instant::now();
        let Some(queue) = inner.queues.get_mut(&key) else {
            return false;
        };
        let Some(pos) = queue.waiters.iter().position(|w| w.id == id) else {
            return false;
        };
        if !queue.waiters[pos].deadline.is_some_and(|d| d <= now) {
            return false;
        }
        queue.waiters.remove(pos);
        // Its departure may unblock the front of the queue.
        self.wake(inner, key);
        true
    }
}

fn grant(queue: &mut HandleQueue, id: u64, mode: AccessMode) {
    match mode {
        AccessMode::Shared => queue.shared_holders += 1,
        AccessMode::Exclusive => queue.exclusive_holder = Some(id),
        AccessMode::Bypass => queue.bypass_holders += 1,
    }
}
