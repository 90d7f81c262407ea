//! The Trove operation queue and its worker pool.
//!
//! Callers post operations and receive an op id; a fixed pool of worker
//! threads drains the bounded queue, performs the blocking backing-store
//! call and records the completion. Completions surface in arbitrary order.
//! Testing an op id is idempotent until the first test that observes the
//! completion, which reaps the record; ids are never recycled.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{EngineError, Result};
use crate::perf::PerfCounters;
use crate::trove::collection::Collection;
use crate::trove::{OpOutput, TroveOp};

/// Identifier of a posted Trove operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub(crate) u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

struct PendingOp {
    id: u64,
    coll: Arc<Collection>,
    op: TroveOp,
}

struct QueueShared {
    completions: Mutex<HashMap<u64, Result<OpOutput>>>,
    completed: Condvar,
    perf: Arc<PerfCounters>,
    io_retries: u32,
}

/// Bounded MPMC queue of pending operations with a fixed worker pool.
pub(crate) struct OpQueue {
    tx: Option<Sender<PendingOp>>,
    shared: Arc<QueueShared>,
    next_id: AtomicU64,
    workers: Vec<JoinHandle<()>>,
}

impl OpQueue {
    pub(crate) fn new(
        worker_threads: usize,
        queue_depth: usize,
        io_retries: u32,
        perf: Arc<PerfCounters>,
    ) -> OpQueue {
        let (tx, rx) = crossbeam_channel::bounded::<PendingOp>(queue_depth.max(1));
        let shared = Arc::new(QueueShared {
            completions: Mutex::new(HashMap::new()),
            completed: Condvar::new(),
            perf,
            io_retries,
        });
        let workers = (0..worker_threads.max(1))
            .map(|idx| {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("trove-worker-{idx}"))
                    .spawn(move || worker_loop(rx, shared))
                    .expect("failed to spawn trove worker")
            })
            .collect();
        OpQueue {
            tx: Some(tx),
            shared,
            next_id: AtomicU64::new(1),
            workers,
        }
    }

    /// Enqueue an operation, blocking briefly when the queue is full.
    pub(crate) fn post(&self, coll: Arc<Collection>, op: TroveOp) -> OpId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = PendingOp { id, coll, op };
        self.tx
            .as_ref()
            .expect("queue alive while posts are accepted")
            .send(pending)
            .expect("worker pool alive while posts are accepted");
        OpId(id)
    }

    /// Non-blocking completion check. Returns the result on the first call
    /// that observes the completion, reaping the record.
    pub(crate) fn test(&self, id: OpId) -> Option<Result<OpOutput>> {
        self.shared.completions.lock().remove(&id.0)
    }

    /// Test a batch of op ids in one lock acquisition. Slot `i` of the
    /// result corresponds to `ids[i]`; observed completions are reaped.
    pub(crate) fn test_some(&self, ids: &[OpId]) -> Vec<Option<Result<OpOutput>>> {
        let mut completions = self.shared.completions.lock();
        ids.iter().map(|id| completions.remove(&id.0)).collect()
    }

    /// Block until the operation completes, then reap it.
    pub(crate) fn wait(&self, id: OpId) -> Result<OpOutput> {
        let mut completions = self.shared.completions.lock();
        loop {
            if let Some(result) = completions.remove(&id.0) {
                return result;
            }
            self.shared.completed.wait(&mut completions);
        }
    }
}

impl Drop for OpQueue {
    fn drop(&mut self) {
        // Closing the channel ends every worker's receive loop.
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("trove worker panicked during shutdown");
            }
        }
    }
}

impl fmt::Debug for OpQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpQueue")
            .field("workers", &self.workers.len())
            .field("unreaped", &self.shared.completions.lock().len())
            .finish()
    }
}

fn worker_loop(rx: Receiver<PendingOp>, shared: Arc<QueueShared>) {
    for pending in rx.iter() {
        // An Internal result means the backing store violated an engine
        // invariant (for example a corrupt attribute record); that crashes
        // here instead of completing as an ordinary failure.
        let result =
            execute_with_retry(&pending, &shared).map_err(EngineError::fatal_on_internal);
        if let Ok(output) = &result {
            account(&shared.perf, &pending.op, output);
        }
        let mut completions = shared.completions.lock();
        completions.insert(pending.id, result);
        shared.completed.notify_all();
    }
}

/// Run the backing-store call, retrying transient I/O failures with a short
/// backoff. Exhausting the retry budget latches the collection degraded.
fn execute_with_retry(pending: &PendingOp, shared: &QueueShared) -> Result<OpOutput> {
    let mut attempt = 0u32;
    loop {
        match pending.op.execute(&pending.coll) {
            Ok(output) => return Ok(output),
            Err(err) if err.is_retryable() && attempt < shared.io_retries => {
                attempt += 1;
                let backoff = Duration::from_millis(10u64 << attempt.min(6));
                debug!(
                    "op {} attempt {attempt} failed ({err}), retrying in {backoff:?}",
                    pending.id
                );
                std::thread::sleep(backoff);
            }
            Err(err) => {
                if err.is_retryable() {
                    pending.coll.latch_degraded();
                }
                return Err(err);
            }
        }
    }
}

fn account(perf: &PerfCounters, op: &TroveOp, output: &OpOutput) {
    match (op, output) {
        (TroveOp::BstreamReadList { .. }, OpOutput::Read { transferred, .. }) => {
            perf.add_read_bytes(*transferred);
        }
        (TroveOp::BstreamWriteList { .. }, OpOutput::Transferred(bytes)) => {
            perf.add_write_bytes(*bytes);
        }
        (op, _) if op.is_mutating() => perf.add_md_write(),
        _ => perf.add_md_read(),
    }
}
