//! Per-server performance counters.
//!
//! Counters accumulate into the current sample of a fixed-length ring and
//! roll over at a configured interval. Consumers poll the ring at any
//! frequency; intervals during which the server recorded nothing appear as
//! `valid = false` gaps, so a slow poller can still line samples up in time.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::trove::dspace::now_ms;

/// One interval's worth of counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfSample {
    /// Monotonically increasing sample identifier.
    pub id: u64,
    /// Wall-clock start of the interval, milliseconds since the epoch.
    pub start_time_ms: u64,
    /// Bstream bytes read.
    pub read_bytes: u64,
    /// Bstream bytes written.
    pub write_bytes: u64,
    /// Metadata read operations.
    pub md_read_count: u64,
    /// Metadata write operations.
    pub md_write_count: u64,
    /// False for gap entries synthesized for idle intervals.
    pub valid: bool,
}

impl PerfSample {
    fn gap(id: u64, start_time_ms: u64) -> PerfSample {
        PerfSample {
            id,
            start_time_ms,
            read_bytes: 0,
            write_bytes: 0,
            md_read_count: 0,
            md_write_count: 0,
            valid: false,
        }
    }
}

struct PerfInner {
    ring: Vec<PerfSample>,
    /// Start instant of the sample currently accumulating.
    current_started: Instant,
    current: PerfSample,
    next_id: u64,
}

/// Ring of [`PerfSample`]s with interval rollover.
pub struct PerfCounters {
    interval: Duration,
    history: usize,
    inner: Mutex<PerfInner>,
}

impl PerfCounters {
    /// Create a counter ring keeping `history` samples per `interval`.
    pub fn new(history: usize, interval: Duration) -> PerfCounters {
        let history = history.max(1);
        PerfCounters {
            interval,
            history,
            inner: Mutex::new(PerfInner {
                ring: Vec::with_capacity(history),
                current_started: Instant::now(),
                current: PerfSample {
                    id: 0,
                    start_time_ms: now_ms(),
                    read_bytes: 0,
                    write_bytes: 0,
                    md_read_count: 0,
                    md_write_count: 0,
                    valid: true,
                },
                next_id: 1,
            }),
        }
    }

    /// Account bstream bytes read.
    pub fn add_read_bytes(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        self.roll(&mut inner);
        inner.current.read_bytes += bytes;
    }

    /// Account bstream bytes written.
    pub fn add_write_bytes(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        self.roll(&mut inner);
        inner.current.write_bytes += bytes;
    }

    /// Account one metadata read operation.
    pub fn add_md_read(&self) {
        let mut inner = self.inner.lock();
        self.roll(&mut inner);
        inner.current.md_read_count += 1;
    }

    /// Account one metadata write operation.
    pub fn add_md_write(&self) {
        let mut inner = self.inner.lock();
        self.roll(&mut inner);
        inner.current.md_write_count += 1;
    }

    /// Snapshot of the ring, oldest first, ending with the sample still
    /// accumulating.
    pub fn snapshot(&self) -> Vec<PerfSample> {
        let mut inner = self.inner.lock();
        self.roll(&mut inner);
        let mut out = inner.ring.clone();
        out.push(inner.current);
        out
    }

    /// Close out elapsed intervals, inserting gap entries for idle ones.
    fn roll(&self, inner: &mut PerfInner) {
        let mut elapsed = inner.current_started.elapsed();
        while elapsed >= self.interval {
            let finished = inner.current;
            push_ring(&mut inner.ring, finished, self.history);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.current = PerfSample::gap(id, finished.start_time_ms + self.interval.as_millis() as u64);
            inner.current.valid = true;
            // Idle intervals beyond the first become invalid gaps below.
            inner.current_started += self.interval;
            elapsed = inner.current_started.elapsed();
            if elapsed >= self.interval {
                inner.current.valid = false;
            }
        }
    }
}

fn push_ring(ring: &mut Vec<PerfSample>, sample: PerfSample, history: usize) {
    ring.push(sample);
    if ring.len() > history {
        let excess = ring.len() - history;
        ring.drain(..excess);
    }
}

impl std::fmt::Debug for PerfCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfCounters")
            .field("interval", &self.interval)
            .field("history", &self.history)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_in_current_sample() {
        let perf = PerfCounters::new(4, Duration::from_secs(60));
        perf.add_read_bytes(100);
        perf.add_read_bytes(50);
        perf.add_write_bytes(7);
        perf.add_md_read();
        perf.add_md_write();
        let snap = perf.snapshot();
        let cur = snap.last().unwrap();
        assert_eq!(cur.read_bytes, 150);
        assert_eq!(cur.write_bytes, 7);
        assert_eq!(cur.md_read_count, 1);
        assert_eq!(cur.md_write_count, 1);
        assert!(cur.valid);
    }

    #[test]
    fn idle_intervals_appear_as_gaps() {
        let perf = PerfCounters::new(8, Duration::from_millis(10));
        perf.add_write_bytes(1);
        std::thread::sleep(Duration::from_millis(45));
        let snap = perf.snapshot();
        // The first sample carries the write, at least one gap follows.
        assert!(snap[0].valid);
        assert_eq!(snap[0].write_bytes, 1);
        assert!(snap.iter().skip(1).any(|s| !s.valid));
        // Identifiers stay monotonically increasing.
        for pair in snap.windows(2) {
            assert!(pair[1].id > pair[0].id);
        }
    }

    #[test]
    fn ring_is_bounded_by_history() {
        let perf = PerfCounters::new(3, Duration::from_millis(5));
        for _ in 0..4 {
            perf.add_md_read();
            std::thread::sleep(Duration::from_millis(12));
        }
        assert!(perf.snapshot().len() <= 4);
    }
}
