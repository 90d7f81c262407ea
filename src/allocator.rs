//! Per-collection handle allocator.
//!
//! Issues unused handles within the collection's configured range and
//! reclaims them on dataspace removal. The allocator itself is not durable;
//! the live-handle set is rebuilt at collection open time from the backing
//! store's dataspace records.

use std::collections::BTreeSet;

use crate::error::{EngineError, Result};
use crate::handle::{Handle, HandleRange};

/// Tracks the live handles of one collection.
///
/// Allocation prefers the numerically smallest free handle so that directory
/// listings over freshly-populated collections stay compact.
#[derive(Debug)]
pub struct HandleAllocator {
    range: HandleRange,
    live: BTreeSet<Handle>,
}

impl HandleAllocator {
    /// Create an empty allocator over `range`.
    pub fn new(range: HandleRange) -> HandleAllocator {
        HandleAllocator {
            range,
            live: BTreeSet::new(),
        }
    }

    /// The range this allocator issues from.
    pub fn range(&self) -> HandleRange {
        self.range
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Whether `handle` is currently live.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.live.contains(&handle)
    }

    /// Return the smallest unused handle in the range, marking it live.
    pub fn allocate(&mut self) -> Result<Handle> {
        let mut candidate = self.range.first.0;
        for live in self.live.range(self.range.first..=self.range.last) {
            if live.0 == candidate {
                candidate = match candidate.checked_add(1) {
                    Some(next) => next,
                    None => return Err(EngineError::OutOfHandles),
                };
            } else {
                break;
            }
        }
        if candidate > self.range.last.0 {
            return Err(EngineError::OutOfHandles);
        }
        let handle = Handle(candidate);
        self.live.insert(handle);
        Ok(handle)
    }

    /// Mark a specific handle live, used during directory restore.
    ///
    /// Fails with `InvalidArgument` if the handle is outside the range and
    /// with `Exist` if it is already live.
    pub fn reserve(&mut self, handle: Handle) -> Result<()> {
        if !self.range.contains(handle) {
            return Err(EngineError::InvalidArgument(format!(
                "handle {handle} outside collection range"
            )));
        }
        if !self.live.insert(handle) {
            return Err(EngineError::Exist);
        }
        Ok(())
    }

    /// Return a handle to the free pool. No-op if the handle is not live.
    pub fn release(&mut self, handle: Handle) {
        self.live.remove(&handle);
    }

    /// Seed the live set from handles recovered out of the backing store.
    /// Out-of-range handles are kept live so existing dataspaces stay
    /// reachable after a range reconfiguration, but nothing new is issued
    /// from outside the range.
    pub fn recover<I: IntoIterator<Item = Handle>>(&mut self, handles: I) {
        self.live.extend(handles);
    }
}
