//! The Trove storage engine.
//!
//! Trove is the per-server persistent store: objects (dataspaces) identified
//! by opaque handles, each carrying a sparse byte stream and a typed keyval
//! map, organized into named collections. All mutation and query is posted
//! asynchronously onto a bounded queue drained by a worker pool; completion
//! is observed by testing the returned op id.

use std::sync::Arc;

use bitflags::bitflags;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::handle::{DsType, FsId, Handle};
use crate::perf::PerfCounters;

pub mod bstream;
pub mod collection;
pub(crate) mod dspace;
pub(crate) mod keyval;
mod queue;

pub use bstream::{MemRegion, MemRegions, StreamRegion, StreamRegions};
pub use collection::{Collection, CollectionRegistry, ROOT_HANDLE_KEY};
pub use dspace::DsAttr;
pub use queue::OpId;

bitflags! {
    /// Behavior flags of keyval writes and removals.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyvalFlags: u32 {
        /// Fail with `Exist` instead of replacing a live entry.
        const NO_OVERWRITE = 1 << 0;
        /// Make the entry durable before completing.
        const SYNC = 1 << 1;
    }
}

bitflags! {
    /// Behavior flags of bstream writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BstreamFlags: u32 {
        /// Make the written regions durable before completing. Without it,
        /// completion guarantees visibility to this process only.
        const SYNC = 1 << 1;
    }
}

/// Cursor of a keyval iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyvalPosition {
    /// Begin at the first entry.
    Start,
    /// Resume after the entry with this key.
    After(Vec<u8>),
    /// The iteration is exhausted.
    End,
}

/// One entry returned by keyval iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyvalEntry {
    /// The entry's key.
    pub key: Vec<u8>,
    /// The entry's value.
    pub value: Vec<u8>,
}

/// An operation accepted by [`Trove::post`].
#[derive(Debug, Clone)]
pub enum TroveOp {
    /// Create a dataspace; a non-null `hint` requests that exact handle.
    DspaceCreate {
        /// Requested handle, or [`Handle::NULL`] to allocate.
        hint: Handle,
        /// Type of the new dataspace.
        ds_type: DsType,
    },
    /// Remove a dataspace, its keyval entries and its bstream.
    DspaceRemove {
        /// Target dataspace.
        handle: Handle,
    },
    /// Fetch dataspace attributes.
    DspaceGetAttr {
        /// Target dataspace.
        handle: Handle,
    },
    /// Read one keyval entry.
    KeyvalRead {
        /// Target dataspace.
        handle: Handle,
        /// Entry key.
        key: Vec<u8>,
    },
    /// Write one keyval entry.
    KeyvalWrite {
        /// Target dataspace.
        handle: Handle,
        /// Entry key.
        key: Vec<u8>,
        /// Entry value.
        value: Vec<u8>,
        /// Write behavior.
        flags: KeyvalFlags,
    },
    /// Remove one keyval entry.
    KeyvalRemove {
        /// Target dataspace.
        handle: Handle,
        /// Entry key.
        key: Vec<u8>,
        /// Removal behavior (`SYNC` honored).
        flags: KeyvalFlags,
    },
    /// Page through a dataspace's keyval entries.
    KeyvalIterate {
        /// Target dataspace.
        handle: Handle,
        /// Where to resume.
        cursor: KeyvalPosition,
        /// Page size.
        max_count: usize,
    },
    /// Scatter/gather read from a bstream.
    BstreamReadList {
        /// Target dataspace.
        handle: Handle,
        /// Size of the buffer the completion carries.
        buf_len: usize,
        /// Memory regions within that buffer.
        mem: MemRegions,
        /// Stream regions to read.
        stream: StreamRegions,
    },
    /// Scatter/gather write into a bstream.
    BstreamWriteList {
        /// Target dataspace.
        handle: Handle,
        /// Source buffer.
        data: Vec<u8>,
        /// Memory regions within the source buffer.
        mem: MemRegions,
        /// Stream regions to write.
        stream: StreamRegions,
        /// Write behavior.
        flags: BstreamFlags,
    },
    /// Read a collection extended attribute.
    GetEattr {
        /// Attribute key.
        key: Vec<u8>,
    },
    /// Write a collection extended attribute.
    SetEattr {
        /// Attribute key.
        key: Vec<u8>,
        /// Attribute value.
        value: Vec<u8>,
    },
}

impl TroveOp {
    /// Whether the operation mutates the collection. Mutating posts consult
    /// the degraded/read-only latches before entering the queue.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            TroveOp::DspaceCreate { .. }
                | TroveOp::DspaceRemove { .. }
                | TroveOp::KeyvalWrite { .. }
                | TroveOp::KeyvalRemove { .. }
                | TroveOp::BstreamWriteList { .. }
                | TroveOp::SetEattr { .. }
        )
    }

    /// Perform the blocking backing-store call. Runs on a queue worker.
    pub(crate) fn execute(&self, coll: &Collection) -> Result<OpOutput> {
        match self {
            TroveOp::DspaceCreate { hint, ds_type } => {
                coll.dspace_create(*hint, *ds_type).map(OpOutput::Handle)
            }
            TroveOp::DspaceRemove { handle } => {
                coll.dspace_remove(*handle).map(|()| OpOutput::Unit)
            }
            TroveOp::DspaceGetAttr { handle } => {
                coll.dspace_get_attr(*handle).map(OpOutput::Attr)
            }
            TroveOp::KeyvalRead { handle, key } => {
                coll.keyval_read(*handle, key).map(OpOutput::Value)
            }
            TroveOp::KeyvalWrite {
                handle,
                key,
                value,
                flags,
            } => coll
                .keyval_write(*handle, key, value, *flags)
                .map(|()| OpOutput::Unit),
            TroveOp::KeyvalRemove { handle, key, flags } => coll
                .keyval_remove(*handle, key, *flags)
                .map(|()| OpOutput::Unit),
            TroveOp::KeyvalIterate {
                handle,
                cursor,
                max_count,
            } => coll
                .keyval_iterate(*handle, cursor.clone(), *max_count)
                .map(|(entries, next)| OpOutput::Entries { entries, next }),
            TroveOp::BstreamReadList {
                handle,
                buf_len,
                mem,
                stream,
            } => coll
                .bstream_read_list(*handle, *buf_len, mem, stream)
                .map(|(data, transferred)| OpOutput::Read { data, transferred }),
            TroveOp::BstreamWriteList {
                handle,
                data,
                mem,
                stream,
                flags,
            } => coll
                .bstream_write_list(*handle, data, mem, stream, *flags)
                .map(OpOutput::Transferred),
            TroveOp::GetEattr { key } => coll
                .geteattr(key)?
                .map(OpOutput::Value)
                .ok_or(crate::error::EngineError::NoSuchKey),
            TroveOp::SetEattr { key, value } => {
                coll.seteattr(key, value).map(|()| OpOutput::Unit)
            }
        }
    }
}

/// Value carried by a Trove completion.
#[derive(Debug, Clone)]
pub enum OpOutput {
    /// Completion with no payload.
    Unit,
    /// A freshly created handle.
    Handle(Handle),
    /// Dataspace attributes.
    Attr(DsAttr),
    /// A keyval or extended-attribute value.
    Value(Vec<u8>),
    /// One iteration page and its resume cursor.
    Entries {
        /// Entries in key order.
        entries: Vec<KeyvalEntry>,
        /// Where the next iterate call should resume.
        next: KeyvalPosition,
    },
    /// A read buffer and the bytes transferred into it.
    Read {
        /// The filled buffer.
        data: Vec<u8>,
        /// Bytes transferred.
        transferred: u64,
    },
    /// Bytes transferred by a write.
    Transferred(u64),
}

/// The storage engine: collection registry plus the async op queue.
#[derive(Debug)]
pub struct Trove {
    registry: Arc<CollectionRegistry>,
    queue: queue::OpQueue,
}

impl Trove {
    /// Assemble the engine over an opened registry.
    pub fn new(
        registry: Arc<CollectionRegistry>,
        perf: Arc<PerfCounters>,
        config: &StorageConfig,
    ) -> Trove {
        Trove {
            registry,
            queue: queue::OpQueue::new(
                config.worker_threads,
                config.queue_depth,
                config.io_retries,
                perf,
            ),
        }
    }

    /// The registry this engine serves.
    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    /// Post an operation against a collection. Mutating operations fail
    /// fast when the collection has latched degraded or read-only.
    pub fn post(&self, fs_id: FsId, op: TroveOp) -> Result<OpId> {
        let coll = self.registry.get(fs_id)?;
        if op.is_mutating() {
            coll.check_writable()?;
        }
        Ok(self.queue.post(coll, op))
    }

    /// Non-blocking completion test; the first observation reaps the record.
    pub fn test(&self, id: OpId) -> Option<Result<OpOutput>> {
        self.queue.test(id)
    }

    /// Test a batch of op ids at once. Slot `i` corresponds to `ids[i]`;
    /// completions observed here are reaped like single tests.
    pub fn test_some(&self, ids: &[OpId]) -> Vec<Option<Result<OpOutput>>> {
        self.queue.test_some(ids)
    }

    /// Block until the operation completes.
    pub fn wait(&self, id: OpId) -> Result<OpOutput> {
        self.queue.wait(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleRange;
    use smallvec::smallvec;

    fn temp_trove() -> (tempfile::TempDir, Trove) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            CollectionRegistry::open(&dir.path().join("meta"), &dir.path().join("data")).unwrap(),
        );
        registry
            .create("fs", FsId(1), HandleRange::DEFAULT, None)
            .unwrap();
        let config = StorageConfig::with_roots(
            dir.path().join("data"),
            dir.path().join("meta"),
            dir.path().join("config"),
        );
        let perf = Arc::new(PerfCounters::new(4, std::time::Duration::from_secs(60)));
        let trove = Trove::new(registry, perf, &config);
        (dir, trove)
    }

    #[test]
    fn posted_ops_complete_and_reap_once() {
        let (_dir, trove) = temp_trove();
        let id = trove
            .post(
                FsId(1),
                TroveOp::DspaceCreate {
                    hint: Handle::NULL,
                    ds_type: DsType::Datafile,
                },
            )
            .unwrap();
        let handle = match trove.wait(id) {
            Ok(OpOutput::Handle(h)) => h,
            other => panic!("unexpected completion: {other:?}"),
        };
        // The record was reaped by wait; a later test sees nothing.
        assert!(trove.test(id).is_none());

        let id = trove.post(FsId(1), TroveOp::DspaceGetAttr { handle }).unwrap();
        match trove.wait(id).unwrap() {
            OpOutput::Attr(attr) => assert_eq!(attr.ds_type, DsType::Datafile),
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn unknown_collection_rejected_at_post() {
        let (_dir, trove) = temp_trove();
        assert_eq!(
            trove
                .post(FsId(99), TroveOp::DspaceGetAttr { handle: Handle(1) })
                .unwrap_err(),
            crate::error::EngineError::NoSuchCollection
        );
    }

    #[test]
    fn write_then_read_through_the_queue() {
        let (_dir, trove) = temp_trove();
        let id = trove
            .post(
                FsId(1),
                TroveOp::DspaceCreate {
                    hint: Handle::NULL,
                    ds_type: DsType::Datafile,
                },
            )
            .unwrap();
        let handle = match trove.wait(id).unwrap() {
            OpOutput::Handle(h) => h,
            other => panic!("unexpected completion: {other:?}"),
        };

        let payload = vec![0xabu8; 4096];
        let id = trove
            .post(
                FsId(1),
                TroveOp::BstreamWriteList {
                    handle,
                    data: payload.clone(),
                    mem: smallvec![MemRegion { offset: 0, len: 4096 }],
                    stream: smallvec![StreamRegion { offset: 0, len: 4096 }],
                    flags: BstreamFlags::empty(),
                },
            )
            .unwrap();
        match trove.wait(id).unwrap() {
            OpOutput::Transferred(n) => assert_eq!(n, 4096),
            other => panic!("unexpected completion: {other:?}"),
        }

        let id = trove
            .post(
                FsId(1),
                TroveOp::BstreamReadList {
                    handle,
                    buf_len: 4096,
                    mem: smallvec![MemRegion { offset: 0, len: 4096 }],
                    stream: smallvec![StreamRegion { offset: 0, len: 4096 }],
                },
            )
            .unwrap();
        match trove.wait(id).unwrap() {
            OpOutput::Read { data, transferred } => {
                assert_eq!(transferred, 4096);
                assert_eq!(data, payload);
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn batch_test_reaps_only_completed_ops() {
        let (_dir, trove) = temp_trove();
        let ids: Vec<OpId> = (0..8)
            .map(|_| {
                trove
                    .post(
                        FsId(1),
                        TroveOp::DspaceCreate {
                            hint: Handle::NULL,
                            ds_type: DsType::Internal,
                        },
                    )
                    .unwrap()
            })
            .collect();
        // Wait for the last one; the rest may or may not be done yet.
        trove.wait(ids[7]).unwrap();

        let mut seen = 0;
        while seen < 7 {
            for slot in trove.test_some(&ids[..7]) {
                if let Some(result) = slot {
                    result.unwrap();
                    seen += 1;
                }
            }
        }
        // Everything was reaped; nothing is reported twice.
        assert!(trove.test_some(&ids).iter().all(Option::is_none));
    }

    #[test]
    fn degraded_collection_rejects_mutations_at_post() {
        let (_dir, trove) = temp_trove();
        trove.registry().get(FsId(1)).unwrap().latch_degraded();
        assert_eq!(
            trove
                .post(
                    FsId(1),
                    TroveOp::SetEattr {
                        key: b"k".to_vec(),
                        value: b"v".to_vec(),
                    },
                )
                .unwrap_err(),
            crate::error::EngineError::Degraded
        );
        // Reads still pass the latch.
        assert!(trove
            .post(FsId(1), TroveOp::GetEattr { key: b"k".to_vec() })
            .is_ok());
    }
}
