//! Server core of a parallel, distributed object-storage filesystem.
//!
//! A cluster of these servers cooperatively hosts a single logical
//! filesystem whose data and metadata are striped across many server
//! processes. This crate implements the per-server substrate the cluster is
//! built on: the Trove storage engine (dataspaces, keyval maps and bstreams
//! organized into collections), the request scheduler that serializes
//! concurrent access to handles, the SID cache through which servers locate
//! each other, and the flow engine that pipelines bulk bytes with a bounded
//! memory footprint.
//!
//! Everything is assembled into an explicit [`Engine`] value at startup;
//! there is no process-global state.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::allocator::HandleAllocator;
pub use crate::config::{FlowConfig, FlowProtocol, StorageConfig, WireEncoding};
pub use crate::engine::{DirEntry, Engine, DEFAULT_ROOT_HANDLE};
pub use crate::error::{EngineError, Result};
pub use crate::flow::{BufferPool, FlowEngine, FlowHandle, FlowResult, FlowSink, FlowSource};
pub use crate::handle::{DsType, FsId, Handle, HandleRange};
pub use crate::perf::{PerfCounters, PerfSample};
pub use crate::sched::{AccessMode, SchedId, SchedStatus, Scheduler};
pub use crate::sid::{
    ServerRole, Sid, SidCache, SidRecord, SidTypeBinding, SID_ATTR_COUNT, SID_ATTR_NAMES,
};
pub use crate::trove::{
    BstreamFlags, Collection, CollectionRegistry, DsAttr, KeyvalEntry, KeyvalFlags,
    KeyvalPosition, MemRegion, MemRegions, OpId, OpOutput, StreamRegion, StreamRegions, Trove,
    TroveOp, ROOT_HANDLE_KEY,
};

mod allocator;
mod config;
mod engine;
mod error;
mod flow;
mod handle;
mod perf;
mod sched;
pub mod sid;
pub mod trove;
