//! The flow engine.
//!
//! Moves bulk bytes between a network stream and a Trove bstream through a
//! fixed pool of buffers, so the memory footprint of the bulk path is
//! `buffer_count * buffer_size` regardless of transfer size or concurrency.
//! Each flow runs a producer stage filling buffers from the source and a
//! consumer stage draining them into the sink; several buffers are in flight
//! at once to overlap the two. Buffers carry sequence numbers and the
//! consumer applies them in order, so the accumulated progress count is
//! always the largest contiguous prefix that succeeded at both ends.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::config::{FlowConfig, FlowProtocol};
use crate::error::{fatal_invariant, EngineError, Result};
use crate::handle::{FsId, Handle};
use crate::trove::{CollectionRegistry, StreamRegion};

/// Fixed pool of transfer buffers shared by every flow of one engine.
pub struct BufferPool {
    buffer_size: usize,
    total: usize,
    free: Mutex<Vec<Vec<u8>>>,
    released: Condvar,
}

impl BufferPool {
    /// Allocate `count` buffers of `size` bytes up front.
    pub fn new(count: usize, size: usize) -> BufferPool {
        let count = count.max(1);
        let size = size.max(1);
        BufferPool {
            buffer_size: size,
            total: count,
            free: Mutex::new((0..count).map(|_| vec![0u8; size]).collect()),
            released: Condvar::new(),
        }
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of buffers owned by the pool.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Take a buffer, blocking until one is free.
    fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock();
        loop {
            if let Some(buf) = free.pop() {
                return buf;
            }
            self.released.wait(&mut free);
        }
    }

    fn release(&self, buf: Vec<u8>) {
        let mut free = self.free.lock();
        free.push(buf);
        self.released.notify_one();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("total", &self.total)
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

/// Where a flow draws its bytes from.
pub enum FlowSource {
    /// A byte stream, typically a network receive path.
    Stream(Box<dyn Read + Send>),
    /// Regions of a dataspace's bstream.
    Bstream {
        /// Collection holding the dataspace.
        fs_id: FsId,
        /// The dataspace.
        handle: Handle,
        /// Regions to read, walked in order.
        regions: Vec<StreamRegion>,
    },
}

/// Where a flow delivers its bytes.
pub enum FlowSink {
    /// A byte stream, typically a network send path.
    Stream(Box<dyn Write + Send>),
    /// Regions of a dataspace's bstream.
    Bstream {
        /// Collection holding the dataspace.
        fs_id: FsId,
        /// The dataspace.
        handle: Handle,
        /// Regions to write, walked in order.
        regions: Vec<StreamRegion>,
    },
}

impl std::fmt::Debug for FlowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowSource::Stream(_) => f.write_str("FlowSource::Stream"),
            FlowSource::Bstream { fs_id, handle, regions } => f
                .debug_struct("FlowSource::Bstream")
                .field("fs_id", fs_id)
                .field("handle", handle)
                .field("regions", &regions.len())
                .finish(),
        }
    }
}

impl std::fmt::Debug for FlowSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowSink::Stream(_) => f.write_str("FlowSink::Stream"),
            FlowSink::Bstream { fs_id, handle, regions } => f
                .debug_struct("FlowSink::Bstream")
                .field("fs_id", fs_id)
                .field("handle", handle)
                .field("regions", &regions.len())
                .finish(),
        }
    }
}

/// Outcome of a finished flow.
#[derive(Debug)]
pub struct FlowResult {
    /// Largest contiguous prefix delivered at both ends.
    pub bytes_transferred: u64,
    /// `Ok` only when the full requested total was delivered.
    pub outcome: Result<()>,
}

/// A posted flow. Dropping the handle without waiting cancels nothing; the
/// flow keeps running until it finishes on its own.
#[derive(Debug)]
pub struct FlowHandle {
    cancel: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    producer: JoinHandle<Result<()>>,
    consumer: JoinHandle<Result<()>>,
}

impl FlowHandle {
    /// Mark the flow cancelled. In-flight stages drain; no new stages are
    /// posted. The flow then terminates with `Cancelled` and the
    /// accumulated prefix count.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Bytes delivered to the sink so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Block until the flow terminates.
    pub fn wait(self) -> FlowResult {
        let produced = self.producer.join();
        let consumed = self.consumer.join();
        let bytes_transferred = self.progress.load(Ordering::SeqCst);
        let outcome = match (produced, consumed) {
            // An Internal failure (a stage observed out of sequence) is an
            // invariant violation and crashes rather than completing.
            (Ok(p), Ok(c)) => c.and(p).map_err(EngineError::fatal_on_internal),
            _ => fatal_invariant("flow stage thread panicked"),
        };
        FlowResult {
            bytes_transferred,
            outcome,
        }
    }
}

enum StageMsg {
    Chunk { seq: u64, buf: Vec<u8>, len: usize },
    Failed(EngineError),
}

/// Posts and drives flows for one engine.
pub struct FlowEngine {
    pool: Arc<BufferPool>,
    registry: Arc<CollectionRegistry>,
    protocol: FlowProtocol,
}

impl FlowEngine {
    /// Build the engine with its fixed buffer pool.
    pub fn new(
        config: &FlowConfig,
        protocol: FlowProtocol,
        registry: Arc<CollectionRegistry>,
    ) -> FlowEngine {
        debug!(
            "flow engine: {} buffers of {} bytes, protocol {protocol:?}",
            config.buffer_count, config.buffer_size
        );
        FlowEngine {
            pool: Arc::new(BufferPool::new(config.buffer_count, config.buffer_size)),
            registry,
            protocol,
        }
    }

    /// The engine's buffer pool, exposed for accounting and tests.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Post a flow moving exactly `total` bytes from `source` to `sink`.
    /// Bstream endpoints must describe exactly `total` bytes.
    pub fn post(&self, source: FlowSource, sink: FlowSink, total: u64) -> Result<FlowHandle> {
        check_regions(&source, &sink, total)?;
        if self.protocol == FlowProtocol::DumpOffsets {
            return self.post_dump_offsets(source, sink, total);
        }

        let reader = self.open_source(source)?;
        let writer = self.open_sink(sink)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicU64::new(0));
        let (tx, rx) = crossbeam_channel::unbounded::<StageMsg>();

        let producer = {
            let pool = Arc::clone(&self.pool);
            let cancel = Arc::clone(&cancel);
            std::thread::Builder::new()
                .name("flow-producer".into())
                .spawn(move || produce(reader, pool, tx, total, cancel))
                .expect("failed to spawn flow producer")
        };
        let consumer = {
            let pool = Arc::clone(&self.pool);
            let cancel = Arc::clone(&cancel);
            let progress = Arc::clone(&progress);
            std::thread::Builder::new()
                .name("flow-consumer".into())
                .spawn(move || consume(writer, pool, rx, cancel, progress))
                .expect("failed to spawn flow consumer")
        };

        Ok(FlowHandle {
            cancel,
            progress,
            producer,
            consumer,
        })
    }

    /// The diagnostic protocol: log the stage offsets a real transfer would
    /// use and complete without moving data.
    fn post_dump_offsets(
        &self,
        source: FlowSource,
        sink: FlowSink,
        total: u64,
    ) -> Result<FlowHandle> {
        let chunk = self.pool.buffer_size() as u64;
        for endpoint in [endpoint_regions(&source), endpoint_regions(&sink)] {
            if let Some(regions) = endpoint {
                let mut cursor = RegionCursor::new(regions.clone());
                let mut seq = 0u64;
                while let Some(r) = cursor.next_chunk(chunk) {
                    debug!("flow stage {seq}: offset {} len {}", r.offset, r.len);
                    seq += 1;
                }
            }
        }
        let progress = Arc::new(AtomicU64::new(total));
        let cancel = Arc::new(AtomicBool::new(false));
        let producer = std::thread::spawn(|| Ok(()));
        let consumer = std::thread::spawn(|| Ok(()));
        Ok(FlowHandle {
            cancel,
            progress,
            producer,
            consumer,
        })
    }

    fn open_source(&self, source: FlowSource) -> Result<ChunkReader> {
        match source {
            FlowSource::Stream(reader) => Ok(ChunkReader::Stream(reader)),
            FlowSource::Bstream { fs_id, handle, regions } => {
                let coll = self.registry.get(fs_id)?;
                let file = coll
                    .open_bstream_ro(handle)
                    .map_err(EngineError::fatal_on_internal)?;
                Ok(ChunkReader::Bstream {
                    file,
                    cursor: RegionCursor::new(regions),
                })
            }
        }
    }

    fn open_sink(&self, sink: FlowSink) -> Result<ChunkWriter> {
        match sink {
            FlowSink::Stream(writer) => Ok(ChunkWriter::Stream(writer)),
            FlowSink::Bstream { fs_id, handle, regions } => {
                let coll = self.registry.get(fs_id)?;
                coll.check_writable()?;
                let file = coll
                    .open_bstream_rw(handle)
                    .map_err(EngineError::fatal_on_internal)?;
                Ok(ChunkWriter::Bstream {
                    file,
                    cursor: RegionCursor::new(regions),
                })
            }
        }
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("protocol", &self.protocol)
            .field("pool", &self.pool)
            .finish()
    }
}

fn check_regions(source: &FlowSource, sink: &FlowSink, total: u64) -> Result<()> {
    for regions in [endpoint_regions(source), endpoint_regions(sink)]
        .into_iter()
        .flatten()
    {
        let described: u64 = regions.iter().map(|r| r.len).sum();
        if described != total {
            return Err(EngineError::InvalidArgument(format!(
                "endpoint describes {described} bytes, flow total is {total}"
            )));
        }
    }
    Ok(())
}

fn endpoint_regions<'a>(endpoint: impl Into<EndpointRef<'a>>) -> Option<&'a Vec<StreamRegion>> {
    match endpoint.into() {
        EndpointRef::Source(FlowSource::Bstream { regions, .. }) => Some(regions),
        EndpointRef::Sink(FlowSink::Bstream { regions, .. }) => Some(regions),
        _ => None,
    }
}

enum EndpointRef<'a> {
    Source(&'a FlowSource),
    Sink(&'a FlowSink),
}

impl<'a> From<&'a FlowSource> for EndpointRef<'a> {
    fn from(s: &'a FlowSource) -> Self {
        EndpointRef::Source(s)
    }
}

impl<'a> From<&'a FlowSink> for EndpointRef<'a> {
    fn from(s: &'a FlowSink) -> Self {
        EndpointRef::Sink(s)
    }
}

/// Walks an ordered region list in caller-sized chunks.
struct RegionCursor {
    regions: Vec<StreamRegion>,
    idx: usize,
    used: u64,
}

impl RegionCursor {
    fn new(regions: Vec<StreamRegion>) -> RegionCursor {
        RegionCursor {
            regions,
            idx: 0,
            used: 0,
        }
    }

    fn next_chunk(&mut self, max: u64) -> Option<StreamRegion> {
        while self.idx < self.regions.len() && self.regions[self.idx].len == self.used {
            self.idx += 1;
            self.used = 0;
        }
        if self.idx >= self.regions.len() || max == 0 {
            return None;
        }
        let region = self.regions[self.idx];
        let len = (region.len - self.used).min(max);
        let chunk = StreamRegion {
            offset: region.offset + self.used,
            len,
        };
        self.used += len;
        Some(chunk)
    }
}

enum ChunkReader {
    Stream(Box<dyn Read + Send>),
    Bstream {
        file: Option<File>,
        cursor: RegionCursor,
    },
}

impl ChunkReader {
    /// Fill up to `want` bytes of `buf`. Returns the bytes produced; fewer
    /// than `want` only at end of stream.
    fn fill(&mut self, buf: &mut [u8], want: usize) -> Result<usize> {
        match self {
            ChunkReader::Stream(reader) => {
                let mut got = 0usize;
                while got < want {
                    let n = reader.read(&mut buf[got..want])?;
                    if n == 0 {
                        break;
                    }
                    got += n;
                }
                Ok(got)
            }
            ChunkReader::Bstream { file, cursor } => {
                let mut got = 0usize;
                while got < want {
                    let Some(region) = cursor.next_chunk((want - got) as u64) else {
                        break;
                    };
                    let dst = &mut buf[got..got + region.len as usize];
                    let mut filled = 0usize;
                    if let Some(file) = file {
                        while filled < dst.len() {
                            let n =
                                file.read_at(&mut dst[filled..], region.offset + filled as u64)?;
                            if n == 0 {
                                break;
                            }
                            filled += n;
                        }
                    }
                    dst[filled..].fill(0);
                    got += region.len as usize;
                }
                Ok(got)
            }
        }
    }
}

enum ChunkWriter {
    Stream(Box<dyn Write + Send>),
    Bstream { file: File, cursor: RegionCursor },
}

impl ChunkWriter {
    fn drain(&mut self, data: &[u8]) -> Result<()> {
        match self {
            ChunkWriter::Stream(writer) => {
                writer.write_all(data)?;
                Ok(())
            }
            ChunkWriter::Bstream { file, cursor } => {
                let mut done = 0usize;
                while done < data.len() {
                    let region = cursor.next_chunk((data.len() - done) as u64).ok_or_else(|| {
                        EngineError::InvalidArgument(
                            "sink regions exhausted before the flow total".into(),
                        )
                    })?;
                    file.write_all_at(&data[done..done + region.len as usize], region.offset)?;
                    done += region.len as usize;
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        if let ChunkWriter::Stream(writer) = self {
            writer.flush()?;
        }
        Ok(())
    }
}

fn produce(
    mut reader: ChunkReader,
    pool: Arc<BufferPool>,
    tx: Sender<StageMsg>,
    total: u64,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let mut remaining = total;
    let mut seq = 0u64;
    while remaining > 0 {
        if cancel.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        let mut buf = pool.acquire();
        let want = (buf.len() as u64).min(remaining) as usize;
        match reader.fill(&mut buf, want) {
            Ok(got) => {
                if got == 0 {
                    pool.release(buf);
                    let err = EngineError::Io(format!(
                        "flow source ended {remaining} bytes before the requested total"
                    ));
                    let _ = tx.send(StageMsg::Failed(err.clone()));
                    return Err(err);
                }
                remaining -= got as u64;
                if let Err(unsent) = tx.send(StageMsg::Chunk { seq, buf, len: got }) {
                    // Consumer went away; reclaim the undelivered buffer.
                    if let StageMsg::Chunk { buf, .. } = unsent.0 {
                        pool.release(buf);
                    }
                    return Err(EngineError::Cancelled);
                }
                seq += 1;
            }
            Err(err) => {
                pool.release(buf);
                let _ = tx.send(StageMsg::Failed(err.clone()));
                return Err(err);
            }
        }
    }
    Ok(())
}

fn consume(
    mut writer: ChunkWriter,
    pool: Arc<BufferPool>,
    rx: Receiver<StageMsg>,
    cancel: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
) -> Result<()> {
    let mut expected_seq = 0u64;
    let mut failure: Option<EngineError> = None;
    for msg in rx.iter() {
        match msg {
            StageMsg::Chunk { seq, buf, len } => {
                if failure.is_some() || cancel.load(Ordering::SeqCst) {
                    // Draining: release without writing.
                    pool.release(buf);
                    if failure.is_none() {
                        failure = Some(EngineError::Cancelled);
                    }
                    continue;
                }
                if seq != expected_seq {
                    pool.release(buf);
                    failure = Some(EngineError::Internal(format!(
                        "flow stage out of order: got {seq}, expected {expected_seq}"
                    )));
                    continue;
                }
                expected_seq += 1;
                match writer.drain(&buf[..len]) {
                    Ok(()) => {
                        progress.fetch_add(len as u64, Ordering::SeqCst);
                        pool.release(buf);
                    }
                    Err(err) => {
                        pool.release(buf);
                        failure = Some(err);
                    }
                }
            }
            StageMsg::Failed(err) => {
                if failure.is_none() {
                    failure = Some(err);
                }
            }
        }
    }
    match failure {
        Some(err) => Err(err),
        None => {
            writer.finish()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn engine_with(pool_count: usize, pool_size: usize) -> (tempfile::TempDir, FlowEngine) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            CollectionRegistry::open(&dir.path().join("meta"), &dir.path().join("data")).unwrap(),
        );
        let config = FlowConfig {
            buffer_count: pool_count,
            buffer_size: pool_size,
        };
        let engine = FlowEngine::new(&config, FlowProtocol::MultiQueue, registry);
        (dir, engine)
    }

    /// A sink that counts bytes and can throttle to force backpressure.
    struct CountingSink {
        count: Arc<AtomicU64>,
        throttle: Option<std::time::Duration>,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(delay) = self.throttle {
                std::thread::sleep(delay);
            }
            self.count.fetch_add(buf.len() as u64, Ordering::SeqCst);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stream_to_stream_moves_every_byte() {
        let (_dir, engine) = engine_with(4, 64 * 1024);
        let total = 1024 * 1024u64;
        let data = vec![0x5au8; total as usize];
        let count = Arc::new(AtomicU64::new(0));
        let sink = CountingSink {
            count: Arc::clone(&count),
            throttle: None,
        };
        let handle = engine
            .post(
                FlowSource::Stream(Box::new(Cursor::new(data))),
                FlowSink::Stream(Box::new(sink)),
                total,
            )
            .unwrap();
        let result = handle.wait();
        assert!(result.outcome.is_ok());
        assert_eq!(result.bytes_transferred, total);
        assert_eq!(count.load(Ordering::SeqCst), total);
        assert_eq!(engine.pool().available(), engine.pool().total());
    }

    #[test]
    fn bounded_buffers_limit_resident_memory() {
        // S5 at reduced scale: 2 buffers of 64 KiB moving 4 MiB. Resident
        // transfer memory is capped by the pool; the pool is never grown.
        let (_dir, engine) = engine_with(2, 64 * 1024);
        let total = 4 * 1024 * 1024u64;
        let data = vec![1u8; total as usize];
        let count = Arc::new(AtomicU64::new(0));
        let sink = CountingSink {
            count: Arc::clone(&count),
            throttle: Some(std::time::Duration::from_micros(100)),
        };
        let handle = engine
            .post(
                FlowSource::Stream(Box::new(Cursor::new(data))),
                FlowSink::Stream(Box::new(sink)),
                total,
            )
            .unwrap();
        // While the flow runs, the pool can never report more buffers than
        // it owns, and the producer stalls once both are in flight.
        for _ in 0..50 {
            assert!(engine.pool().available() <= 2);
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
        let result = handle.wait();
        assert!(result.outcome.is_ok());
        assert_eq!(result.bytes_transferred, total);
        assert_eq!(engine.pool().available(), 2);
    }

    #[test]
    fn truncated_source_reports_prefix() {
        let (_dir, engine) = engine_with(2, 1024);
        // Source holds 3000 bytes but the flow asks for 5000.
        let data = vec![7u8; 3000];
        let count = Arc::new(AtomicU64::new(0));
        let sink = CountingSink {
            count: Arc::clone(&count),
            throttle: None,
        };
        let handle = engine
            .post(
                FlowSource::Stream(Box::new(Cursor::new(data))),
                FlowSink::Stream(Box::new(sink)),
                5000,
            )
            .unwrap();
        let result = handle.wait();
        assert!(result.outcome.is_err());
        assert_eq!(result.bytes_transferred, 3000);
        assert_eq!(engine.pool().available(), 2);
    }

    #[test]
    fn cancellation_drains_and_reports_cancelled() {
        let (_dir, engine) = engine_with(2, 4 * 1024);
        let total = 16 * 1024 * 1024u64;
        let data = vec![9u8; total as usize];
        let count = Arc::new(AtomicU64::new(0));
        let sink = CountingSink {
            count: Arc::clone(&count),
            throttle: Some(std::time::Duration::from_millis(1)),
        };
        let handle = engine
            .post(
                FlowSource::Stream(Box::new(Cursor::new(data))),
                FlowSink::Stream(Box::new(sink)),
                total,
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        handle.cancel();
        let result = handle.wait();
        assert_eq!(result.outcome.unwrap_err(), EngineError::Cancelled);
        assert!(result.bytes_transferred < total);
        // Every buffer came home.
        assert_eq!(engine.pool().available(), 2);
    }

    #[test]
    fn region_cursor_walks_chunks() {
        let mut cursor = RegionCursor::new(vec![
            StreamRegion { offset: 0, len: 5 },
            StreamRegion { offset: 100, len: 3 },
        ]);
        assert_eq!(
            cursor.next_chunk(4),
            Some(StreamRegion { offset: 0, len: 4 })
        );
        assert_eq!(
            cursor.next_chunk(4),
            Some(StreamRegion { offset: 4, len: 1 })
        );
        assert_eq!(
            cursor.next_chunk(4),
            Some(StreamRegion { offset: 100, len: 3 })
        );
        assert_eq!(cursor.next_chunk(4), None);
    }

    #[test]
    fn mismatched_endpoint_totals_rejected() {
        let (_dir, engine) = engine_with(2, 1024);
        let err = engine
            .post(
                FlowSource::Stream(Box::new(Cursor::new(vec![0u8; 10]))),
                FlowSink::Bstream {
                    fs_id: FsId(1),
                    handle: Handle(5),
                    regions: vec![StreamRegion { offset: 0, len: 4 }],
                },
                10,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
