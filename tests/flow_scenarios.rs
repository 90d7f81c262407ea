//! Flow-engine scenarios: backpressure, totals and bstream endpoints.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use stripefs::{
    DsType, Engine, FlowSink, FlowSource, FsId, Handle, OpOutput, StorageConfig, StreamRegion,
    TroveOp,
};

fn engine_with_flow(fs_id: FsId, buffer_count: usize, buffer_size: usize) -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StorageConfig::with_roots(
        dir.path().join("data"),
        dir.path().join("meta"),
        dir.path().join("config"),
    );
    config.flow.buffer_count = buffer_count;
    config.flow.buffer_size = buffer_size;
    Engine::mkspace(&config, "fs-flow", fs_id, None, false).unwrap();
    let engine = Engine::open(config).unwrap();
    (dir, engine)
}

fn create_datafile(engine: &Engine, fs: FsId) -> Handle {
    let op = engine
        .trove()
        .post(
            fs,
            TroveOp::DspaceCreate {
                hint: Handle::NULL,
                ds_type: DsType::Datafile,
            },
        )
        .unwrap();
    match engine.trove().wait(op).unwrap() {
        OpOutput::Handle(h) => h,
        other => panic!("unexpected completion: {other:?}"),
    }
}

struct CountingSink(Arc<AtomicU64>);

impl std::io::Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.fetch_add(buf.len() as u64, Ordering::SeqCst);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn sixty_four_mib_through_two_one_mib_buffers() {
    // S5: buffer_count=2, buffer_size=1 MiB, 64 MiB moved. The transfer
    // path owns exactly 2 MiB of buffers and the final count is 64 MiB.
    const MIB: usize = 1024 * 1024;
    let fs = FsId(2);
    let (_dir, engine) = engine_with_flow(fs, 2, MIB);
    let total = 64 * MIB as u64;

    let data = vec![0xc3u8; total as usize];
    let delivered = Arc::new(AtomicU64::new(0));
    let handle = engine
        .flows()
        .post(
            FlowSource::Stream(Box::new(Cursor::new(data))),
            FlowSink::Stream(Box::new(CountingSink(Arc::clone(&delivered)))),
            total,
        )
        .unwrap();

    // The pool never grows beyond its two 1 MiB buffers while the flow is
    // in flight.
    let pool = Arc::clone(engine.flows().pool());
    assert_eq!(pool.total(), 2);
    assert_eq!(pool.buffer_size(), MIB);
    for _ in 0..20 {
        assert!(pool.available() <= 2);
        std::thread::sleep(std::time::Duration::from_micros(500));
    }

    let result = handle.wait();
    assert!(result.outcome.is_ok());
    assert_eq!(result.bytes_transferred, total);
    assert_eq!(delivered.load(Ordering::SeqCst), total);
    assert_eq!(pool.available(), 2);
}

#[test]
fn stream_to_bstream_and_back() {
    let fs = FsId(2);
    let (_dir, engine) = engine_with_flow(fs, 4, 64 * 1024);
    let handle = create_datafile(&engine, fs);

    let total = 3 * 1024 * 1024u64 + 17;
    let payload: Vec<u8> = (0..total).map(|i| (i * 7) as u8).collect();

    // Network receive into the bstream.
    let inbound = engine
        .flows()
        .post(
            FlowSource::Stream(Box::new(Cursor::new(payload.clone()))),
            FlowSink::Bstream {
                fs_id: fs,
                handle,
                regions: vec![StreamRegion {
                    offset: 0,
                    len: total,
                }],
            },
            total,
        )
        .unwrap();
    let result = inbound.wait();
    assert!(result.outcome.is_ok());
    assert_eq!(result.bytes_transferred, total);

    // And back out to a network send.
    let sink_data = Arc::new(support::Collector::default());
    let outbound = engine
        .flows()
        .post(
            FlowSource::Bstream {
                fs_id: fs,
                handle,
                regions: vec![StreamRegion {
                    offset: 0,
                    len: total,
                }],
            },
            FlowSink::Stream(Box::new(support::CollectorWriter(Arc::clone(&sink_data)))),
            total,
        )
        .unwrap();
    let result = outbound.wait();
    assert!(result.outcome.is_ok());
    assert_eq!(result.bytes_transferred, total);
    assert_eq!(*sink_data.bytes.lock().unwrap(), payload);
}

/// Small helpers for collecting flow output in order.
mod support {
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct Collector {
        pub bytes: Mutex<Vec<u8>>,
    }

    pub struct CollectorWriter(pub Arc<Collector>);

    impl std::io::Write for CollectorWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.bytes.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}

#[test]
fn scattered_sink_regions_reassemble_in_order() {
    let fs = FsId(2);
    let (_dir, engine) = engine_with_flow(fs, 2, 1024);
    let handle = create_datafile(&engine, fs);

    // 8 KiB split across two disjoint bstream regions.
    let total = 8 * 1024u64;
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let regions = vec![
        StreamRegion {
            offset: 1 << 20,
            len: 4096,
        },
        StreamRegion {
            offset: 0,
            len: 4096,
        },
    ];
    let inbound = engine
        .flows()
        .post(
            FlowSource::Stream(Box::new(Cursor::new(payload.clone()))),
            FlowSink::Bstream {
                fs_id: fs,
                handle,
                regions: regions.clone(),
            },
            total,
        )
        .unwrap();
    assert!(inbound.wait().outcome.is_ok());

    // Reading the same region list returns the original byte order.
    let collected = Arc::new(support::Collector::default());
    let outbound = engine
        .flows()
        .post(
            FlowSource::Bstream {
                fs_id: fs,
                handle,
                regions,
            },
            FlowSink::Stream(Box::new(support::CollectorWriter(Arc::clone(&collected)))),
            total,
        )
        .unwrap();
    assert!(outbound.wait().outcome.is_ok());
    assert_eq!(*collected.bytes.lock().unwrap(), payload);
}
