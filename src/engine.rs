//! Engine assembly.
//!
//! All per-server state lives in one explicit [`Engine`] value built at
//! startup from a [`StorageConfig`]: the collection registry, the Trove op
//! queue, the request scheduler, the SID cache, the flow engine and the
//! performance counters. Nothing is process-global; tests construct a fresh
//! engine per case.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::StorageConfig;
use crate::error::{fatal_invariant, EngineError, Result};
use crate::flow::FlowEngine;
use crate::handle::{FsId, Handle, HandleRange};
use crate::perf::{PerfCounters, PerfSample};
use crate::sched::{AccessMode, SchedId, SchedStatus, Scheduler};
use crate::sid::SidCache;
use crate::trove::{
    CollectionRegistry, KeyvalPosition, OpId, OpOutput, Trove, TroveOp,
};

/// Root handle assigned to collections that do not request one.
pub const DEFAULT_ROOT_HANDLE: Handle = Handle(1 << 20);

/// Name of the SID snapshot file inside the config space.
const SID_SNAPSHOT_FILE: &str = "sid-cache.txt";

/// One directory entry as listed by [`Engine::list_directory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The entry's name.
    pub name: String,
    /// The referenced handle, when the stored value is a handle.
    pub handle: Option<Handle>,
}

/// A running server engine.
#[derive(Debug)]
pub struct Engine {
    config: StorageConfig,
    trove: Trove,
    scheduler: Scheduler,
    sid_cache: SidCache,
    flows: FlowEngine,
    perf: Arc<PerfCounters>,
    /// Scheduler tokens held on behalf of an in-flight Trove op, so that
    /// reaping the op with a token still held can force the release.
    op_tokens: Mutex<HashMap<u64, Vec<SchedId>>>,
}

impl Engine {
    /// Open the engine over existing (or empty) storage roots. Collections
    /// found in the meta space and a SID snapshot found in the config space
    /// are loaded.
    pub fn open(config: StorageConfig) -> Result<Engine> {
        fs::create_dir_all(&config.data_space)?;
        fs::create_dir_all(&config.meta_space)?;
        fs::create_dir_all(&config.config_space)?;

        // Internal errors out of the registry mean a corrupt meta space;
        // those crash instead of opening a broken engine.
        let registry = Arc::new(
            CollectionRegistry::open(&config.meta_space, &config.data_space)
                .map_err(EngineError::fatal_on_internal)?,
        );
        let perf = Arc::new(PerfCounters::new(
            config.perf_history,
            Duration::from_millis(config.perf_interval_ms),
        ));
        let trove = Trove::new(Arc::clone(&registry), Arc::clone(&perf), &config);
        let flows = FlowEngine::new(&config.flow, config.flow_protocol, Arc::clone(&registry));
        let sid_cache = SidCache::new();

        let snapshot = config.config_space.join(SID_SNAPSHOT_FILE);
        if snapshot.exists() {
            let file = fs::File::open(&snapshot)?;
            sid_cache.load(BufReader::new(file))?;
        }

        info!(
            "engine open: {} collections, encoding {:?}",
            registry.fs_ids().len(),
            config.encoding
        );
        Ok(Engine {
            config,
            trove,
            scheduler: Scheduler::new(),
            sid_cache,
            flows,
            perf,
            op_tokens: Mutex::new(HashMap::new()),
        })
    }

    /// The engine's configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The storage engine.
    pub fn trove(&self) -> &Trove {
        &self.trove
    }

    /// The request scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The SID cache.
    pub fn sid_cache(&self) -> &SidCache {
        &self.sid_cache
    }

    /// The flow engine.
    pub fn flows(&self) -> &FlowEngine {
        &self.flows
    }

    /// Poll the performance-counter ring.
    pub fn perf_snapshot(&self) -> Vec<PerfSample> {
        self.perf.snapshot()
    }

    /// Persist the SID cache into the config space, atomically replacing
    /// the previous snapshot.
    pub fn save_sid_snapshot(&self) -> Result<()> {
        let path = self.config.config_space.join(SID_SNAPSHOT_FILE);
        let tmp = self.config.config_space.join(format!("{SID_SNAPSHOT_FILE}.new"));
        let mut file = fs::File::create(&tmp)?;
        self.sid_cache.save(&mut file)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Acquire a scheduler token, blocking until it is ready or its
    /// deadline expires.
    pub fn acquire_token(
        &self,
        fs_id: FsId,
        handle: Handle,
        mode: AccessMode,
        deadline: Option<Duration>,
    ) -> Result<SchedId> {
        let id = self.scheduler.post(fs_id, handle, mode, deadline, 0);
        loop {
            match self.scheduler.test(id)? {
                SchedStatus::Ready => return Ok(id),
                SchedStatus::Waiting => std::thread::sleep(Duration::from_millis(1)),
                SchedStatus::TimedOut => return Err(EngineError::Timeout),
                SchedStatus::Cancelled => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Bind a scheduler token to a posted Trove op. The op's completion is
    /// expected to be followed by an explicit release; if its record is
    /// instead reaped (through [`Engine::test_op`] or [`Engine::wait_op`])
    /// with the token still held, the scheduler forcibly releases it so a
    /// buggy consumer cannot deadlock every later request on the handle.
    pub fn bind_token(&self, token: SchedId, op: OpId) {
        self.op_tokens.lock().entry(op.0).or_default().push(token);
    }

    /// Test a Trove completion through the engine. The first observation
    /// reaps the op record and recovers any token still bound to the op.
    pub fn test_op(&self, op: OpId) -> Option<Result<OpOutput>> {
        let result = self.trove.test(op)?;
        self.reap_bound_tokens(op);
        Some(result)
    }

    /// Block on a Trove completion through the engine, reaping the op
    /// record and recovering any token still bound to the op.
    pub fn wait_op(&self, op: OpId) -> Result<OpOutput> {
        let result = self.trove.wait(op);
        self.reap_bound_tokens(op);
        result
    }

    /// Forcibly release tokens whose owning op was reaped while they were
    /// still held, and drop bindings to tokens already released.
    fn reap_bound_tokens(&self, op: OpId) {
        let Some(tokens) = self.op_tokens.lock().remove(&op.0) else {
            return;
        };
        for token in tokens {
            match self.scheduler.test(token) {
                Ok(SchedStatus::Ready) => {
                    // force_release logs the recovery.
                    let _ = self.scheduler.force_release(token);
                }
                Ok(SchedStatus::Waiting) => {
                    warn!("cancelling {token}: still queued when {op} was reaped");
                    let _ = self.scheduler.cancel(token);
                }
                _ => {}
            }
        }
    }

    /// Resolve a `/`-separated path of directory entries starting at the
    /// collection's root handle.
    pub fn path_lookup(&self, fs_id: FsId, path: &str) -> Result<Handle> {
        let coll = self.trove.registry().get(fs_id)?;
        let mut current = coll.root_handle().map_err(EngineError::fatal_on_internal)?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let op = self.trove.post(
                fs_id,
                TroveOp::KeyvalRead {
                    handle: current,
                    key: component.as_bytes().to_vec(),
                },
            )?;
            current = match self.trove.wait(op)? {
                OpOutput::Value(bytes) => decode_handle(&bytes).ok_or_else(|| {
                    EngineError::InvalidArgument(format!(
                        "directory entry {component:?} does not hold a handle"
                    ))
                })?,
                other => fatal_invariant(&format!(
                    "unexpected completion for keyval read: {other:?}"
                )),
            };
        }
        Ok(current)
    }

    /// List a directory dataspace under a shared scheduler token.
    pub fn list_directory(&self, fs_id: FsId, dir: Handle) -> Result<Vec<DirEntry>> {
        let token = self.acquire_token(fs_id, dir, AccessMode::Shared, None)?;
        let result = self.list_directory_locked(fs_id, dir);
        self.scheduler.release(token)?;
        result
    }

    fn list_directory_locked(&self, fs_id: FsId, dir: Handle) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        let mut cursor = KeyvalPosition::Start;
        loop {
            let op = self.trove.post(
                fs_id,
                TroveOp::KeyvalIterate {
                    handle: dir,
                    cursor,
                    max_count: 64,
                },
            )?;
            let (entries, next) = match self.trove.wait(op)? {
                OpOutput::Entries { entries, next } => (entries, next),
                other => fatal_invariant(&format!(
                    "unexpected completion for keyval iterate: {other:?}"
                )),
            };
            for entry in entries {
                out.push(DirEntry {
                    name: String::from_utf8_lossy(&entry.key).into_owned(),
                    handle: decode_handle(&entry.value),
                });
            }
            match next {
                KeyvalPosition::End => return Ok(out),
                other => cursor = other,
            }
        }
    }

    /// Create the on-disk storage layout and its first collection, or add a
    /// collection to an existing layout when `add_coll` is set.
    pub fn mkspace(
        config: &StorageConfig,
        coll_name: &str,
        fs_id: FsId,
        root_handle: Option<Handle>,
        add_coll: bool,
    ) -> Result<()> {
        let populated = fs::read_dir(&config.meta_space)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if populated && !add_coll {
            return Err(EngineError::Exist);
        }
        if !populated && add_coll {
            return Err(EngineError::InvalidArgument(
                "no storage space to add a collection to".into(),
            ));
        }
        fs::create_dir_all(&config.data_space)?;
        fs::create_dir_all(&config.meta_space)?;
        fs::create_dir_all(&config.config_space)?;

        let registry = CollectionRegistry::open(&config.meta_space, &config.data_space)
            .map_err(EngineError::fatal_on_internal)?;
        registry.create(
            coll_name,
            fs_id,
            HandleRange::DEFAULT,
            Some(root_handle.unwrap_or(DEFAULT_ROOT_HANDLE)),
        )?;
        if !add_coll {
            config.save(&config.config_space.join("server.conf"))?;
        }
        info!("storage space ready, collection {coll_name} (fs_id {fs_id}) created");
        Ok(())
    }

    /// Remove one collection, or the whole storage layout.
    pub fn rmspace(
        config: &StorageConfig,
        coll_name: Option<&str>,
        delete_storage: bool,
    ) -> Result<()> {
        if let Some(name) = coll_name {
            let registry = CollectionRegistry::open(&config.meta_space, &config.data_space)
                .map_err(EngineError::fatal_on_internal)?;
            let fs_id = registry.lookup(name)?;
            registry.remove(fs_id, true)?;
        }
        if delete_storage {
            for root in [&config.data_space, &config.meta_space, &config.config_space] {
                remove_root(root)?;
            }
            info!("storage space deleted");
        }
        Ok(())
    }
}

fn remove_root(root: &PathBuf) -> Result<()> {
    match fs::remove_dir_all(root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Directory values are opaque bytes; a 16-byte value is read as a handle.
fn decode_handle(bytes: &[u8]) -> Option<Handle> {
    let raw: [u8; 16] = bytes.try_into().ok()?;
    Some(Handle::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::DsType;
    use crate::trove::KeyvalFlags;

    fn temp_config() -> (tempfile::TempDir, StorageConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::with_roots(
            dir.path().join("data"),
            dir.path().join("meta"),
            dir.path().join("config"),
        );
        (dir, config)
    }

    #[test]
    fn mkspace_then_open_finds_the_collection() {
        let (_dir, config) = temp_config();
        Engine::mkspace(&config, "fs-foo", FsId(9), None, false).unwrap();
        // A second mkspace without add_coll refuses to clobber the space.
        assert_eq!(
            Engine::mkspace(&config, "fs-bar", FsId(10), None, false).unwrap_err(),
            EngineError::Exist
        );
        Engine::mkspace(&config, "fs-bar", FsId(10), None, true).unwrap();

        let engine = Engine::open(config).unwrap();
        let registry = engine.trove().registry();
        assert_eq!(registry.lookup("fs-foo").unwrap(), FsId(9));
        assert_eq!(registry.lookup("fs-bar").unwrap(), FsId(10));
        let coll = registry.get(FsId(9)).unwrap();
        assert_eq!(coll.root_handle().unwrap(), DEFAULT_ROOT_HANDLE);
    }

    #[test]
    fn path_lookup_walks_directory_entries() {
        let (_dir, config) = temp_config();
        Engine::mkspace(&config, "fs", FsId(1), None, false).unwrap();
        let engine = Engine::open(config).unwrap();

        // Create /bar under the root.
        let op = engine
            .trove()
            .post(
                FsId(1),
                TroveOp::DspaceCreate {
                    hint: Handle::NULL,
                    ds_type: DsType::Directory,
                },
            )
            .unwrap();
        let bar = match engine.trove().wait(op).unwrap() {
            OpOutput::Handle(h) => h,
            other => panic!("unexpected completion: {other:?}"),
        };
        let op = engine
            .trove()
            .post(
                FsId(1),
                TroveOp::KeyvalWrite {
                    handle: DEFAULT_ROOT_HANDLE,
                    key: b"bar".to_vec(),
                    value: bar.to_be_bytes().to_vec(),
                    flags: KeyvalFlags::empty(),
                },
            )
            .unwrap();
        engine.trove().wait(op).unwrap();

        assert_eq!(engine.path_lookup(FsId(1), "/").unwrap(), DEFAULT_ROOT_HANDLE);
        assert_eq!(engine.path_lookup(FsId(1), "/bar").unwrap(), bar);
        assert_eq!(
            engine.path_lookup(FsId(1), "/missing").unwrap_err(),
            EngineError::NoSuchKey
        );

        let listing = engine.list_directory(FsId(1), DEFAULT_ROOT_HANDLE).unwrap();
        assert_eq!(
            listing,
            vec![DirEntry {
                name: "bar".into(),
                handle: Some(bar),
            }]
        );
    }

    #[test]
    fn sid_snapshot_persists_across_engines() {
        use crate::sid::{ServerRole, Sid, SidRecord};
        let (_dir, config) = temp_config();
        {
            let engine = Engine::open(config.clone()).unwrap();
            engine
                .sid_cache()
                .put(
                    Sid::from_u128(1),
                    SidRecord::new("tcp://a:1").with_type(ServerRole::Data, 9),
                    true,
                )
                .unwrap();
            engine.save_sid_snapshot().unwrap();
        }
        let engine = Engine::open(config).unwrap();
        assert_eq!(
            engine.sid_cache().lookup_by_type(ServerRole::Data, 9),
            vec![Sid::from_u128(1)]
        );
    }

    #[test]
    fn reaping_an_op_recovers_an_abandoned_token() {
        let (_dir, config) = temp_config();
        Engine::mkspace(&config, "fs", FsId(1), None, false).unwrap();
        let engine = Engine::open(config).unwrap();
        let handle = DEFAULT_ROOT_HANDLE;

        let token = engine
            .acquire_token(FsId(1), handle, AccessMode::Exclusive, None)
            .unwrap();
        let op = engine
            .trove()
            .post(FsId(1), TroveOp::DspaceGetAttr { handle })
            .unwrap();
        engine.bind_token(token, op);

        // A buggy consumer: reaps the completion, never calls release.
        engine.wait_op(op).unwrap();

        // The scheduler recovered the token; a fresh exclusive is admitted
        // instead of deadlocking behind the reaped holder.
        assert_eq!(engine.scheduler().holder_count(FsId(1), handle), 0);
        let next = engine
            .acquire_token(
                FsId(1),
                handle,
                AccessMode::Exclusive,
                Some(Duration::from_millis(100)),
            )
            .unwrap();
        engine.scheduler().release(next).unwrap();
    }

    #[test]
    fn reaping_leaves_properly_released_tokens_alone() {
        let (_dir, config) = temp_config();
        Engine::mkspace(&config, "fs", FsId(1), None, false).unwrap();
        let engine = Engine::open(config).unwrap();
        let handle = DEFAULT_ROOT_HANDLE;

        let token = engine
            .acquire_token(FsId(1), handle, AccessMode::Shared, None)
            .unwrap();
        let op = engine
            .trove()
            .post(FsId(1), TroveOp::DspaceGetAttr { handle })
            .unwrap();
        engine.bind_token(token, op);

        // The well-behaved order: release first, then reap.
        engine.scheduler().release(token).unwrap();
        engine.wait_op(op).unwrap();
        assert_eq!(engine.scheduler().holder_count(FsId(1), handle), 0);
    }

    #[test]
    fn rmspace_deletes_collection_then_storage() {
        let (_dir, config) = temp_config();
        Engine::mkspace(&config, "fs", FsId(1), None, false).unwrap();
        Engine::rmspace(&config, Some("fs"), false).unwrap();
        {
            let registry =
                CollectionRegistry::open(&config.meta_space, &config.data_space).unwrap();
            assert!(registry.lookup("fs").is_err());
        }
        Engine::rmspace(&config, None, true).unwrap();
        assert!(!config.meta_space.exists());
    }
}
