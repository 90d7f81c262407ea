//! Collections and the per-server collection registry.
//!
//! A collection is one hosted filesystem: a handle allocator, a keyval
//! store under the meta space and a directory of bstream files under the
//! data space. The registry tracks every collection on this server, refuses
//! fs_id collisions and carries the per-collection fault latches.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::allocator::HandleAllocator;
use crate::error::{EngineError, Result};
use crate::handle::{DsType, FsId, Handle, HandleRange};
use crate::trove::bstream;
use crate::trove::dspace::{DsAttr, DsAttrRecord};
use crate::trove::keyval::{self, KeyvalStore};
use crate::trove::{BstreamFlags, KeyvalEntry, KeyvalFlags, KeyvalPosition};

/// Extended-attribute key under which a collection stores its root handle.
pub const ROOT_HANDLE_KEY: &[u8] = b"root_handle";

/// Extended-attribute key under which a collection stores its name.
const NAME_KEY: &[u8] = b"name";

/// One hosted filesystem on this server.
pub struct Collection {
    fs_id: FsId,
    name: String,
    data_dir: PathBuf,
    store: Mutex<KeyvalStore>,
    allocator: Mutex<HandleAllocator>,
    degraded: AtomicBool,
    read_only: AtomicBool,
}

impl Collection {
    /// Create a new collection on disk.
    fn create(
        fs_id: FsId,
        name: &str,
        range: HandleRange,
        meta_dir: &Path,
        data_dir: &Path,
    ) -> Result<Collection> {
        fs::create_dir_all(data_dir)?;
        let mut store = KeyvalStore::open(&meta_dir.join("keyval.log"))?;
        store.put(&keyval::eattr_key(NAME_KEY), name.as_bytes(), true, true)?;
        Ok(Collection {
            fs_id,
            name: name.to_owned(),
            data_dir: data_dir.to_owned(),
            store: Mutex::new(store),
            allocator: Mutex::new(HandleAllocator::new(range)),
            degraded: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        })
    }

    /// Open an existing collection, recovering the live-handle set from the
    /// dataspace attribute records in the keyval store.
    fn open(fs_id: FsId, range: HandleRange, meta_dir: &Path, data_dir: &Path) -> Result<Collection> {
        let store = KeyvalStore::open(&meta_dir.join("keyval.log"))?;
        let name = match store.get(&keyval::eattr_key(NAME_KEY))? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|_| EngineError::Internal("collection name is not UTF-8".into()))?,
            None => return Err(EngineError::Internal("collection has no name record".into())),
        };
        let mut allocator = HandleAllocator::new(range);
        allocator.recover(attr_handles(&store));
        info!(
            "collection {name} (fs_id {fs_id}) opened with {} dataspaces",
            allocator.live_count()
        );
        Ok(Collection {
            fs_id,
            name,
            data_dir: data_dir.to_owned(),
            store: Mutex::new(store),
            allocator: Mutex::new(allocator),
            degraded: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        })
    }

    /// The collection's fs_id.
    pub fn fs_id(&self) -> FsId {
        self.fs_id
    }

    /// The collection's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latch the collection degraded. All subsequent mutating posts fail
    /// fast until the server is restarted.
    pub fn latch_degraded(&self) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                "collection {} (fs_id {}) latched degraded",
                self.name, self.fs_id
            );
        }
    }

    /// Whether the degraded latch is set.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Mark the collection read-only.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Fail fast if the collection cannot accept a mutating operation.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.degraded.load(Ordering::SeqCst) {
            return Err(EngineError::Degraded);
        }
        if self.read_only.load(Ordering::SeqCst) {
            return Err(EngineError::ReadOnly);
        }
        Ok(())
    }

    /// The root handle, if one has been configured.
    pub fn root_handle(&self) -> Result<Handle> {
        let bytes = self
            .geteattr(ROOT_HANDLE_KEY)?
            .ok_or(EngineError::NoSuchKey)?;
        let raw: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| EngineError::Internal("malformed root handle eattr".into()))?;
        Ok(Handle::from_be_bytes(raw))
    }

    // --- dataspace operations, run by queue workers ---

    /// Create a dataspace. A non-null `hint` requests that exact handle and
    /// fails with `Exist` when it is live. The attribute record is durable
    /// when this returns.
    pub(crate) fn dspace_create(&self, hint: Handle, ds_type: DsType) -> Result<Handle> {
        let handle = {
            let mut alloc = self.allocator.lock();
            if hint.is_null() {
                alloc.allocate()?
            } else {
                alloc.reserve(hint)?;
                hint
            }
        };
        let record = DsAttrRecord::new(ds_type);
        let result = self
            .store
            .lock()
            .put(&keyval::attr_key(handle), &record.encode(), true, true);
        if let Err(err) = result {
            self.allocator.lock().release(handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Remove a dataspace: its attribute record, every keyval entry and the
    /// bstream file. Durable when this returns.
    pub(crate) fn dspace_remove(&self, handle: Handle) -> Result<()> {
        {
            let mut store = self.store.lock();
            if !store.contains(&keyval::attr_key(handle)) {
                return Err(EngineError::NoSuchHandle);
            }
            let (lo, hi) = keyval::handle_range(handle);
            store.remove_range(&lo, &hi, true)?;
        }
        match fs::remove_file(bstream::bstream_path(&self.data_dir, handle)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.allocator.lock().release(handle);
        Ok(())
    }

    /// Fetch the attributes of a dataspace.
    pub(crate) fn dspace_get_attr(&self, handle: Handle) -> Result<DsAttr> {
        let (record, keyval_count) = {
            let store = self.store.lock();
            let record = self.load_attr(&store, handle)?;
            let (lo, hi) = keyval::entry_range(handle);
            (record, store.count_range(&lo, &hi) as u64)
        };
        let bstream_size = self.bstream_size(handle)?;
        record.to_attr(bstream_size, keyval_count)
    }

    /// Current length of a dataspace's bstream; 0 when nothing was written.
    pub(crate) fn bstream_size(&self, handle: Handle) -> Result<u64> {
        match fs::metadata(bstream::bstream_path(&self.data_dir, handle)) {
            Ok(md) => Ok(md.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    // --- keyval operations ---

    /// Read the value stored under `key` in a dataspace's keyval map.
    pub(crate) fn keyval_read(&self, handle: Handle, key: &[u8]) -> Result<Vec<u8>> {
        let store = self.store.lock();
        self.load_attr(&store, handle)?;
        store
            .get(&keyval::entry_key(handle, key))?
            .ok_or(EngineError::NoSuchKey)
    }

    /// Write a keyval entry.
    pub(crate) fn keyval_write(
        &self,
        handle: Handle,
        key: &[u8],
        value: &[u8],
        flags: KeyvalFlags,
    ) -> Result<()> {
        let mut store = self.store.lock();
        let mut record = self.load_attr(&store, handle)?;
        store.put(
            &keyval::entry_key(handle, key),
            value,
            flags.contains(KeyvalFlags::NO_OVERWRITE),
            flags.contains(KeyvalFlags::SYNC),
        )?;
        record.touch_modify();
        store.put(&keyval::attr_key(handle), &record.encode(), false, false)?;
        Ok(())
    }

    /// Remove a keyval entry.
    pub(crate) fn keyval_remove(
        &self,
        handle: Handle,
        key: &[u8],
        flags: KeyvalFlags,
    ) -> Result<()> {
        let mut store = self.store.lock();
        let mut record = self.load_attr(&store, handle)?;
        if !store.remove(&keyval::entry_key(handle, key), flags.contains(KeyvalFlags::SYNC))? {
            return Err(EngineError::NoSuchKey);
        }
        record.touch_modify();
        store.put(&keyval::attr_key(handle), &record.encode(), false, false)?;
        Ok(())
    }

    /// Cursor-based listing of a dataspace's keyval entries.
    pub(crate) fn keyval_iterate(
        &self,
        handle: Handle,
        cursor: KeyvalPosition,
        max_count: usize,
    ) -> Result<(Vec<KeyvalEntry>, KeyvalPosition)> {
        let store = self.store.lock();
        self.load_attr(&store, handle)?;
        let (range_lo, range_hi) = keyval::entry_range(handle);
        let (lower, exclusive) = match &cursor {
            KeyvalPosition::Start => (range_lo.clone(), false),
            KeyvalPosition::After(last) => (keyval::entry_key(handle, last), true),
            KeyvalPosition::End => return Ok((Vec::new(), KeyvalPosition::End)),
        };
        let page = store.scan(&lower, exclusive, &range_hi, max_count)?;
        let next = if page.len() < max_count {
            KeyvalPosition::End
        } else {
            KeyvalPosition::After(keyval::user_key(&page[page.len() - 1].0).to_vec())
        };
        let entries = page
            .into_iter()
            .map(|(k, v)| KeyvalEntry {
                key: keyval::user_key(&k).to_vec(),
                value: v,
            })
            .collect();
        Ok((entries, next))
    }

    // --- bstream operations ---

    /// Scatter/gather write into a dataspace's bstream.
    pub(crate) fn bstream_write_list(
        &self,
        handle: Handle,
        data: &[u8],
        mem: &[bstream::MemRegion],
        stream: &[bstream::StreamRegion],
        flags: BstreamFlags,
    ) -> Result<u64> {
        {
            let store = self.store.lock();
            self.load_attr(&store, handle)?;
        }
        let file = bstream::open_rw(&self.data_dir, handle)?;
        let transferred = bstream::write_list(&file, data, mem, stream)?;
        if flags.contains(BstreamFlags::SYNC) {
            file.sync_data()?;
        }
        let mut store = self.store.lock();
        if let Ok(mut record) = self.load_attr(&store, handle) {
            record.touch_modify();
            store.put(&keyval::attr_key(handle), &record.encode(), false, false)?;
        }
        Ok(transferred)
    }

    /// Scatter/gather read out of a dataspace's bstream.
    pub(crate) fn bstream_read_list(
        &self,
        handle: Handle,
        buf_len: usize,
        mem: &[bstream::MemRegion],
        stream: &[bstream::StreamRegion],
    ) -> Result<(Vec<u8>, u64)> {
        {
            let store = self.store.lock();
            self.load_attr(&store, handle)?;
        }
        let file = bstream::open_ro(&self.data_dir, handle)?;
        let mut buf = vec![0u8; buf_len];
        let transferred = bstream::read_list(file.as_ref(), &mut buf, mem, stream)?;
        Ok((buf, transferred))
    }

    /// Open a registered dataspace's bstream for reading. `None` when the
    /// bstream was never written (every read then observes zeros).
    pub(crate) fn open_bstream_ro(&self, handle: Handle) -> Result<Option<std::fs::File>> {
        {
            let store = self.store.lock();
            self.load_attr(&store, handle)?;
        }
        bstream::open_ro(&self.data_dir, handle)
    }

    /// Open a registered dataspace's bstream for writing.
    pub(crate) fn open_bstream_rw(&self, handle: Handle) -> Result<std::fs::File> {
        {
            let store = self.store.lock();
            self.load_attr(&store, handle)?;
        }
        bstream::open_rw(&self.data_dir, handle)
    }

    // --- collection extended attributes ---

    /// Read a collection extended attribute.
    pub(crate) fn geteattr(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.lock().get(&keyval::eattr_key(key))
    }

    /// Write a collection extended attribute. Always durable: eattrs carry
    /// structural state such as the root handle.
    pub(crate) fn seteattr(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store.lock().put(&keyval::eattr_key(key), value, false, true)
    }

    /// Number of dataspaces registered in the collection.
    pub(crate) fn dspace_count(&self) -> usize {
        self.allocator.lock().live_count()
    }

    fn load_attr(&self, store: &KeyvalStore, handle: Handle) -> Result<DsAttrRecord> {
        match store.get(&keyval::attr_key(handle))? {
            Some(bytes) => DsAttrRecord::decode(&bytes),
            None => Err(EngineError::NoSuchHandle),
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("fs_id", &self.fs_id)
            .field("name", &self.name)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

/// Handles that have a dataspace attribute record in the store.
fn attr_handles(store: &KeyvalStore) -> Vec<Handle> {
    // The tag byte caps composite keys below [0xff; 17], so this range
    // spans the whole keydir.
    store
        .keys_in_range(&[], &[0xffu8; 17])
        .iter()
        .filter_map(|k| match keyval::decode_prefix(k) {
            Some((handle, 0x00)) => Some(handle),
            _ => None,
        })
        .collect()
}

/// The set of collections hosted by one server.
pub struct CollectionRegistry {
    meta_root: PathBuf,
    data_root: PathBuf,
    colls: RwLock<HashMap<FsId, Arc<Collection>>>,
}

impl CollectionRegistry {
    /// Create a registry over the given storage roots, opening every
    /// collection already present in the meta space.
    pub fn open(meta_root: &Path, data_root: &Path) -> Result<CollectionRegistry> {
        fs::create_dir_all(meta_root)?;
        fs::create_dir_all(data_root)?;
        let registry = CollectionRegistry {
            meta_root: meta_root.to_owned(),
            data_root: data_root.to_owned(),
            colls: RwLock::new(HashMap::new()),
        };
        for entry in fs::read_dir(meta_root)? {
            let entry = entry?;
            let Some(fs_id) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
                .map(FsId)
            else {
                continue;
            };
            let coll = Collection::open(
                fs_id,
                HandleRange::DEFAULT,
                &entry.path(),
                &registry.data_root.join(fs_id.to_string()),
            )?;
            registry.colls.write().insert(fs_id, Arc::new(coll));
        }
        Ok(registry)
    }

    /// Create a collection. Fails with `Exist` when the fs_id or the name
    /// collides with a hosted collection.
    pub fn create(
        &self,
        name: &str,
        fs_id: FsId,
        range: HandleRange,
        root_handle: Option<Handle>,
    ) -> Result<Arc<Collection>> {
        if name.is_empty() {
            return Err(EngineError::InvalidArgument("empty collection name".into()));
        }
        let mut colls = self.colls.write();
        if colls.contains_key(&fs_id) || colls.values().any(|c| c.name() == name) {
            return Err(EngineError::Exist);
        }
        let coll = Arc::new(Collection::create(
            fs_id,
            name,
            range,
            &self.meta_root.join(fs_id.to_string()),
            &self.data_root.join(fs_id.to_string()),
        )?);
        if let Some(root) = root_handle {
            let handle = coll.dspace_create(root, DsType::Directory)?;
            coll.seteattr(ROOT_HANDLE_KEY, &handle.to_be_bytes())?;
        }
        info!("collection {name} created with fs_id {fs_id}");
        colls.insert(fs_id, Arc::clone(&coll));
        Ok(coll)
    }

    /// Resolve a collection name to its fs_id.
    pub fn lookup(&self, name: &str) -> Result<FsId> {
        self.colls
            .read()
            .values()
            .find(|c| c.name() == name)
            .map(|c| c.fs_id())
            .ok_or(EngineError::NoSuchCollection)
    }

    /// Fetch a collection by fs_id.
    pub fn get(&self, fs_id: FsId) -> Result<Arc<Collection>> {
        self.colls
            .read()
            .get(&fs_id)
            .cloned()
            .ok_or(EngineError::NoSuchCollection)
    }

    /// fs_ids of every hosted collection.
    pub fn fs_ids(&self) -> Vec<FsId> {
        let mut ids: Vec<FsId> = self.colls.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Remove a collection. Without `purge`, fails with `InvalidArgument`
    /// when dataspaces remain; with it, everything under the collection is
    /// deleted.
    pub fn remove(&self, fs_id: FsId, purge: bool) -> Result<()> {
        let mut colls = self.colls.write();
        let coll = colls.get(&fs_id).ok_or(EngineError::NoSuchCollection)?;
        if !purge && coll.dspace_count() > 0 {
            return Err(EngineError::InvalidArgument(format!(
                "collection {fs_id} is not empty"
            )));
        }
        let name = coll.name().to_owned();
        colls.remove(&fs_id);
        fs::remove_dir_all(self.meta_root.join(fs_id.to_string()))?;
        match fs::remove_dir_all(self.data_root.join(fs_id.to_string())) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("collection {name} (fs_id {fs_id}) removed");
        Ok(())
    }
}

impl std::fmt::Debug for CollectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionRegistry")
            .field("meta_root", &self.meta_root)
            .field("collections", &self.fs_ids())
            .finish()
    }
}
