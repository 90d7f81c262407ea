//! The SID cache: this server's view of every server identity in the
//! cluster.
//!
//! A primary map from SID to record is augmented by two kinds of secondary
//! index: an ordered index per named attribute, answering range and top-k
//! queries, and a type index from `(role, fs_id)` to the SIDs bound to it.
//! Secondary indices are updated under the same write lock as the primary,
//! so observers never see a half-applied update. Reads take a shared lock
//! and proceed concurrently.

use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, Write};
use std::ops::RangeInclusive;

use log::info;
use parking_lot::RwLock;

use crate::error::{EngineError, Result};

pub mod record;
mod snapshot;

pub use record::{
    attr_slot, ServerRole, Sid, SidRecord, SidTypeBinding, SID_ATTR_COUNT, SID_ATTR_NAMES,
};

#[derive(Default)]
struct SidCacheInner {
    primary: HashMap<Sid, SidRecord>,
    /// One ordered index per attribute slot, keyed `(value, sid)`.
    attr_index: [BTreeSet<(i32, Sid)>; SID_ATTR_COUNT],
    /// `(role, fs_id)` to SIDs, in insertion order.
    type_index: HashMap<(ServerRole, u32), Vec<Sid>>,
}

impl SidCacheInner {
    fn index_insert(&mut self, sid: Sid, record: &SidRecord) {
        for (slot, value) in record.attrs.iter().enumerate() {
            self.attr_index[slot].insert((*value, sid));
        }
        for binding in &record.types {
            let sids = self.type_index.entry((binding.role, binding.fs_id)).or_default();
            if !sids.contains(&sid) {
                sids.push(sid);
            }
        }
    }

    fn index_remove(&mut self, sid: Sid, record: &SidRecord) {
        for (slot, value) in record.attrs.iter().enumerate() {
            self.attr_index[slot].remove(&(*value, sid));
        }
        for binding in &record.types {
            if let Some(sids) = self.type_index.get_mut(&(binding.role, binding.fs_id)) {
                sids.retain(|s| *s != sid);
                if sids.is_empty() {
                    self.type_index.remove(&(binding.role, binding.fs_id));
                }
            }
        }
    }

    /// Replace `sid`'s record, keeping every index consistent.
    fn upsert(&mut self, sid: Sid, record: SidRecord) {
        if let Some(old) = self.primary.remove(&sid) {
            self.index_remove(sid, &old);
        }
        self.index_insert(sid, &record);
        self.primary.insert(sid, record);
    }
}

/// Concurrent cache of server identities.
#[derive(Default)]
pub struct SidCache {
    inner: RwLock<SidCacheInner>,
}

impl SidCache {
    /// An empty cache.
    pub fn new() -> SidCache {
        SidCache::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.inner.read().primary.len()
    }

    /// Whether the cache holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a record. With `no_overwrite`, a live record for
    /// the SID fails the insert with `Exist`.
    pub fn put(&self, sid: Sid, record: SidRecord, no_overwrite: bool) -> Result<()> {
        let mut inner = self.inner.write();
        if no_overwrite && inner.primary.contains_key(&sid) {
            return Err(EngineError::Exist);
        }
        inner.upsert(sid, record);
        Ok(())
    }

    /// Fetch a record by SID.
    pub fn get(&self, sid: Sid) -> Result<SidRecord> {
        self.inner
            .read()
            .primary
            .get(&sid)
            .cloned()
            .ok_or(EngineError::NoSuchKey)
    }

    /// Partial attribute update: slots holding `-1` are left unchanged.
    pub fn update_attrs(&self, sid: Sid, new_values: &[i32; SID_ATTR_COUNT]) -> Result<()> {
        let mut inner = self.inner.write();
        let mut record = inner.primary.get(&sid).cloned().ok_or(EngineError::NoSuchKey)?;
        for (slot, value) in new_values.iter().enumerate() {
            if *value != -1 {
                record.attrs[slot] = *value;
            }
        }
        inner.upsert(sid, record);
        Ok(())
    }

    /// Replace the record's address URL.
    pub fn update_url(&self, sid: Sid, url: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.write();
        let mut record = inner.primary.get(&sid).cloned().ok_or(EngineError::NoSuchKey)?;
        record.url = url.into();
        inner.upsert(sid, record);
        Ok(())
    }

    /// Replace the record's resolved network handle.
    pub fn update_bmi(&self, sid: Sid, bmi_addr: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let mut record = inner.primary.get(&sid).cloned().ok_or(EngineError::NoSuchKey)?;
        record.bmi_addr = bmi_addr;
        inner.upsert(sid, record);
        Ok(())
    }

    /// Add a role binding to a record.
    pub fn add_type(&self, sid: Sid, binding: SidTypeBinding) -> Result<()> {
        let mut inner = self.inner.write();
        let mut record = inner.primary.get(&sid).cloned().ok_or(EngineError::NoSuchKey)?;
        if !record.types.contains(&binding) {
            record.types.push(binding);
        }
        inner.upsert(sid, record);
        Ok(())
    }

    /// Remove a record, cascading through every secondary index.
    pub fn delete(&self, sid: Sid) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner.primary.remove(&sid).ok_or(EngineError::NoSuchKey)?;
        inner.index_remove(sid, &record);
        Ok(())
    }

    /// SIDs bound to `(role, fs_id)`, in insertion order. A binding with
    /// `fs_id == 0` matches queries for every filesystem.
    pub fn lookup_by_type(&self, role: ServerRole, fs_id: u32) -> Vec<Sid> {
        let inner = self.inner.read();
        let mut out: Vec<Sid> = inner
            .type_index
            .get(&(role, fs_id))
            .cloned()
            .unwrap_or_default();
        if fs_id != 0 {
            if let Some(wildcards) = inner.type_index.get(&(role, 0)) {
                for sid in wildcards {
                    if !out.contains(sid) {
                        out.push(*sid);
                    }
                }
            }
        }
        out
    }

    /// The `k` servers with the largest value of an attribute, descending.
    pub fn top_k_by_attr(&self, attr: &str, k: usize) -> Result<Vec<(Sid, i32)>> {
        let slot = attr_slot(attr)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown attribute {attr:?}")))?;
        let inner = self.inner.read();
        Ok(inner.attr_index[slot]
            .iter()
            .rev()
            .take(k)
            .map(|(value, sid)| (*sid, *value))
            .collect())
    }

    /// Servers whose attribute value falls within `range`, ascending.
    pub fn range_by_attr(&self, attr: &str, range: RangeInclusive<i32>) -> Result<Vec<(Sid, i32)>> {
        let slot = attr_slot(attr)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown attribute {attr:?}")))?;
        let inner = self.inner.read();
        Ok(inner.attr_index[slot]
            .range((*range.start(), Sid::from_u128(0))..=(*range.end(), Sid::from_u128(u128::MAX)))
            .map(|(value, sid)| (*sid, *value))
            .collect())
    }

    /// Insert a batch of records, replacing live ones. Used for gossip.
    pub fn bulk_insert(&self, records: Vec<(Sid, SidRecord)>) -> usize {
        let mut inner = self.inner.write();
        let count = records.len();
        for (sid, record) in records {
            inner.upsert(sid, record);
        }
        count
    }

    /// Export a subset of records as a snapshot buffer for gossip. SIDs not
    /// present in the cache are skipped.
    pub fn bulk_export(&self, sids: &[Sid]) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let subset: Vec<(&Sid, &SidRecord)> = sids
            .iter()
            .filter_map(|sid| inner.primary.get_key_value(sid))
            .collect();
        let mut buf = Vec::new();
        snapshot::write_snapshot(&mut buf, subset)?;
        Ok(buf)
    }

    /// Write every record and every type binding as a snapshot.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let inner = self.inner.read();
        // Deterministic order keeps snapshots diffable across saves.
        let mut records: Vec<(&Sid, &SidRecord)> = inner.primary.iter().collect();
        records.sort_by_key(|(sid, _)| **sid);
        snapshot::write_snapshot(writer, records)?;
        info!("saved SID snapshot with {} records", inner.primary.len());
        Ok(())
    }

    /// Load a snapshot, inserting or replacing each record it contains.
    /// Returns the number of records loaded.
    pub fn load<R: BufRead>(&self, reader: R) -> Result<usize> {
        let records = snapshot::read_snapshot(reader)?;
        let count = self.bulk_insert(records);
        info!("loaded SID snapshot with {count} records");
        Ok(count)
    }
}

impl std::fmt::Debug for SidCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidCache").field("records", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_server(n: u128, load: i32, fs: u32) -> (Sid, SidRecord) {
        (
            Sid::from_u128(n),
            SidRecord::new(format!("tcp://host{n}:3334"))
                .with_attr("load", load)
                .with_type(ServerRole::Data, fs),
        )
    }

    #[test]
    fn put_get_delete() {
        let cache = SidCache::new();
        let (sid, record) = data_server(1, 3, 9);
        cache.put(sid, record.clone(), true).unwrap();
        assert_eq!(cache.get(sid).unwrap(), record);
        assert_eq!(
            cache.put(sid, record, true).unwrap_err(),
            EngineError::Exist
        );
        cache.delete(sid).unwrap();
        assert_eq!(cache.get(sid).unwrap_err(), EngineError::NoSuchKey);
        assert!(cache.lookup_by_type(ServerRole::Data, 9).is_empty());
    }

    #[test]
    fn type_lookup_matches_record_type_sets() {
        let cache = SidCache::new();
        let (a, rec_a) = data_server(1, 3, 9);
        let (b, mut_rec) = data_server(2, 7, 9);
        let rec_b = mut_rec.with_type(ServerRole::Meta, 9);
        cache.put(a, rec_a, true).unwrap();
        cache.put(b, rec_b, true).unwrap();

        assert_eq!(cache.lookup_by_type(ServerRole::Data, 9), vec![a, b]);
        assert_eq!(cache.lookup_by_type(ServerRole::Meta, 9), vec![b]);
        assert!(cache.lookup_by_type(ServerRole::Data, 4).is_empty());
    }

    #[test]
    fn wildcard_binding_answers_every_fs() {
        let cache = SidCache::new();
        let sid = Sid::from_u128(5);
        cache
            .put(sid, SidRecord::new("tcp://r:1").with_type(ServerRole::Root, 0), true)
            .unwrap();
        assert_eq!(cache.lookup_by_type(ServerRole::Root, 9), vec![sid]);
        assert_eq!(cache.lookup_by_type(ServerRole::Root, 0), vec![sid]);
    }

    #[test]
    fn attr_updates_keep_the_ordered_index_consistent() {
        let cache = SidCache::new();
        for (n, load) in [(1, 30), (2, 10), (3, 20)] {
            let (sid, rec) = data_server(n, load, 9);
            cache.put(sid, rec, true).unwrap();
        }
        assert_eq!(
            cache.top_k_by_attr("load", 2).unwrap(),
            vec![(Sid::from_u128(1), 30), (Sid::from_u128(3), 20)]
        );

        // Slot 0 is load; -1 leaves the other slots alone.
        cache
            .update_attrs(Sid::from_u128(2), &[99, -1, -1, -1])
            .unwrap();
        assert_eq!(
            cache.top_k_by_attr("load", 1).unwrap(),
            vec![(Sid::from_u128(2), 99)]
        );
        // The stale index entry is gone.
        assert_eq!(
            cache.range_by_attr("load", 0..=15).unwrap(),
            Vec::<(Sid, i32)>::new()
        );
    }

    #[test]
    fn update_url_and_bmi() {
        let cache = SidCache::new();
        let (sid, rec) = data_server(1, 0, 9);
        cache.put(sid, rec, true).unwrap();
        cache.update_url(sid, "tcp://moved:9999").unwrap();
        cache.update_bmi(sid, 42).unwrap();
        let rec = cache.get(sid).unwrap();
        assert_eq!(rec.url, "tcp://moved:9999");
        assert_eq!(rec.bmi_addr, 42);
    }

    #[test]
    fn snapshot_save_load_reproduces_records_and_bindings() {
        let cache = SidCache::new();
        let (a, rec_a) = data_server(1, 3, 9);
        let (b, rec_b) = data_server(2, 7, 9);
        let rec_b = rec_b.with_type(ServerRole::Meta, 9);
        cache.put(a, rec_a.clone(), true).unwrap();
        cache.put(b, rec_b.clone(), true).unwrap();

        let mut buf = Vec::new();
        cache.save(&mut buf).unwrap();

        let restored = SidCache::new();
        assert_eq!(restored.load(buf.as_slice()).unwrap(), 2);
        assert_eq!(restored.get(a).unwrap(), rec_a);
        assert_eq!(restored.get(b).unwrap(), rec_b);
        assert_eq!(restored.lookup_by_type(ServerRole::Data, 9), vec![a, b]);
        assert_eq!(restored.lookup_by_type(ServerRole::Meta, 9), vec![b]);
    }

    #[test]
    fn bulk_export_feeds_load() {
        let cache = SidCache::new();
        let (a, rec_a) = data_server(1, 3, 9);
        let (b, rec_b) = data_server(2, 7, 9);
        cache.put(a, rec_a, true).unwrap();
        cache.put(b, rec_b.clone(), true).unwrap();

        let buf = cache.bulk_export(&[b]).unwrap();
        let peer = SidCache::new();
        peer.load(buf.as_slice()).unwrap();
        assert_eq!(peer.len(), 1);
        assert_eq!(peer.get(b).unwrap(), rec_b);
    }
}
