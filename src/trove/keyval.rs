//! Per-collection persistent keyval store.
//!
//! One append-only log file per collection holds every keyval record of every
//! dataspace in it, plus the dataspace attribute records and the collection's
//! own extended attributes. An in-memory ordered keydir maps composite keys
//! to value positions in the log, so ordered iteration and prefix scans never
//! touch the log except to read values.
//!
//! Composite key layout: 16 bytes of big-endian handle, one namespace tag,
//! then the caller's key bytes. Records for one dataspace are contiguous in
//! keydir order, which is what cursor-based iteration and removal cascades
//! rely on.
//!
//! Crash consistency: a torn record at the log tail is discarded by
//! truncation at open. A record is either fully present or absent; a lost
//! non-SYNC write can never corrupt unrelated records.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use zerocopy::byteorder::big_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{EngineError, Result};
use crate::handle::Handle;

/// Namespace tag separating record classes under one handle prefix.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum KeySpace {
    /// Dataspace attribute record; the user-key part is empty.
    DsAttr = 0x00,
    /// Ordinary keyval entry of a dataspace.
    Entry = 0x01,
    /// Extended attribute of the collection itself (null handle prefix).
    CollEattr = 0x02,
}

/// Composite key for a dataspace attribute record.
pub(crate) fn attr_key(handle: Handle) -> Vec<u8> {
    compose(handle, KeySpace::DsAttr, &[])
}

/// Composite key for a keyval entry of a dataspace.
pub(crate) fn entry_key(handle: Handle, key: &[u8]) -> Vec<u8> {
    compose(handle, KeySpace::Entry, key)
}

/// Composite key for a collection extended attribute.
pub(crate) fn eattr_key(key: &[u8]) -> Vec<u8> {
    compose(Handle::NULL, KeySpace::CollEattr, key)
}

/// Half-open composite-key range covering every record of `handle`.
pub(crate) fn handle_range(handle: Handle) -> (Vec<u8>, Vec<u8>) {
    let lo = compose(handle, KeySpace::DsAttr, &[]);
    let mut hi = handle.to_be_bytes().to_vec();
    hi.push(0xff);
    (lo, hi)
}

/// Half-open composite-key range covering the keyval entries of `handle`.
pub(crate) fn entry_range(handle: Handle) -> (Vec<u8>, Vec<u8>) {
    let lo = compose(handle, KeySpace::Entry, &[]);
    let mut hi = handle.to_be_bytes().to_vec();
    hi.push(KeySpace::Entry as u8 + 1);
    (lo, hi)
}

/// Strip the composite prefix, returning the caller-visible key.
pub(crate) fn user_key(composite: &[u8]) -> &[u8] {
    &composite[17..]
}

/// The handle prefix of a composite key, with its namespace tag.
pub(crate) fn decode_prefix(composite: &[u8]) -> Option<(Handle, u8)> {
    if composite.len() < 17 {
        return None;
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&composite[..16]);
    Some((Handle::from_be_bytes(raw), composite[16]))
}

fn compose(handle: Handle, space: KeySpace, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + key.len());
    out.extend_from_slice(&handle.to_be_bytes());
    out.push(space as u8);
    out.extend_from_slice(key);
    out
}

/// On-disk record header. `val_len` is `-1` for tombstones.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct EntryHeader {
    key_len: U32,
    val_len: I32,
}

const HEADER_LEN: u64 = 8;

/// Maps composite keys to `(value_position, value_length)` in the log.
type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

/// Append-only keyval log with an in-memory ordered index.
pub(crate) struct KeyvalStore {
    path: PathBuf,
    file: File,
    /// Append position; the file is never written anywhere else.
    tail: u64,
    keydir: KeyDir,
}

impl KeyvalStore {
    /// Open or create the store at `path`, rebuilding the keydir by scanning
    /// the log. A torn tail record is truncated away.
    pub(crate) fn open(path: &Path) -> Result<KeyvalStore> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let (keydir, tail) = build_keydir(&mut file, path)?;
        debug!(
            "keyval store {} opened, {} live keys",
            path.display(),
            keydir.len()
        );
        Ok(KeyvalStore {
            path: path.to_owned(),
            file,
            tail,
            keydir,
        })
    }

    /// Number of live keys in the half-open range `[lo, hi)`.
    pub(crate) fn count_range(&self, lo: &[u8], hi: &[u8]) -> usize {
        self.keydir.range(lo.to_vec()..hi.to_vec()).count()
    }

    /// Whether a live record exists for `key`.
    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.keydir.contains_key(key)
    }

    /// Read the value stored under `key`.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.keydir.get(key) {
            Some(&(pos, len)) => {
                let mut value = vec![0u8; len as usize];
                self.file.read_exact_at(&mut value, pos)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Append a record for `key`. With `no_overwrite`, fails with `Exist`
    /// when a live record is present. With `sync`, the log is made durable
    /// before returning.
    pub(crate) fn put(
        &mut self,
        key: &[u8],
        value: &[u8],
        no_overwrite: bool,
        sync: bool,
    ) -> Result<()> {
        if no_overwrite && self.keydir.contains_key(key) {
            return Err(EngineError::Exist);
        }
        let value_pos = self.append(key, Some(value))?;
        self.keydir
            .insert(key.to_vec(), (value_pos, value.len() as u32));
        if sync {
            self.sync()?;
        }
        Ok(())
    }

    /// Append a tombstone for `key`. Returns whether a live record existed.
    pub(crate) fn remove(&mut self, key: &[u8], sync: bool) -> Result<bool> {
        if !self.keydir.contains_key(key) {
            return Ok(false);
        }
        self.append(key, None)?;
        self.keydir.remove(key);
        if sync {
            self.sync()?;
        }
        Ok(true)
    }

    /// Tombstone every live key in `[lo, hi)`. Returns the number removed.
    pub(crate) fn remove_range(&mut self, lo: &[u8], hi: &[u8], sync: bool) -> Result<usize> {
        let doomed: Vec<Vec<u8>> = self
            .keydir
            .range(lo.to_vec()..hi.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.keydir.remove(key);
            self.append(key, None)?;
        }
        if sync && !doomed.is_empty() {
            self.sync()?;
        }
        Ok(doomed.len())
    }

    /// Read up to `max` live entries with keys in `[lower, hi)`, where
    /// `lower` is exclusive when `exclusive` is set. Entries come back in
    /// key order.
    pub(crate) fn scan(
        &self,
        lower: &[u8],
        exclusive: bool,
        hi: &[u8],
        max: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        use std::ops::Bound;
        let lower_bound = if exclusive {
            Bound::Excluded(lower.to_vec())
        } else {
            Bound::Included(lower.to_vec())
        };
        let mut out = Vec::new();
        for (key, &(pos, len)) in self
            .keydir
            .range((lower_bound, Bound::Excluded(hi.to_vec())))
            .take(max)
        {
            let mut value = vec![0u8; len as usize];
            self.file.read_exact_at(&mut value, pos)?;
            out.push((key.clone(), value));
        }
        Ok(out)
    }

    /// Keys in `[lo, hi)` without reading values. Used for recovery scans.
    pub(crate) fn keys_in_range(&self, lo: &[u8], hi: &[u8]) -> Vec<Vec<u8>> {
        self.keydir
            .range(lo.to_vec()..hi.to_vec())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Force everything appended so far onto stable storage.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        let header = EntryHeader {
            key_len: U32::new(key.len() as u32),
            val_len: I32::new(value.map_or(-1, |v| v.len() as i32)),
        };
        let value_bytes = value.unwrap_or(&[]);
        let mut record =
            Vec::with_capacity(HEADER_LEN as usize + key.len() + value_bytes.len());
        record.extend_from_slice(header.as_bytes());
        record.extend_from_slice(key);
        record.extend_from_slice(value_bytes);

        let pos = self.tail;
        self.file.write_all_at(&record, pos)?;
        self.tail = pos + record.len() as u64;
        Ok(pos + HEADER_LEN + key.len() as u64)
    }
}

impl std::fmt::Debug for KeyvalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyvalStore")
            .field("path", &self.path)
            .field("live_keys", &self.keydir.len())
            .field("tail", &self.tail)
            .finish()
    }
}

/// Scan the log, building the keydir. An incomplete record at the tail is
/// assumed to be a torn write and truncated off.
fn build_keydir(file: &mut File, path: &Path) -> Result<(KeyDir, u64)> {
    let file_len = file.metadata()?.len();
    let mut keydir = KeyDir::new();
    let mut reader = BufReader::new(&mut *file);
    let mut pos = reader.seek(SeekFrom::Start(0))?;

    while pos < file_len {
        let parsed = (|| -> std::io::Result<(Vec<u8>, u64, Option<u32>)> {
            let mut header_buf = [0u8; HEADER_LEN as usize];
            reader.read_exact(&mut header_buf)?;
            let header = EntryHeader::read_from_bytes(&header_buf)
                .expect("header buffer has exact size");
            let key_len = header.key_len.get();
            let val_len = match header.val_len.get() {
                l if l >= 0 => Some(l as u32),
                _ => None,
            };
            let mut key = vec![0u8; key_len as usize];
            reader.read_exact(&mut key)?;
            let value_pos = pos + HEADER_LEN + key_len as u64;
            if let Some(len) = val_len {
                if value_pos + len as u64 > file_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "value extends past end of log",
                    ));
                }
                reader.seek_relative(len as i64)?;
            }
            Ok((key, value_pos, val_len))
        })();

        match parsed {
            Ok((key, value_pos, Some(len))) => {
                keydir.insert(key, (value_pos, len));
                pos = value_pos + len as u64;
            }
            Ok((key, value_pos, None)) => {
                keydir.remove(&key);
                pos = value_pos;
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(
                    "keyval log {}: torn record at offset {pos}, truncating",
                    path.display()
                );
                file.set_len(pos)?;
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok((keydir, pos))
}
