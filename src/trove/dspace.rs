//! Dataspace attribute records.

use std::time::{SystemTime, UNIX_EPOCH};

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{EngineError, Result};
use crate::handle::DsType;

/// Attributes of a dataspace as returned by `dspace_get_attr`.
///
/// `bstream_size` and `keyval_count` are computed from the backing store at
/// query time; the timestamps are stored in the attribute record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsAttr {
    /// Type of the dataspace.
    pub ds_type: DsType,
    /// Current length of the bstream in bytes.
    pub bstream_size: u64,
    /// Number of live keyval entries.
    pub keyval_count: u64,
    /// Creation time, milliseconds since the epoch.
    pub create_time_ms: u64,
    /// Last mutation time, milliseconds since the epoch.
    pub modify_time_ms: u64,
    /// Last access time, milliseconds since the epoch.
    pub access_time_ms: u64,
}

/// On-disk shape of the stored part of [`DsAttr`].
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct DsAttrRecord {
    ds_type: U32,
    create_time_ms: U64,
    modify_time_ms: U64,
    access_time_ms: U64,
}

impl DsAttrRecord {
    pub(crate) fn new(ds_type: DsType) -> DsAttrRecord {
        let now = now_ms();
        DsAttrRecord {
            ds_type: U32::new(ds_type.into()),
            create_time_ms: U64::new(now),
            modify_time_ms: U64::new(now),
            access_time_ms: U64::new(now),
        }
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<DsAttrRecord> {
        DsAttrRecord::read_from_bytes(bytes)
            .map_err(|_| EngineError::Internal("malformed dataspace attribute record".into()))
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    pub(crate) fn ds_type(&self) -> Result<DsType> {
        DsType::try_from(self.ds_type.get())
            .map_err(|_| EngineError::Internal("unknown dataspace type on disk".into()))
    }

    pub(crate) fn touch_modify(&mut self) {
        let now = now_ms();
        self.modify_time_ms = U64::new(now);
        self.access_time_ms = U64::new(now);
    }

    /// Assemble the caller-visible attributes.
    pub(crate) fn to_attr(&self, bstream_size: u64, keyval_count: u64) -> Result<DsAttr> {
        Ok(DsAttr {
            ds_type: self.ds_type()?,
            bstream_size,
            keyval_count,
            create_time_ms: self.create_time_ms.get(),
            modify_time_ms: self.modify_time_ms.get(),
            access_time_ms: self.access_time_ms.get(),
        })
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let rec = DsAttrRecord::new(DsType::Directory);
        let decoded = DsAttrRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded.ds_type().unwrap(), DsType::Directory);
        assert_eq!(decoded.create_time_ms.get(), rec.create_time_ms.get());
    }

    #[test]
    fn truncated_record_is_internal_error() {
        let rec = DsAttrRecord::new(DsType::Datafile).encode();
        assert!(matches!(
            DsAttrRecord::decode(&rec[..rec.len() - 1]).unwrap_err(),
            EngineError::Internal(_)
        ));
    }
}
