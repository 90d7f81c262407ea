//! Object handles and filesystem identifiers.

use std::fmt;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Opaque 128-bit identifier of a dataspace, unique within a filesystem.
///
/// Rendered as 32 hex digits. The all-zero value is reserved as
/// [`Handle::NULL`] and never refers to a dataspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Handle(pub u128);

impl Handle {
    /// The reserved null handle.
    pub const NULL: Handle = Handle(0);

    /// Whether this is the reserved null handle.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Big-endian byte encoding. Directories conventionally store referenced
    /// handles in this form, and the keyval store uses it as a composite-key
    /// prefix.
    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Inverse of [`Handle::to_be_bytes`].
    pub fn from_be_bytes(bytes: [u8; 16]) -> Handle {
        Handle(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:032x})", self.0)
    }
}

impl FromStr for Handle {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(Handle)
    }
}

/// Numeric identifier of a collection (one hosted filesystem).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct FsId(pub u32);

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Inclusive range of handles a collection may issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleRange {
    /// Smallest issuable handle.
    pub first: Handle,
    /// Largest issuable handle.
    pub last: Handle,
}

impl HandleRange {
    /// The default range issued to new collections: everything above the
    /// reserved null handle.
    pub const DEFAULT: HandleRange = HandleRange {
        first: Handle(1),
        last: Handle(u128::MAX),
    };

    /// Whether `handle` falls inside the range.
    pub fn contains(&self, handle: Handle) -> bool {
        handle >= self.first && handle <= self.last
    }
}

/// Type of a dataspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum DsType {
    /// Directory: keyval entries map names to handles stored as opaque bytes.
    Directory = 1,
    /// Metadata file object.
    Metafile = 2,
    /// Data file object carrying stripe contents in its bstream.
    Datafile = 3,
    /// Symbolic link; the target lives in the keyval map.
    Symlink = 4,
    /// Internal bookkeeping object.
    Internal = 5,
}
