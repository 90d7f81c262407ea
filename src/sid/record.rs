//! Server identity records.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::EngineError;

/// Stable 128-bit identity of a server process, rendered as a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid(pub Uuid);

impl Sid {
    /// Build a SID from a raw 128-bit value. Mostly useful in tests.
    pub fn from_u128(raw: u128) -> Sid {
        Sid(Uuid::from_u128(raw))
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for Sid {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Sid)
            .map_err(|e| EngineError::InvalidArgument(format!("bad SID {s:?}: {e}")))
    }
}

/// Role a server plays for a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServerRole {
    /// Holds the filesystem root directory.
    Root,
    /// Prime server of the configuration quorum.
    Prime,
    /// Serves configuration state.
    Config,
    /// The local server itself.
    Local,
    /// Serves metadata objects.
    Meta,
    /// Serves file data stripes.
    Data,
    /// Serves directory metadata.
    Dir,
    /// Serves distributed-directory data.
    DirData,
    /// Serves security credentials.
    Security,
}

impl ServerRole {
    /// Every role, in the order they appear in snapshots.
    pub const ALL: [ServerRole; 9] = [
        ServerRole::Root,
        ServerRole::Prime,
        ServerRole::Config,
        ServerRole::Local,
        ServerRole::Meta,
        ServerRole::Data,
        ServerRole::Dir,
        ServerRole::DirData,
        ServerRole::Security,
    ];

    /// The snapshot spelling of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Root => "ROOT",
            ServerRole::Prime => "PRIME",
            ServerRole::Config => "CONFIG",
            ServerRole::Local => "LOCAL",
            ServerRole::Meta => "META",
            ServerRole::Data => "DATA",
            ServerRole::Dir => "DIR",
            ServerRole::DirData => "DIRDATA",
            ServerRole::Security => "SECURITY",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerRole {
    type Err = EngineError;

    /// Unknown role names are errors; the snapshot loader relies on that.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        ServerRole::ALL
            .iter()
            .find(|r| r.as_str() == upper)
            .copied()
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown server role {s:?}")))
    }
}

/// A `(role, fs_id)` binding of a server. `fs_id == 0` means the role
/// applies to every filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SidTypeBinding {
    /// The role.
    pub role: ServerRole,
    /// The filesystem the role applies to, 0 for all.
    pub fs_id: u32,
}

impl SidTypeBinding {
    /// Binding of `role` for one filesystem.
    pub fn new(role: ServerRole, fs_id: u32) -> SidTypeBinding {
        SidTypeBinding { role, fs_id }
    }
}

impl fmt::Display for SidTypeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fs_id == 0 {
            write!(f, "{}", self.role)
        } else {
            write!(f, "{}({})", self.role, self.fs_id)
        }
    }
}

/// Number of per-server attribute slots.
pub const SID_ATTR_COUNT: usize = 4;

/// Snapshot names of the attribute slots, in slot order.
pub const SID_ATTR_NAMES: [&str; SID_ATTR_COUNT] = ["load", "latency", "capacity", "rank"];

/// Resolve an attribute name to its slot.
pub fn attr_slot(name: &str) -> Option<usize> {
    SID_ATTR_NAMES.iter().position(|n| *n == name)
}

/// Everything the cache knows about one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidRecord {
    /// Human-readable alias, if the configuration assigned one.
    pub alias: Option<String>,
    /// Listen address of the server.
    pub url: String,
    /// Resolved network-interface handle for the address.
    pub bmi_addr: u64,
    /// Fixed-length attribute vector, indexed per [`SID_ATTR_NAMES`].
    pub attrs: [i32; SID_ATTR_COUNT],
    /// Role bindings of the server.
    pub types: Vec<SidTypeBinding>,
}

impl SidRecord {
    /// A record with the given address and no roles.
    pub fn new(url: impl Into<String>) -> SidRecord {
        SidRecord {
            alias: None,
            url: url.into(),
            bmi_addr: 0,
            attrs: [0; SID_ATTR_COUNT],
            types: Vec::new(),
        }
    }

    /// Builder-style role binding.
    pub fn with_type(mut self, role: ServerRole, fs_id: u32) -> SidRecord {
        self.types.push(SidTypeBinding::new(role, fs_id));
        self
    }

    /// Builder-style attribute assignment.
    pub fn with_attr(mut self, name: &str, value: i32) -> SidRecord {
        if let Some(slot) = attr_slot(name) {
            self.attrs[slot] = value;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_is_case_insensitive_and_strict() {
        assert_eq!("data".parse::<ServerRole>().unwrap(), ServerRole::Data);
        assert_eq!("DIRDATA".parse::<ServerRole>().unwrap(), ServerRole::DirData);
        assert!("JANITOR".parse::<ServerRole>().is_err());
    }

    #[test]
    fn sid_round_trips_through_text() {
        let sid = Sid::from_u128(0x1234_5678_9abc_def0);
        let parsed: Sid = sid.to_string().parse().unwrap();
        assert_eq!(sid, parsed);
    }

    #[test]
    fn binding_display_elides_zero_fs_id() {
        assert_eq!(SidTypeBinding::new(ServerRole::Meta, 9).to_string(), "META(9)");
        assert_eq!(SidTypeBinding::new(ServerRole::Root, 0).to_string(), "ROOT");
    }
}
