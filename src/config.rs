//! Server configuration.
//!
//! A server is configured with three independently-placed storage roots plus
//! sizing knobs for the worker pool, the flow engine's buffer pool and the
//! performance-counter ring. Configuration is read once at startup from a
//! TOML file; the flow protocol and wire encoding selections are immutable
//! after the engine is assembled.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{fatal_invariant, EngineError, Result};

fn default_worker_threads() -> usize {
    4
}

fn default_queue_depth() -> usize {
    1024
}

fn default_io_retries() -> u32 {
    3
}

fn default_perf_interval_ms() -> u64 {
    1000
}

fn default_perf_history() -> usize {
    6
}

fn default_buffer_count() -> usize {
    8
}

fn default_buffer_size() -> usize {
    // 64 pages is 256 KiB on common systems, matching the default network
    // message size the flow pipeline is tuned for.
    64 * page_size::get()
}

/// Sizing of the flow engine's buffer pool. The product of the two fields is
/// the fixed total memory footprint of one engine's bulk-transfer path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Number of in-flight buffers shared by all flows.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Size of each buffer in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            buffer_count: default_buffer_count(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Flow protocol selected at engine start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowProtocol {
    /// Bounded multi-buffer pipelining between endpoints.
    #[default]
    MultiQueue,
    /// Pipelining with an intermediate cache stage.
    BmiCache,
    /// Diagnostic protocol: logs each stage's offsets, moves no data.
    DumpOffsets,
    /// Direct network-to-bstream pipelining.
    BmiTrove,
}

/// Wire encoding selected at engine start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireEncoding {
    /// Host-order direct encoding.
    #[default]
    Direct,
    /// Little-endian bitfield encoding.
    LeBitfield,
    /// XDR encoding.
    Xdr,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for bstream files, one subdirectory per collection.
    pub data_space: PathBuf,
    /// Root for keyval stores and collection metadata.
    pub meta_space: PathBuf,
    /// Root for server configuration and the SID snapshot.
    pub config_space: PathBuf,

    /// Size of the blocking-I/O worker pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Bound of the pending-operation queue feeding the worker pool.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Backing-store I/O retry budget before a collection latches degraded.
    #[serde(default = "default_io_retries")]
    pub io_retries: u32,

    /// Performance-counter rollover interval.
    #[serde(default = "default_perf_interval_ms")]
    pub perf_interval_ms: u64,
    /// Number of samples retained in the performance-counter ring.
    #[serde(default = "default_perf_history")]
    pub perf_history: usize,

    /// Flow buffer pool sizing.
    #[serde(default)]
    pub flow: FlowConfig,
    /// Flow protocol, fixed for the engine's lifetime.
    #[serde(default)]
    pub flow_protocol: FlowProtocol,
    /// Wire encoding, fixed for the engine's lifetime.
    #[serde(default)]
    pub encoding: WireEncoding,
}

impl StorageConfig {
    /// Build a configuration with default sizing for the given storage roots.
    pub fn with_roots(
        data_space: impl Into<PathBuf>,
        meta_space: impl Into<PathBuf>,
        config_space: impl Into<PathBuf>,
    ) -> StorageConfig {
        StorageConfig {
            data_space: data_space.into(),
            meta_space: meta_space.into(),
            config_space: config_space.into(),
            worker_threads: default_worker_threads(),
            queue_depth: default_queue_depth(),
            io_retries: default_io_retries(),
            perf_interval_ms: default_perf_interval_ms(),
            perf_history: default_perf_history(),
            flow: FlowConfig::default(),
            flow_protocol: FlowProtocol::default(),
            encoding: WireEncoding::default(),
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<StorageConfig> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| EngineError::InvalidArgument(format!("config {}: {e}", path.display())))
    }

    /// Write the configuration as TOML, used by `mkspace` to seed the
    /// config space.
    pub fn save(&self, path: &Path) -> Result<()> {
        // Failing to serialize our own config is an invariant violation.
        let text = toml::to_string_pretty(self)
            .unwrap_or_else(|e| fatal_invariant(&format!("config serialize: {e}")));
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: StorageConfig = toml::from_str(
            r#"
            data_space = "/srv/stripefs/data"
            meta_space = "/srv/stripefs/meta"
            config_space = "/srv/stripefs/config"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.worker_threads, 4);
        assert_eq!(cfg.flow_protocol, FlowProtocol::MultiQueue);
        assert_eq!(cfg.encoding, WireEncoding::Direct);
        assert!(cfg.flow.buffer_count > 0);
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.conf");
        let cfg = StorageConfig::with_roots("/d", "/m", "/c");
        cfg.save(&path).unwrap();
        let loaded = StorageConfig::load(&path).unwrap();
        assert_eq!(loaded.meta_space, PathBuf::from("/m"));
        assert_eq!(loaded.queue_depth, cfg.queue_depth);
    }

    #[test]
    fn encoding_names_are_kebab_case() {
        let cfg: StorageConfig = toml::from_str(
            r#"
            data_space = "/d"
            meta_space = "/m"
            config_space = "/c"
            flow_protocol = "bmi-trove"
            encoding = "le-bitfield"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.flow_protocol, FlowProtocol::BmiTrove);
        assert_eq!(cfg.encoding, WireEncoding::LeBitfield);
    }
}
