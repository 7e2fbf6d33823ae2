//! Configuration options consumed by the capture core.
//!
//! This is the in-process surface the Capture manager is built from
//! (SPEC_FULL.md §6.4). Building it from argv, a config file, or the
//! environment is a caller responsibility and lives outside this crate.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::address::Address;

/// What to retain about a Packet's frames after it has been parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Drop frame bytes once parsed; keep only derived Call/Message/Stream data.
    None,
    /// Keep frame bytes in memory for the lifetime of the owning Call.
    #[default]
    Memory,
    /// Keep frame bytes, backed by the dump sink rather than memory.
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HepVersion {
    V2,
    V3,
}

/// HEP sender configuration (`hep.send.*`).
#[derive(Debug, Clone)]
pub struct HepSenderConfig {
    pub addr: IpAddr,
    pub port: u16,
    pub version: HepVersion,
    pub password: Option<String>,
    pub capture_id: u32,
}

/// HEP listener configuration (`hep.listen.*`).
#[derive(Debug, Clone)]
pub struct HepListenerConfig {
    pub addr: IpAddr,
    pub port: u16,
    pub version: HepVersion,
    pub password: Option<String>,
}

/// Runtime options consumed by the Capture manager.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// capture.limit: maximum concurrent calls. `None` means unbounded.
    pub call_limit: Option<usize>,
    /// capture.rtp: include RTP stream tracking in storage.
    pub include_rtp: bool,
    /// capture.rotate: evict the oldest Call when the limit is reached.
    pub rotate: bool,
    /// capture.storage: whether to retain packet frames after parse.
    pub storage: StorageMode,
    /// capture.tls_server: restrict new TLS connection tracking to this destination.
    pub tls_server: Option<Address>,
    /// capture.keyfile: RSA PEM key used to decrypt TLS PreMasterSecrets.
    pub keyfile: Option<PathBuf>,
    /// capture.pcap_buffer_size, in megabytes.
    pub pcap_buffer_size_mb: u32,
    pub hep_send: Option<HepSenderConfig>,
    pub hep_listen: Option<HepListenerConfig>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            call_limit: None,
            include_rtp: true,
            rotate: false,
            storage: StorageMode::default(),
            tls_server: None,
            keyfile: None,
            pcap_buffer_size_mb: 2,
            hep_send: None,
            hep_listen: None,
        }
    }
}

/// Maximum bytes a single reassembled datagram/message may occupy before
/// the entry is dropped (`CoreError::ReassemblyOverflow`).
pub const MAX_CAPTURE_LENGTH: usize = 20480;

/// Snaplen used when opening a live capture handle.
pub const LIVE_SNAPLEN: i32 = 262_144;

/// Poll timeout (milliseconds) for blocking capture reads, bounding shutdown latency.
pub const POLL_TIMEOUT_MS: i32 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_compiled_in_defaults() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.call_limit, None);
        assert!(cfg.include_rtp);
        assert!(!cfg.rotate);
        assert_eq!(cfg.storage, StorageMode::Memory);
        assert!(cfg.tls_server.is_none());
        assert!(cfg.keyfile.is_none());
        assert_eq!(cfg.pcap_buffer_size_mb, 2);
        assert!(cfg.hep_send.is_none());
        assert!(cfg.hep_listen.is_none());
    }

    #[test]
    fn test_max_capture_length_matches_spec_ceiling() {
        assert_eq!(MAX_CAPTURE_LENGTH, 20480);
    }

    #[test]
    fn test_live_snaplen_matches_spec() {
        assert_eq!(LIVE_SNAPLEN, 262_144);
    }
}
