//! CaptureOutput: the rotating pcap dump sink and HEP forwarding side.
//!
//! Grounded in SPEC_FULL.md §4.10: a SIGHUP-driven reopen state machine
//! (Open → Reopening → {Open, Disabled}) so an external log-rotation tool
//! (logrotate-style) can move the file out from under a running process
//! without losing frames, plus optional transparent gzip and a HEP sender
//! side reusing the same `hep::encode_v2`/`encode_v3` the listener decodes.

use std::fs::File;
use std::io::Write;
use std::net::UdpSocket;
use std::path::PathBuf;

use crate::config::{HepSenderConfig, HepVersion};
use crate::error::CoreError;
use crate::hep::{self, HepMessage};
use crate::packet::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpState {
    Open,
    Reopening,
    Disabled,
}

enum Sink {
    Plain(File),
    Gzip(flate2::write::GzEncoder<File>),
}

impl Sink {
    fn open(path: &PathBuf, gzip: bool) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(if gzip { Sink::Gzip(flate2::write::GzEncoder::new(file, flate2::Compression::default())) } else { Sink::Plain(file) })
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Plain(f) => f.write_all(buf),
            Sink::Gzip(f) => f.write_all(buf),
        }
    }
}

/// A rotating pcap dump sink plus an optional HEP forwarding socket, shared
/// by every CaptureInput worker via the manager's output lock.
pub struct CaptureOutput {
    path: PathBuf,
    gzip: bool,
    sink: Option<Sink>,
    state: DumpState,
    global_header_written: bool,
    hep_sender: Option<(UdpSocket, HepSenderConfig)>,
    /// inode of the file backing `sink`, recorded on open so `handle_sighup`
    /// can tell a spurious signal from an actual external rotation.
    inode: Option<u64>,
}

impl CaptureOutput {
    pub fn new(path: PathBuf, gzip: bool) -> Result<Self, CoreError> {
        let sink = Sink::open(&path, gzip).map_err(|e| CoreError::DumpOpenError(e.to_string()))?;
        let inode = current_inode(&path);
        Ok(Self { path, gzip, sink: Some(sink), state: DumpState::Open, global_header_written: false, hep_sender: None, inode })
    }

    pub fn with_hep_sender(mut self, config: HepSenderConfig) -> Result<Self, CoreError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| CoreError::DumpOpenError(e.to_string()))?;
        self.hep_sender = Some((socket, config));
        Ok(self)
    }

    /// Writes one captured frame in classic pcap record format, writing the
    /// 24-byte global header first if this is the first frame since open.
    pub fn write_frame(&mut self, frame: &Frame) {
        if self.state == DumpState::Disabled {
            return;
        }
        let Some(sink) = self.sink.as_mut() else { return };

        if !self.global_header_written {
            if sink.write_all(&global_header()).is_err() {
                self.state = DumpState::Disabled;
                return;
            }
            self.global_header_written = true;
        }

        let mut record = Vec::with_capacity(16 + frame.data.len());
        record.extend_from_slice(&(frame.ts_seconds() as u32).to_le_bytes());
        record.extend_from_slice(&(frame.ts_subsecond_usec() as u32).to_le_bytes());
        record.extend_from_slice(&(frame.caplen).to_le_bytes());
        record.extend_from_slice(&(frame.wirelen).to_le_bytes());
        record.extend_from_slice(&frame.data);

        if sink.write_all(&record).is_err() {
            self.state = DumpState::Disabled;
        }
    }

    /// Forwards a SIP-only message over HEP, honoring the configured version.
    pub fn forward_hep(&self, msg: &HepMessage) {
        let Some((socket, config)) = &self.hep_sender else { return };
        if !hep::is_sip_transport(msg.transport) {
            return;
        }
        let encoded = match config.version {
            HepVersion::V2 => hep::encode_v2(msg),
            HepVersion::V3 => hep::encode_v3(msg, config.password.as_deref()),
        };
        let _ = socket.send_to(&encoded, (config.addr, config.port));
    }

    /// Handles a SIGHUP: only reopens the sink if the path's inode differs
    /// from the one recorded at the last open, i.e. the file was actually
    /// rotated out from under us (an external `mv` + signal). A spurious
    /// SIGHUP where nothing moved leaves the current sink untouched.
    pub fn handle_sighup(&mut self) {
        if current_inode(&self.path) == self.inode {
            return;
        }
        self.state = DumpState::Reopening;
        self.sink = None;
        match Sink::open(&self.path, self.gzip) {
            Ok(sink) => {
                self.sink = Some(sink);
                self.inode = current_inode(&self.path);
                self.global_header_written = false;
                self.state = DumpState::Open;
            }
            Err(e) => {
                tracing::error!("dump sink reopen failed, disabling output: {e}");
                self.state = DumpState::Disabled;
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.state == DumpState::Disabled
    }
}

fn current_inode(path: &PathBuf) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.ino())
}

fn global_header() -> [u8; 24] {
    let mut h = [0u8; 24];
    h[0..4].copy_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    h[4..6].copy_from_slice(&2u16.to_le_bytes()); // version major
    h[6..8].copy_from_slice(&4u16.to_le_bytes()); // version minor
    h[16..20].copy_from_slice(&(crate::config::MAX_CAPTURE_LENGTH as u32).to_le_bytes());
    h[20..24].copy_from_slice(&1u32.to_le_bytes()); // DLT_EN10MB
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_header_has_correct_magic() {
        let h = global_header();
        assert_eq!(&h[0..4], &0xa1b2_c3d4u32.to_le_bytes());
    }

    #[test]
    fn test_spurious_sighup_leaves_global_header_state_untouched() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("sngrep-core-test-spurious-{}.pcap", std::process::id()));
        let mut output = CaptureOutput::new(path.clone(), false).unwrap();
        let frame = Frame::new(1_000_000, 4, vec![1, 2, 3, 4]);
        output.write_frame(&frame);
        assert!(output.global_header_written);
        output.handle_sighup();
        assert!(!output.is_disabled());
        assert!(output.global_header_written, "no external rotation happened, so the sink shouldn't have reopened");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_external_rotation_triggers_reopen_on_sighup() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("sngrep-core-test-rotate-{}.pcap", std::process::id()));
        let rotated = dir.join(format!("sngrep-core-test-rotate-{}.pcap.1", std::process::id()));
        let mut output = CaptureOutput::new(path.clone(), false).unwrap();
        let frame = Frame::new(1_000_000, 4, vec![1, 2, 3, 4]);
        output.write_frame(&frame);
        assert!(output.global_header_written);

        std::fs::rename(&path, &rotated).unwrap();
        output.handle_sighup();
        assert!(!output.is_disabled());
        assert!(!output.global_header_written, "the sink should have reopened against a fresh inode at the same path");

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&rotated);
    }
}
