//! Capture manager: owns every active CaptureInput plus an optional
//! CaptureOutput dump sink.
//!
//! Uses an `Arc<AtomicBool>` shutdown flag, named worker threads, and a
//! `Drop` impl that releases resources on panic/exit, generalized from one
//! platform backend to any number of `CaptureInput`s feeding one shared
//! `Storage` (SPEC_FULL.md §4.9).

pub mod input;
pub mod output;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::CaptureConfig;
use crate::error::CoreError;
use crate::storage::Storage;
use input::{CaptureInput, PendingReconfig};
use output::CaptureOutput;

/// Owns the running capture pipeline: one worker thread per `CaptureInput`,
/// all feeding the same `Storage`, plus an optional dump/HEP-forwarding
/// sink shared across them.
pub struct CaptureManager {
    shutdown: Arc<AtomicBool>,
    workers: Vec<std::thread::JoinHandle<()>>,
    storage: Arc<Storage>,
    output: Arc<Mutex<Option<CaptureOutput>>>,
    paused: Arc<AtomicBool>,
    pending: Arc<PendingReconfig>,
}

impl CaptureManager {
    pub fn new(config: &CaptureConfig) -> Self {
        let storage = Arc::new(Storage::new(config.call_limit, config.rotate));
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            storage,
            output: Arc::new(Mutex::new(None)),
            paused: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(PendingReconfig::new()),
        }
    }

    pub fn storage(&self) -> Arc<Storage> {
        Arc::clone(&self.storage)
    }

    /// Spawns one named worker thread per `CaptureInput`
    /// (SPEC_FULL.md §5.1: `std::thread::Builder` named workers, no async
    /// runtime).
    pub fn start(&mut self, inputs: Vec<CaptureInput>, config: &CaptureConfig) -> Result<(), CoreError> {
        for (idx, input) in inputs.into_iter().enumerate() {
            let shutdown = Arc::clone(&self.shutdown);
            let paused = Arc::clone(&self.paused);
            let storage = Arc::clone(&self.storage);
            let output = Arc::clone(&self.output);
            let pending = Arc::clone(&self.pending);
            let include_rtp = config.include_rtp;
            let worker_config = config.clone();

            let handle = std::thread::Builder::new()
                .name(format!("capture-input-{idx}"))
                .spawn(move || {
                    input::run_capture_loop(input, shutdown, paused, storage, output, include_rtp, worker_config, pending);
                })
                .map_err(|e| CoreError::SourceOpenError(e.to_string()))?;
            self.workers.push(handle);
        }
        Ok(())
    }

    /// Attaches a dump sink; takes effect for subsequently-captured frames.
    pub fn set_dumper(&self, dumper: Option<CaptureOutput>) {
        *self.output.lock().expect("output mutex poisoned") = dumper;
    }

    pub fn set_pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Queues a new BPF filter for every live-capture worker, applied on its
    /// next poll iteration without tearing down the manager
    /// (SPEC_FULL.md §4.9).
    pub fn set_bpf_filter(&self, filter: String) {
        *self.pending.bpf_filter.lock().expect("bpf filter mutex poisoned") = Some(filter);
    }

    /// Queues a new TLS keyfile for every worker's connection table, applied
    /// on its next poll iteration.
    pub fn set_keyfile(&self, path: PathBuf) {
        *self.pending.keyfile.lock().expect("keyfile mutex poisoned") = Some(path);
    }

    /// Signals every worker to stop and joins them. Workers poll with a
    /// bounded timeout (`POLL_TIMEOUT_MS`), so shutdown latency is bounded
    /// rather than relying on a cancellable blocking read.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Relaxed) {
            tracing::warn!("CaptureManager dropped while running — releasing capture resources");
        }
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_manager_has_no_active_calls() {
        let manager = CaptureManager::new(&CaptureConfig::default());
        assert_eq!(manager.storage().call_count(), 0);
    }

    #[test]
    fn test_stop_without_start_is_a_no_op() {
        let mut manager = CaptureManager::new(&CaptureConfig::default());
        manager.stop();
        assert!(manager.workers.is_empty());
    }

    #[test]
    fn test_set_bpf_filter_queues_pending_value() {
        let manager = CaptureManager::new(&CaptureConfig::default());
        manager.set_bpf_filter("udp port 5060".to_string());
        assert_eq!(manager.pending.bpf_filter.lock().unwrap().as_deref(), Some("udp port 5060"));
    }

    #[test]
    fn test_set_keyfile_queues_pending_value() {
        let manager = CaptureManager::new(&CaptureConfig::default());
        manager.set_keyfile(PathBuf::from("/tmp/key.pem"));
        assert_eq!(manager.pending.keyfile.lock().unwrap().clone(), Some(PathBuf::from("/tmp/key.pem")));
    }

    #[test]
    fn test_set_pause_toggles_flag() {
        let manager = CaptureManager::new(&CaptureConfig::default());
        manager.set_pause(true);
        assert!(manager.paused.load(Ordering::Relaxed));
        manager.set_pause(false);
        assert!(!manager.paused.load(Ordering::Relaxed));
    }
}
