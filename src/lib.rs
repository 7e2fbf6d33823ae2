mod address;
mod capture;
mod config;
mod dissect;
mod error;
mod hep;
mod packet;
mod storage;

pub use address::Address;
pub use capture::input::CaptureInput;
pub use capture::output::CaptureOutput;
pub use capture::CaptureManager;
pub use config::{CaptureConfig, HepListenerConfig, HepSenderConfig, HepVersion, StorageMode};
pub use error::{CoreError, TlsKeyErrorKind};
pub use packet::Frame;
pub use storage::{CallSnapshot, Storage};

/// Installs the panic hook and tracing subscriber, then starts a
/// `CaptureManager` over the given inputs. This is the orchestration entry
/// point a host binary (`sngrepd`, or an embedding application) calls once
/// at startup; it owns no UI and exposes its state only through `Storage`
/// snapshots and `CaptureManager`'s pause/stop controls.
pub fn run(inputs: Vec<CaptureInput>, config: CaptureConfig) -> Result<CaptureManager, CoreError> {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in sngrep-core: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sngrep_core=info".into()),
        )
        .try_init()
        .ok();

    let mut manager = CaptureManager::new(&config);

    if let Some(hep_listen) = config.hep_listen.clone() {
        let mut with_listener = inputs;
        with_listener.push(CaptureInput::HepListener { config: hep_listen });
        manager.start(with_listener, &config)?;
    } else {
        manager.start(inputs, &config)?;
    }

    tracing::info!("sngrep-core capture manager started");
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_no_inputs_starts_and_stops_cleanly() {
        let mut manager = run(Vec::new(), CaptureConfig::default()).unwrap();
        assert_eq!(manager.storage().call_count(), 0);
        manager.stop();
    }
}
