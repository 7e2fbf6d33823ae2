//! Unified error taxonomy for the capture and dissection pipeline.
//!
//! `CoreError` is the single error type returned across module boundaries.
//! It serializes as `{ "kind": "...", "message": "..." }` so an external
//! poller can distinguish error categories without matching on the enum.

use serde::ser::SerializeStruct;
use std::path::PathBuf;

/// The four closed outcomes of loading a TLS private key, per SPEC_FULL.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsKeyErrorKind {
    KeyfileEmpty,
    KeyInitFail,
    KeyLoadFail,
    WrongAlgo,
}

impl TlsKeyErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsKeyErrorKind::KeyfileEmpty => "KEYFILE_EMPTY",
            TlsKeyErrorKind::KeyInitFail => "KEY_INIT_FAIL",
            TlsKeyErrorKind::KeyLoadFail => "KEY_LOAD_FAIL",
            TlsKeyErrorKind::WrongAlgo => "WRONG_ALGO",
        }
    }
}

impl std::fmt::Display for TlsKeyErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Taxonomy of errors produced by the capture/dissection pipeline.
///
/// Dissector and reassembly errors are local and never surface past the
/// parse step; source and key errors surface to the manager's caller;
/// dump/HEP errors are logged but never abort the process.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A device/file/socket backing a CaptureInput could not be opened.
    #[error("source open failed: {0}")]
    SourceOpenError(String),

    /// A dissector refused the payload.
    #[error("dissector rejected payload: {0}")]
    DissectorReject(String),

    /// A reassembly entry exceeded the maximum capture length.
    #[error("reassembly entry exceeded {limit} bytes")]
    ReassemblyOverflow { limit: usize },

    /// The operator-provided RSA key could not be loaded.
    #[error("TLS key error ({kind}): {detail}")]
    TlsKeyError {
        kind: TlsKeyErrorKind,
        detail: String,
        path: Option<PathBuf>,
    },

    /// A TLS record failed to parse or decrypt.
    #[error("TLS decode error: {0}")]
    TlsDecodeError(String),

    /// Reopening the dump sink after SIGHUP failed.
    #[error("dump sink reopen failed: {0}")]
    DumpOpenError(String),

    /// The configured call limit was reached and rotation is disabled.
    #[error("storage limit exceeded (limit={limit})")]
    StorageLimitExceeded { limit: usize },
}

impl CoreError {
    /// Returns the error kind as a string matching the taxonomy entry name.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::SourceOpenError(_) => "SourceOpenError",
            CoreError::DissectorReject(_) => "DissectorReject",
            CoreError::ReassemblyOverflow { .. } => "ReassemblyOverflow",
            CoreError::TlsKeyError { .. } => "TlsKeyError",
            CoreError::TlsDecodeError(_) => "TlsDecodeError",
            CoreError::DumpOpenError(_) => "DumpOpenError",
            CoreError::StorageLimitExceeded { .. } => "StorageLimitExceeded",
        }
    }
}

/// Custom Serialize: produces `{ "kind": "...", "message": "..." }` for snapshot consumers.
impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("CoreError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::SourceOpenError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_returns_correct_variant_name() {
        assert_eq!(CoreError::DissectorReject("x".into()).kind(), "DissectorReject");
        assert_eq!(
            CoreError::ReassemblyOverflow { limit: 20480 }.kind(),
            "ReassemblyOverflow"
        );
        assert_eq!(
            CoreError::StorageLimitExceeded { limit: 10 }.kind(),
            "StorageLimitExceeded"
        );
    }

    #[test]
    fn test_tls_key_error_kind_strings_match_taxonomy() {
        assert_eq!(TlsKeyErrorKind::KeyfileEmpty.as_str(), "KEYFILE_EMPTY");
        assert_eq!(TlsKeyErrorKind::KeyInitFail.as_str(), "KEY_INIT_FAIL");
        assert_eq!(TlsKeyErrorKind::KeyLoadFail.as_str(), "KEY_LOAD_FAIL");
        assert_eq!(TlsKeyErrorKind::WrongAlgo.as_str(), "WRONG_ALGO");
    }

    #[test]
    fn test_error_serializes_as_kind_and_message() {
        let err = CoreError::DumpOpenError("inode changed but reopen failed".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "DumpOpenError");
        assert!(json["message"].as_str().unwrap().contains("inode changed"));
    }

    #[test]
    fn test_all_variants_serialize_with_two_fields() {
        let variants = vec![
            CoreError::SourceOpenError("a".into()),
            CoreError::DissectorReject("b".into()),
            CoreError::ReassemblyOverflow { limit: 20480 },
            CoreError::TlsKeyError {
                kind: TlsKeyErrorKind::KeyLoadFail,
                detail: "c".into(),
                path: None,
            },
            CoreError::TlsDecodeError("d".into()),
            CoreError::DumpOpenError("e".into()),
            CoreError::StorageLimitExceeded { limit: 1 },
        ];
        for err in variants {
            let json = serde_json::to_value(&err).unwrap();
            let obj = json.as_object().unwrap();
            assert_eq!(obj.len(), 2, "expected exactly 2 fields for {err:?}");
            assert!(obj.contains_key("kind"));
            assert!(obj.contains_key("message"));
        }
    }

    #[test]
    fn test_from_io_error_produces_source_open_variant() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        let core_err: CoreError = io_err.into();
        assert_eq!(core_err.kind(), "SourceOpenError");
        assert!(core_err.to_string().contains("no such device"));
    }
}
