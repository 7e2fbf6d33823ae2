//! In-memory Call/Message/Stream storage with soft eviction.
//!
//! Grounded in SPEC_FULL.md §3 (data model) and §4.10 (rotation): a
//! `Mutex`-guarded registry keyed by Call-ID, with serde DTOs exposed for
//! snapshotting external pollers.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::address::Address;
use crate::dissect::sip::SipMessage;
use crate::error::CoreError;

#[derive(Debug, Clone, serde::Serialize)]
pub struct MessageSnapshot {
    pub is_request: bool,
    pub method_or_status: String,
    pub src: Address,
    pub dst: Address,
    pub ts_usec: u64,
    pub retransmission: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamSnapshot {
    pub src: Address,
    pub dst: Address,
    pub packet_count: u64,
    pub rtcp_packet_count: u64,
    pub lost: u64,
    pub expected: u64,
    pub jitter: f64,
    pub max_jitter: f64,
    pub mean_jitter: f64,
    pub max_delta: u64,
    pub ssrc: Option<u32>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub messages: Vec<MessageSnapshot>,
    pub streams: Vec<StreamSnapshot>,
}

struct Call {
    call_id: String,
    messages: Vec<MessageSnapshot>,
    streams: Vec<StreamSnapshot>,
    last_activity_usec: u64,
}

struct StorageInner {
    calls: HashMap<String, Call>,
    /// Insertion order, oldest first, used for rotation eviction.
    order: Vec<String>,
}

/// `Mutex`-guarded Call/Message/Stream registry for one process. A single
/// `Storage` is shared across every CaptureInput worker thread.
pub struct Storage {
    inner: Mutex<StorageInner>,
    call_limit: Option<usize>,
    rotate: bool,
}

impl Storage {
    pub fn new(call_limit: Option<usize>, rotate: bool) -> Self {
        Self {
            inner: Mutex::new(StorageInner { calls: HashMap::new(), order: Vec::new() }),
            call_limit,
            rotate,
        }
    }

    /// Records a parsed SIP message, creating its Call entry on first sight.
    /// Returns `StorageLimitExceeded` when the call limit is reached and
    /// rotation is disabled; with rotation enabled, the oldest call is
    /// evicted to make room instead.
    pub fn record_message(&self, msg: &SipMessage, src: Address, dst: Address, ts_usec: u64) -> Result<(), CoreError> {
        let Some(call_id) = msg.call_id.clone() else {
            return Ok(()); // unkeyable message: display-only, not stored as a call (SPEC_FULL.md §3)
        };
        let mut inner = self.inner.lock().expect("storage mutex poisoned");

        if !inner.calls.contains_key(&call_id) {
            if let Some(limit) = self.call_limit {
                if inner.calls.len() >= limit {
                    if self.rotate {
                        if let Some(oldest) = inner.order.first().cloned() {
                            inner.calls.remove(&oldest);
                            inner.order.remove(0);
                        }
                    } else {
                        return Err(CoreError::StorageLimitExceeded { limit });
                    }
                }
            }
            inner.order.push(call_id.clone());
            inner.calls.insert(
                call_id.clone(),
                Call { call_id: call_id.clone(), messages: Vec::new(), streams: Vec::new(), last_activity_usec: ts_usec },
            );
        }

        let call = inner.calls.get_mut(&call_id).expect("just inserted or already present");
        call.last_activity_usec = ts_usec;
        call.messages.push(MessageSnapshot {
            is_request: msg.is_request,
            method_or_status: msg.method_or_status.clone(),
            src,
            dst,
            ts_usec,
            retransmission: msg.retransmission,
        });
        Ok(())
    }

    /// Associates an RTP/RTCP stream's running statistics with a call, once
    /// the caller has matched the stream to a Call-ID via SDP-announced
    /// endpoints (SPEC_FULL.md §4.8).
    pub fn record_stream(&self, call_id: &str, snapshot: StreamSnapshot) {
        let mut inner = self.inner.lock().expect("storage mutex poisoned");
        if let Some(call) = inner.calls.get_mut(call_id) {
            match call.streams.iter_mut().find(|s| s.src == snapshot.src && s.dst == snapshot.dst) {
                Some(existing) => *existing = snapshot,
                None => call.streams.push(snapshot),
            }
        }
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().expect("storage mutex poisoned").calls.len()
    }

    pub fn snapshot(&self, call_id: &str) -> Option<CallSnapshot> {
        let inner = self.inner.lock().expect("storage mutex poisoned");
        inner.calls.get(call_id).map(|c| CallSnapshot {
            call_id: c.call_id.clone(),
            messages: c.messages.clone(),
            streams: c.streams.clone(),
        })
    }

    pub fn snapshot_all(&self) -> Vec<CallSnapshot> {
        let inner = self.inner.lock().expect("storage mutex poisoned");
        inner
            .order
            .iter()
            .filter_map(|id| inner.calls.get(id))
            .map(|c| CallSnapshot { call_id: c.call_id.clone(), messages: c.messages.clone(), streams: c.streams.clone() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sip_msg(call_id: &str) -> SipMessage {
        SipMessage {
            is_request: true,
            method_or_status: "INVITE".into(),
            call_id: Some(call_id.into()),
            cseq: Some(1),
            cseq_method: Some("INVITE".into()),
            from_tag: None,
            to_tag: None,
            via_branch: None,
            body: Vec::new(),
            retransmission: false,
        }
    }

    fn addr() -> Address {
        Address::new("10.0.0.1", 5060)
    }

    #[test]
    fn test_record_message_creates_call_on_first_sight() {
        let storage = Storage::new(None, false);
        storage.record_message(&sip_msg("call-1"), addr(), addr(), 0).unwrap();
        assert_eq!(storage.call_count(), 1);
        assert_eq!(storage.snapshot("call-1").unwrap().messages.len(), 1);
    }

    #[test]
    fn test_message_without_call_id_is_ignored_not_errored() {
        let storage = Storage::new(None, false);
        let mut msg = sip_msg("x");
        msg.call_id = None;
        assert!(storage.record_message(&msg, addr(), addr(), 0).is_ok());
        assert_eq!(storage.call_count(), 0);
    }

    #[test]
    fn test_call_limit_without_rotation_rejects_new_calls() {
        let storage = Storage::new(Some(1), false);
        storage.record_message(&sip_msg("call-1"), addr(), addr(), 0).unwrap();
        let err = storage.record_message(&sip_msg("call-2"), addr(), addr(), 0).unwrap_err();
        assert!(matches!(err, CoreError::StorageLimitExceeded { limit: 1 }));
    }

    #[test]
    fn test_call_limit_with_rotation_evicts_oldest() {
        let storage = Storage::new(Some(1), true);
        storage.record_message(&sip_msg("call-1"), addr(), addr(), 0).unwrap();
        storage.record_message(&sip_msg("call-2"), addr(), addr(), 1).unwrap();
        assert_eq!(storage.call_count(), 1);
        assert!(storage.snapshot("call-1").is_none());
        assert!(storage.snapshot("call-2").is_some());
    }

    #[test]
    fn test_record_stream_attaches_to_existing_call() {
        let storage = Storage::new(None, false);
        storage.record_message(&sip_msg("call-1"), addr(), addr(), 0).unwrap();
        storage.record_stream(
            "call-1",
            StreamSnapshot {
                src: addr(),
                dst: addr(),
                packet_count: 10,
                rtcp_packet_count: 1,
                lost: 0,
                expected: 10,
                jitter: 0.5,
                max_jitter: 0.8,
                mean_jitter: 0.4,
                max_delta: 20_000,
                ssrc: Some(0x1122_3344),
            },
        );
        let snap = storage.snapshot("call-1").unwrap();
        assert_eq!(snap.streams.len(), 1);
        assert_eq!(snap.streams[0].packet_count, 10);
    }
}
