//! TCP segment reassembly into SIP-candidate message boundaries.
//!
//! Grounded in `capture_reasm.c`'s per-flow entry table, generalized from a
//! single global list to a `HashMap` keyed by the 4-tuple, and in
//! SPEC_FULL.md §4.3/§4.7 for the validator-driven flush/split behavior.

use std::collections::HashMap;

use super::sip::{validate, ValidatorOutcome};
use crate::address::Address;
use crate::config::MAX_CAPTURE_LENGTH;

pub type FlowKey = (String, u16, String, u16);

pub fn flow_key(src: &Address, dst: &Address) -> FlowKey {
    (src.ip.clone(), src.port, dst.ip.clone(), dst.port)
}

#[derive(Default)]
struct FlowEntry {
    buf: Vec<u8>,
    /// Segment held back for the two-segment reorder heuristic: a segment
    /// arriving with a sequence number ahead of the next expected byte is
    /// buffered once and merged in if the very next segment closes the gap.
    pending_out_of_order: Option<(u32, Vec<u8>)>,
    next_seq: Option<u32>,
}

/// Per-CaptureInput TCP reassembly table.
#[derive(Default)]
pub struct TcpReassembler {
    flows: HashMap<FlowKey, FlowEntry>,
}

impl TcpReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one TCP segment into the flow's entry and returns zero or more
    /// complete SIP-candidate message byte buffers extracted from it.
    ///
    /// Per SPEC_FULL.md §9.1, out-of-order handling is limited to a single
    /// pending segment: a third segment arriving before the gap closes
    /// forces a flush of whatever is buffered, reproducing the source's
    /// "give up and treat as sequential" fallback rather than building a
    /// general reorder buffer.
    pub fn accept(&mut self, key: FlowKey, seq: u32, psh: bool, payload: &[u8]) -> Vec<Vec<u8>> {
        if payload.is_empty() && !psh {
            return Vec::new();
        }
        let entry = self.flows.entry(key).or_default();

        let expected = entry.next_seq.unwrap_or(seq);
        if seq == expected {
            entry.buf.extend_from_slice(payload);
            entry.next_seq = Some(seq.wrapping_add(payload.len() as u32));
            if let Some((pending_seq, pending_payload)) = entry.pending_out_of_order.take() {
                if pending_seq == entry.next_seq.unwrap() {
                    entry.buf.extend_from_slice(&pending_payload);
                    entry.next_seq = Some(pending_seq.wrapping_add(pending_payload.len() as u32));
                } else {
                    entry.pending_out_of_order = Some((pending_seq, pending_payload));
                }
            }
        } else if entry.pending_out_of_order.is_none() {
            entry.pending_out_of_order = Some((seq, payload.to_vec()));
            return Vec::new();
        } else {
            // A second out-of-order segment arrived before the first gap
            // closed: give up reordering and flush sequentially.
            entry.buf.extend_from_slice(payload);
            entry.next_seq = Some(seq.wrapping_add(payload.len() as u32));
        }

        if entry.buf.len() > MAX_CAPTURE_LENGTH {
            entry.buf.clear();
            entry.pending_out_of_order = None;
            return Vec::new();
        }

        let mut messages = Vec::new();
        loop {
            match validate(&entry.buf) {
                ValidatorOutcome::CompleteSip(len) => {
                    messages.push(entry.buf[..len].to_vec());
                    entry.buf.clear();
                    break;
                }
                ValidatorOutcome::MultipleSip(len) => {
                    messages.push(entry.buf[..len].to_vec());
                    entry.buf.drain(..len);
                }
                ValidatorOutcome::NotSip => {
                    if psh && !entry.buf.is_empty() {
                        // Final delivery hint: flush as-is even though it
                        // never validated, so a non-SIP TCP payload (or a
                        // malformed one) still reaches the caller once.
                        messages.push(std::mem::take(&mut entry.buf));
                    }
                    break;
                }
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite(call_id: &str) -> Vec<u8> {
        format!(
            "INVITE sip:bob@x SIP/2.0\r\nCall-ID: {call_id}\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_single_segment_complete_message_flushes_immediately() {
        let mut reasm = TcpReassembler::new();
        let key = ("10.0.0.1".into(), 5060, "10.0.0.2".into(), 5060);
        let msg = invite("a");
        let out = reasm.accept(key, 0, true, &msg);
        assert_eq!(out, vec![msg]);
    }

    #[test]
    fn test_message_split_across_two_segments() {
        let mut reasm = TcpReassembler::new();
        let key = ("10.0.0.1".into(), 5060, "10.0.0.2".into(), 5060);
        let msg = invite("b");
        let (first, second) = msg.split_at(20);
        assert!(reasm.accept(key.clone(), 0, false, first).is_empty());
        let out = reasm.accept(key, 20, true, second);
        assert_eq!(out, vec![msg]);
    }

    #[test]
    fn test_two_concatenated_messages_in_one_segment_both_emitted() {
        let mut reasm = TcpReassembler::new();
        let key = ("10.0.0.1".into(), 5060, "10.0.0.2".into(), 5060);
        let mut both = invite("c1");
        both.extend(invite("c2"));
        let out = reasm.accept(key, 0, true, &both);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], invite("c1"));
        assert_eq!(out[1], invite("c2"));
    }

    #[test]
    fn test_out_of_order_segment_reordered_once_gap_closes() {
        let mut reasm = TcpReassembler::new();
        let key = ("10.0.0.1".into(), 5060, "10.0.0.2".into(), 5060);
        let msg = invite("d");
        let (first, second) = msg.split_at(20);
        // second segment arrives first
        assert!(reasm.accept(key.clone(), 20, false, second).is_empty());
        let out = reasm.accept(key, 0, true, first);
        assert_eq!(out, vec![msg]);
    }

    #[test]
    fn test_oversized_flow_buffer_is_dropped() {
        let mut reasm = TcpReassembler::new();
        let key = ("10.0.0.1".into(), 5060, "10.0.0.2".into(), 5060);
        let huge = vec![0x41u8; MAX_CAPTURE_LENGTH + 1];
        let out = reasm.accept(key, 0, true, &huge);
        assert!(out.is_empty());
    }
}
