//! SIP message validator and header parser.
//!
//! The validator classifies a byte run the way the reassembly layers need:
//! is there one complete message here, several concatenated ones, or none
//! at all. Grounded directly in SPEC_FULL.md §4.7 since the original
//! source's equivalent (`sip_validate_packet` in `packet_sip.c`) was not
//! part of the retrieved original_source/ set; header parsing follows the
//! same informal grammar (CRLF-terminated headers, blank line separates
//! headers from body, Content-Length governs body length).

use std::collections::HashMap;

const MAX_HEADERS_SCAN: usize = 64 * 1024;

/// Outcome of scanning a byte run for complete SIP messages.
#[derive(Debug, PartialEq, Eq)]
pub enum ValidatorOutcome {
    /// Exactly one complete message occupies the first `usize` bytes.
    CompleteSip(usize),
    /// At least two complete messages are concatenated; `usize` is the
    /// length of the first one. The caller re-validates the remainder.
    MultipleSip(usize),
    /// No complete SIP message starts at the front of the buffer.
    NotSip,
}

fn is_request_or_response_line(line: &[u8]) -> bool {
    let Ok(s) = std::str::from_utf8(line) else { return false };
    s.starts_with("SIP/2.0") || {
        // request-line: METHOD sp request-uri sp SIP/2.0
        let mut parts = s.splitn(3, ' ');
        let method = parts.next().unwrap_or("");
        let has_uri = parts.next().is_some();
        let version = parts.next().unwrap_or("");
        has_uri
            && version.trim_end() == "SIP/2.0"
            && !method.is_empty()
            && method.chars().all(|c| c.is_ascii_alphabetic())
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(headers: &str) -> usize {
    for line in headers.split("\r\n") {
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("content-length:").or_else(|| lower.strip_prefix("l:")) {
            return rest.trim().parse().unwrap_or(0);
        }
    }
    0
}

/// Attempts to locate one complete SIP message at the start of `buf`.
/// Returns its total length (headers + body) on success.
fn try_one_message(buf: &[u8]) -> Option<usize> {
    if buf.len() > MAX_HEADERS_SCAN && find_header_end(&buf[..MAX_HEADERS_SCAN]).is_none() {
        return None;
    }
    let first_line_end = buf.windows(2).position(|w| w == b"\r\n")?;
    if !is_request_or_response_line(&buf[..first_line_end]) {
        return None;
    }
    let header_end = find_header_end(buf)?;
    let headers = std::str::from_utf8(&buf[..header_end]).ok()?;
    let body_len = content_length(headers);
    let total = header_end + body_len;
    if total > buf.len() {
        return None;
    }
    Some(total)
}

/// Classifies `buf` per SPEC_FULL.md §4.7: `NotSip` when no complete
/// message starts at the front, `CompleteSip(n)` when exactly one message
/// of length `n` accounts for the whole buffer, `MultipleSip(n)` when a
/// second message follows the first.
pub fn validate(buf: &[u8]) -> ValidatorOutcome {
    match try_one_message(buf) {
        None => ValidatorOutcome::NotSip,
        Some(len) if len == buf.len() => ValidatorOutcome::CompleteSip(len),
        Some(len) => ValidatorOutcome::MultipleSip(len),
    }
}

/// A parsed SIP message: just the fields the storage layer needs to group
/// messages into calls and dialogs (SPEC_FULL.md §3 Call/Message).
#[derive(Debug, Clone, Default)]
pub struct SipMessage {
    pub is_request: bool,
    pub method_or_status: String,
    pub call_id: Option<String>,
    pub cseq: Option<u32>,
    pub cseq_method: Option<String>,
    pub from_tag: Option<String>,
    pub to_tag: Option<String>,
    pub via_branch: Option<String>,
    pub body: Vec<u8>,
    /// Set by `RetransmissionTracker` when a message with the same Call-ID,
    /// CSeq number, CSeq method, and request/response direction has already
    /// been seen (SPEC_FULL.md §4.7/§8's retransmitted-INVITE scenario).
    pub retransmission: bool,
}

fn tag_from_header(value: &str) -> Option<String> {
    value.split(';').find_map(|p| {
        let p = p.trim();
        p.strip_prefix("tag=").map(|t| t.trim_matches('"').to_string())
    })
}

/// Parses headers the storage layer keys calls/dialogs by. Malformed or
/// absent headers simply leave the corresponding field `None` rather than
/// failing the whole parse: a SIP message lacking Call-ID is still a valid
/// frame worth displaying, just one that can't be grouped into a call.
pub fn parse(buf: &[u8]) -> SipMessage {
    let mut msg = SipMessage::default();
    let Some(header_end) = find_header_end(buf) else { return msg };
    let Ok(text) = std::str::from_utf8(&buf[..header_end]) else { return msg };
    let mut lines = text.split("\r\n");
    if let Some(first) = lines.next() {
        if first.starts_with("SIP/2.0") {
            msg.is_request = false;
            msg.method_or_status = first.splitn(3, ' ').nth(1).unwrap_or("").to_string();
        } else {
            msg.is_request = true;
            msg.method_or_status = first.split(' ').next().unwrap_or("").to_string();
        }
    }

    let mut folded: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            folded
                .entry(normalize_header_name(name.trim()))
                .or_insert_with(|| value.trim().to_string());
        }
    }

    msg.call_id = folded.get("call-id").cloned();
    if let Some(cseq) = folded.get("cseq") {
        let mut parts = cseq.split_whitespace();
        msg.cseq = parts.next().and_then(|n| n.parse().ok());
        msg.cseq_method = parts.next().map(|s| s.to_string());
    }
    if let Some(from) = folded.get("from") {
        msg.from_tag = tag_from_header(from);
    }
    if let Some(to) = folded.get("to") {
        msg.to_tag = tag_from_header(to);
    }
    if let Some(via) = folded.get("via") {
        msg.via_branch = via.split(';').find_map(|p| {
            let p = p.trim();
            p.strip_prefix("branch=").map(|b| b.to_string())
        });
    }

    msg.body = buf[header_end..].to_vec();
    msg
}

/// Per-CaptureInput dedup table that flags retransmitted requests/responses:
/// the same Call-ID, CSeq number, and CSeq method arriving more than once in
/// the same direction (request vs. response) is a retransmission rather than
/// a new message (SPEC_FULL.md §4.7).
#[derive(Default)]
pub struct RetransmissionTracker {
    seen: std::collections::HashSet<(String, u32, String, bool)>,
}

impl RetransmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `msg.retransmission` if this Call-ID/CSeq/method/direction
    /// combination has already been seen. Messages missing any of Call-ID,
    /// CSeq, or CSeq method aren't keyable and are left untouched.
    pub fn check(&mut self, msg: &mut SipMessage) {
        let (Some(call_id), Some(cseq), Some(cseq_method)) =
            (msg.call_id.clone(), msg.cseq, msg.cseq_method.clone())
        else {
            return;
        };
        let key = (call_id, cseq, cseq_method, msg.is_request);
        if !self.seen.insert(key) {
            msg.retransmission = true;
        }
    }
}

fn normalize_header_name(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "i" => "call-id".to_string(),
        "cseq" => "cseq".to_string(),
        "v" => "via".to_string(),
        "f" => "from".to_string(),
        "t" => "to".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Vec<u8> {
        b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bK776\r\n\
From: Alice <sip:alice@example.com>;tag=abc\r\n\
To: Bob <sip:bob@example.com>\r\n\
Call-ID: 123@host\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n"
            .to_vec()
    }

    #[test]
    fn test_single_complete_message_is_complete_sip() {
        let buf = invite();
        assert_eq!(validate(&buf), ValidatorOutcome::CompleteSip(buf.len()));
    }

    #[test]
    fn test_partial_headers_are_not_sip_yet() {
        let buf = b"INVITE sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/UDP host\r\n".to_vec();
        assert_eq!(validate(&buf), ValidatorOutcome::NotSip);
    }

    #[test]
    fn test_two_concatenated_messages_yield_multiple_sip() {
        let mut buf = invite();
        let first_len = buf.len();
        buf.extend(invite());
        assert_eq!(validate(&buf), ValidatorOutcome::MultipleSip(first_len));
    }

    #[test]
    fn test_garbage_is_not_sip() {
        assert_eq!(validate(b"not a sip message at all"), ValidatorOutcome::NotSip);
    }

    #[test]
    fn test_parse_extracts_call_id_cseq_and_tags() {
        let msg = parse(&invite());
        assert!(msg.is_request);
        assert_eq!(msg.method_or_status, "INVITE");
        assert_eq!(msg.call_id.as_deref(), Some("123@host"));
        assert_eq!(msg.cseq, Some(1));
        assert_eq!(msg.cseq_method.as_deref(), Some("INVITE"));
        assert_eq!(msg.from_tag.as_deref(), Some("abc"));
        assert_eq!(msg.via_branch.as_deref(), Some("z9hG4bK776"));
    }

    #[test]
    fn test_parse_handles_compact_header_forms() {
        let buf = b"INVITE sip:bob@x SIP/2.0\r\ni: abc@host\r\nCSeq: 2 INVITE\r\nContent-Length: 0\r\n\r\n".to_vec();
        let msg = parse(&buf);
        assert_eq!(msg.call_id.as_deref(), Some("abc@host"));
    }

    #[test]
    fn test_retransmission_tracker_flags_second_occurrence() {
        let mut tracker = RetransmissionTracker::new();
        let mut first = parse(&invite());
        tracker.check(&mut first);
        assert!(!first.retransmission);

        let mut second = parse(&invite());
        tracker.check(&mut second);
        assert!(second.retransmission);
    }

    #[test]
    fn test_retransmission_tracker_treats_response_separately_from_request() {
        let mut tracker = RetransmissionTracker::new();
        let mut request = parse(&invite());
        tracker.check(&mut request);

        let response = b"SIP/2.0 200 OK\r\nCall-ID: 123@host\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n".to_vec();
        let mut response = parse(&response);
        tracker.check(&mut response);
        assert!(!response.retransmission);
    }

    #[test]
    fn test_response_line_parsed_as_status() {
        let buf = b"SIP/2.0 200 OK\r\nCall-ID: x\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n".to_vec();
        let msg = parse(&buf);
        assert!(!msg.is_request);
        assert_eq!(msg.method_or_status, "200");
    }
}
