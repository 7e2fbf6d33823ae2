//! HEP (Homer Encapsulation Protocol) v2/v3 encode and decode.
//!
//! Grounded in `capture_eep.c`: HEP2 is a fixed 32-byte-ish binary header
//! followed by the raw SIP payload; HEP3 is a `"\x48\x45\x50\x33"` magic
//! plus a stream of TLV "chunks" (vendor_id/type_id/length triples) that
//! can appear in any order, terminated only by the outer length field.

use crate::address::Address;

const HEP3_MAGIC: &[u8; 4] = b"HEP3";

const CHUNK_IP_FAMILY: u16 = 0x0001;
const CHUNK_IP_PROTO: u16 = 0x0002;
const CHUNK_SRC_IP4: u16 = 0x0003;
const CHUNK_DST_IP4: u16 = 0x0004;
const CHUNK_SRC_IP6: u16 = 0x0005;
const CHUNK_DST_IP6: u16 = 0x0006;
const CHUNK_SRC_PORT: u16 = 0x0007;
const CHUNK_DST_PORT: u16 = 0x0008;
const CHUNK_TIMESTAMP_SEC: u16 = 0x0009;
const CHUNK_TIMESTAMP_USEC: u16 = 0x000a;
const CHUNK_PROTO_TYPE: u16 = 0x000b;
const CHUNK_CAPTURE_ID: u16 = 0x000c;
const CHUNK_AUTH_KEY: u16 = 0x000e;
const CHUNK_PAYLOAD: u16 = 0x000f;

const IPPROTO_UDP: u8 = 17;
const IPPROTO_TCP: u8 = 6;

/// One decoded HEP datagram: addressing, timing, and the embedded SIP payload.
#[derive(Debug, Clone)]
pub struct HepMessage {
    pub src: Address,
    pub dst: Address,
    pub transport: u8,
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub capture_id: u32,
    pub payload: Vec<u8>,
}

const HEP2_FAMILY_INET: u8 = 2;
/// `family`(1) + `transport`(1) + ports(4) + IPv4 addrs(8) + the 12-byte
/// sec/usec/capture-id timestamp block(12).
const HEP2_HEADER_LEN: usize = 1 + 1 + 4 + 8 + 12;
/// `version`(1) + `length`(2) + the rest of the fixed header.
const HEP2_FIXED_LEN: usize = 1 + 2 + HEP2_HEADER_LEN;

/// Encodes a HEP2 datagram: a fixed header (version, total length, address
/// family, transport, ports, IPv4 addresses, and a 12-byte sec/usec/
/// capture-id timestamp block) followed by the payload bytes verbatim. HEP2
/// only carries IPv4 endpoints; IPv6 sources fall back to HEP3.
pub fn encode_v2(msg: &HepMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEP2_FIXED_LEN + msg.payload.len());
    let total_len = (HEP2_FIXED_LEN + msg.payload.len()) as u16;
    out.push(2); // version
    out.extend_from_slice(&total_len.to_be_bytes());
    out.push(HEP2_FAMILY_INET);
    out.push(msg.transport);
    out.extend_from_slice(&(msg.src.port).to_be_bytes());
    out.extend_from_slice(&(msg.dst.port).to_be_bytes());
    let src_ip: std::net::Ipv4Addr = msg.src.ip.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
    let dst_ip: std::net::Ipv4Addr = msg.dst.ip.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
    out.extend_from_slice(&src_ip.octets());
    out.extend_from_slice(&dst_ip.octets());
    out.extend_from_slice(&msg.ts_sec.to_be_bytes());
    out.extend_from_slice(&msg.ts_usec.to_be_bytes());
    out.extend_from_slice(&msg.capture_id.to_be_bytes());
    out.extend_from_slice(&msg.payload);
    out
}

pub fn decode_v2(buf: &[u8]) -> Option<HepMessage> {
    if buf.len() < HEP2_FIXED_LEN || buf[0] != 2 {
        return None;
    }
    let length = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if length > buf.len() {
        return None;
    }
    let family = buf[3];
    if family != HEP2_FAMILY_INET {
        return None;
    }
    let transport = buf[4];
    let src_port = u16::from_be_bytes([buf[5], buf[6]]);
    let dst_port = u16::from_be_bytes([buf[7], buf[8]]);
    let src_ip = std::net::Ipv4Addr::new(buf[9], buf[10], buf[11], buf[12]);
    let dst_ip = std::net::Ipv4Addr::new(buf[13], buf[14], buf[15], buf[16]);
    let ts_sec = u32::from_be_bytes([buf[17], buf[18], buf[19], buf[20]]);
    let ts_usec = u32::from_be_bytes([buf[21], buf[22], buf[23], buf[24]]);
    let capture_id = u32::from_be_bytes([buf[25], buf[26], buf[27], buf[28]]);
    Some(HepMessage {
        src: Address::new(src_ip.to_string(), src_port),
        dst: Address::new(dst_ip.to_string(), dst_port),
        transport,
        ts_sec,
        ts_usec,
        capture_id,
        payload: buf[HEP2_FIXED_LEN..length].to_vec(),
    })
}

fn push_chunk(out: &mut Vec<u8>, vendor_id: u16, type_id: u16, data: &[u8]) {
    out.extend_from_slice(&vendor_id.to_be_bytes());
    out.extend_from_slice(&type_id.to_be_bytes());
    out.extend_from_slice(&((data.len() + 6) as u16).to_be_bytes());
    out.extend_from_slice(data);
}

/// Encodes a HEP3 datagram as a chunk stream prefixed by the magic and the
/// overall length.
pub fn encode_v3(msg: &HepMessage, auth_key: Option<&str>) -> Vec<u8> {
    let mut chunks = Vec::new();
    let is_v6 = msg.src.ip.contains(':');
    push_chunk(&mut chunks, 0, CHUNK_IP_FAMILY, &[if is_v6 { 10 } else { 2 }]);
    push_chunk(&mut chunks, 0, CHUNK_IP_PROTO, &[msg.transport]);

    if is_v6 {
        let src: std::net::Ipv6Addr = msg.src.ip.parse().unwrap_or(std::net::Ipv6Addr::UNSPECIFIED);
        let dst: std::net::Ipv6Addr = msg.dst.ip.parse().unwrap_or(std::net::Ipv6Addr::UNSPECIFIED);
        push_chunk(&mut chunks, 0, CHUNK_SRC_IP6, &src.octets());
        push_chunk(&mut chunks, 0, CHUNK_DST_IP6, &dst.octets());
    } else {
        let src: std::net::Ipv4Addr = msg.src.ip.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        let dst: std::net::Ipv4Addr = msg.dst.ip.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        push_chunk(&mut chunks, 0, CHUNK_SRC_IP4, &src.octets());
        push_chunk(&mut chunks, 0, CHUNK_DST_IP4, &dst.octets());
    }
    push_chunk(&mut chunks, 0, CHUNK_SRC_PORT, &msg.src.port.to_be_bytes());
    push_chunk(&mut chunks, 0, CHUNK_DST_PORT, &msg.dst.port.to_be_bytes());
    push_chunk(&mut chunks, 0, CHUNK_TIMESTAMP_SEC, &msg.ts_sec.to_be_bytes());
    push_chunk(&mut chunks, 0, CHUNK_TIMESTAMP_USEC, &msg.ts_usec.to_be_bytes());
    push_chunk(&mut chunks, 0, CHUNK_PROTO_TYPE, &[1]); // SIP
    push_chunk(&mut chunks, 0, CHUNK_CAPTURE_ID, &msg.capture_id.to_be_bytes());
    if let Some(key) = auth_key {
        push_chunk(&mut chunks, 0, CHUNK_AUTH_KEY, key.as_bytes());
    }
    push_chunk(&mut chunks, 0, CHUNK_PAYLOAD, &msg.payload);

    let mut out = Vec::with_capacity(8 + chunks.len());
    out.extend_from_slice(HEP3_MAGIC);
    out.extend_from_slice(&((8 + chunks.len()) as u16).to_be_bytes());
    out.extend_from_slice(&chunks);
    out
}

/// Decodes a HEP3 chunk stream. `expected_auth_key` is checked against the
/// AUTH_KEY chunk when present; a mismatch rejects the datagram
/// (SPEC_FULL.md §4.6 "optional auth-key validation").
pub fn decode_v3(buf: &[u8], expected_auth_key: Option<&str>) -> Option<HepMessage> {
    if buf.len() < 6 || &buf[..4] != HEP3_MAGIC {
        return None;
    }
    let total_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if total_len > buf.len() {
        return None;
    }

    let mut src_ip = None;
    let mut dst_ip = None;
    let mut src_port = 0u16;
    let mut dst_port = 0u16;
    let mut transport = IPPROTO_UDP;
    let mut ts_sec = 0u32;
    let mut ts_usec = 0u32;
    let mut capture_id = 0u32;
    let mut payload = Vec::new();
    let mut auth_key_seen: Option<String> = None;

    let mut pos = 6usize;
    while pos + 6 <= total_len {
        let _vendor_id = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let type_id = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
        let chunk_len = u16::from_be_bytes([buf[pos + 4], buf[pos + 5]]) as usize;
        if chunk_len < 6 || pos + chunk_len > total_len {
            return None;
        }
        let data = &buf[pos + 6..pos + chunk_len];
        match type_id {
            CHUNK_SRC_IP4 if data.len() == 4 => src_ip = Some(std::net::Ipv4Addr::new(data[0], data[1], data[2], data[3]).to_string()),
            CHUNK_DST_IP4 if data.len() == 4 => dst_ip = Some(std::net::Ipv4Addr::new(data[0], data[1], data[2], data[3]).to_string()),
            CHUNK_SRC_IP6 if data.len() == 16 => src_ip = Some(ipv6_from(data).to_string()),
            CHUNK_DST_IP6 if data.len() == 16 => dst_ip = Some(ipv6_from(data).to_string()),
            CHUNK_SRC_PORT if data.len() == 2 => src_port = u16::from_be_bytes([data[0], data[1]]),
            CHUNK_DST_PORT if data.len() == 2 => dst_port = u16::from_be_bytes([data[0], data[1]]),
            CHUNK_IP_PROTO if data.len() == 1 => transport = data[0],
            CHUNK_TIMESTAMP_SEC if data.len() == 4 => ts_sec = u32::from_be_bytes(data.try_into().unwrap()),
            CHUNK_TIMESTAMP_USEC if data.len() == 4 => ts_usec = u32::from_be_bytes(data.try_into().unwrap()),
            CHUNK_CAPTURE_ID if data.len() == 4 => capture_id = u32::from_be_bytes(data.try_into().unwrap()),
            CHUNK_AUTH_KEY => auth_key_seen = String::from_utf8(data.to_vec()).ok(),
            CHUNK_PAYLOAD => payload = data.to_vec(),
            _ => {}
        }
        pos += chunk_len;
    }

    if let Some(expected) = expected_auth_key {
        if auth_key_seen.as_deref() != Some(expected) {
            return None;
        }
    }

    Some(HepMessage {
        src: Address::new(src_ip?, src_port),
        dst: Address::new(dst_ip?, dst_port),
        transport,
        ts_sec,
        ts_usec,
        capture_id,
        payload,
    })
}

fn ipv6_from(b: &[u8]) -> std::net::Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(b);
    std::net::Ipv6Addr::from(octets)
}

/// `true` if `transport` is a protocol HEP should forward at all; non-SIP
/// transports (bare RTP/RTCP) are filtered out before encoding
/// (SPEC_FULL.md §4.6 "SIP-only sender filter").
pub fn is_sip_transport(transport: u8) -> bool {
    matches!(transport, IPPROTO_UDP | IPPROTO_TCP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HepMessage {
        HepMessage {
            src: Address::new("192.168.1.1", 5060),
            dst: Address::new("192.168.1.2", 5060),
            transport: IPPROTO_UDP,
            ts_sec: 1_700_000_000,
            ts_usec: 123,
            capture_id: 7,
            payload: b"INVITE sip:x SIP/2.0\r\n\r\n".to_vec(),
        }
    }

    #[test]
    fn test_hep2_round_trip() {
        let msg = sample();
        let encoded = encode_v2(&msg);
        let decoded = decode_v2(&encoded).unwrap();
        assert_eq!(decoded.src.ip, msg.src.ip);
        assert_eq!(decoded.dst.port, msg.dst.port);
        assert_eq!(decoded.payload, msg.payload);
        assert_eq!(decoded.capture_id, msg.capture_id);
    }

    #[test]
    fn test_hep2_rejects_non_inet_family() {
        let mut encoded = encode_v2(&sample());
        encoded[3] = 10; // family byte, claims IPv6
        assert!(decode_v2(&encoded).is_none());
    }

    #[test]
    fn test_hep3_round_trip_without_auth() {
        let msg = sample();
        let encoded = encode_v3(&msg, None);
        let decoded = decode_v3(&encoded, None).unwrap();
        assert_eq!(decoded.src.ip, msg.src.ip);
        assert_eq!(decoded.dst.port, msg.dst.port);
        assert_eq!(decoded.payload, msg.payload);
        assert_eq!(decoded.capture_id, msg.capture_id);
    }

    #[test]
    fn test_hep3_auth_key_mismatch_rejected() {
        let msg = sample();
        let encoded = encode_v3(&msg, Some("correct-key"));
        assert!(decode_v3(&encoded, Some("wrong-key")).is_none());
        assert!(decode_v3(&encoded, Some("correct-key")).is_some());
    }

    #[test]
    fn test_hep2_rejects_wrong_version_byte() {
        let mut encoded = encode_v2(&sample());
        encoded[0] = 3;
        assert!(decode_v2(&encoded).is_none());
    }

    #[test]
    fn test_hep3_rejects_bad_magic() {
        let mut encoded = encode_v3(&sample(), None);
        encoded[0] = b'X';
        assert!(decode_v3(&encoded, None).is_none());
    }
}
