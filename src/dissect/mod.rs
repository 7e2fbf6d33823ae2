//! Per-protocol parsers used by the capture pipeline: IP/TCP reassembly,
//! TLS decryption, WebSocket de-framing, and SIP/SDP/RTP dissection.

pub mod ip;
pub mod rtp;
pub mod sdp;
pub mod sip;
pub mod tcp;
pub mod tls;
pub mod ws;
