//! SDP body extraction: the `m=`/`c=` lines that announce RTP endpoints.
//!
//! Grounded in SPEC_FULL.md §4.8's description of the RTP classifier's
//! dependency on SDP-announced endpoints; the original source's SDP
//! handling lives inline in `packet_sip.c` rather than a standalone file,
//! so this module is a small single-purpose parser rather than a
//! line-for-line port.

/// One `m=` media line's announced endpoint and codec list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaOffer {
    pub media_type: String,
    pub ip: String,
    pub port: u16,
    pub formats: Vec<u8>,
}

/// Parsed subset of an SDP body relevant to stream classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpInfo {
    pub session_ip: Option<String>,
    pub media: Vec<MediaOffer>,
}

/// Extracts session- and media-level connection info from an SDP body.
/// Unparseable lines are skipped rather than failing the whole body: a
/// malformed `a=` line shouldn't hide a perfectly good `m=`/`c=` pair.
pub fn extract(body: &[u8]) -> SdpInfo {
    let Ok(text) = std::str::from_utf8(body) else { return SdpInfo::default() };
    let mut info = SdpInfo::default();
    let mut pending_media: Option<(String, u16, Vec<u8>)> = None;
    let mut pending_ip: Option<String> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("c=") {
            if let Some(ip) = parse_connection_line(rest) {
                if pending_media.is_some() {
                    pending_ip = Some(ip);
                } else {
                    info.session_ip = Some(ip);
                }
            }
        } else if let Some(rest) = line.strip_prefix("m=") {
            if let Some((media_type, port, formats)) = pending_media.take() {
                info.media.push(MediaOffer {
                    media_type,
                    ip: pending_ip.take().or_else(|| info.session_ip.clone()).unwrap_or_default(),
                    port,
                    formats,
                });
            }
            pending_media = parse_media_line(rest);
        }
    }
    if let Some((media_type, port, formats)) = pending_media {
        info.media.push(MediaOffer {
            media_type,
            ip: pending_ip.or_else(|| info.session_ip.clone()).unwrap_or_default(),
            port,
            formats,
        });
    }
    info
}

fn parse_connection_line(rest: &str) -> Option<String> {
    // "IN IP4 203.0.113.5" or "IN IP6 ::1"
    let mut parts = rest.split_whitespace();
    parts.next()?; // nettype
    parts.next()?; // addrtype
    parts.next().map(|s| s.to_string())
}

fn parse_media_line(rest: &str) -> Option<(String, u16, Vec<u8>)> {
    // "audio 49170 RTP/AVP 0 8 101"
    let mut parts = rest.split_whitespace();
    let media_type = parts.next()?.to_string();
    let port: u16 = parts.next()?.parse().ok()?;
    parts.next()?; // proto
    let formats = parts.filter_map(|p| p.parse::<u8>().ok()).collect();
    Some((media_type, port, formats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_media_line_inherits_session_connection() {
        let body = b"v=0\r\no=- 1 1 IN IP4 203.0.113.5\r\nc=IN IP4 203.0.113.5\r\nm=audio 49170 RTP/AVP 0 8\r\n";
        let info = extract(body);
        assert_eq!(info.media.len(), 1);
        assert_eq!(info.media[0].ip, "203.0.113.5");
        assert_eq!(info.media[0].port, 49170);
        assert_eq!(info.media[0].formats, vec![0, 8]);
    }

    #[test]
    fn test_media_level_connection_overrides_session_level() {
        let body = b"c=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 0\r\nc=IN IP4 10.0.0.2\r\nm=video 4002 RTP/AVP 99\r\n";
        let info = extract(body);
        assert_eq!(info.media[0].ip, "10.0.0.1");
        assert_eq!(info.media[1].ip, "10.0.0.2");
    }

    #[test]
    fn test_no_media_lines_yields_empty_list() {
        let info = extract(b"v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\n");
        assert!(info.media.is_empty());
    }

    #[test]
    fn test_non_utf8_body_yields_default() {
        let info = extract(&[0xff, 0xfe, 0x00]);
        assert!(info.media.is_empty());
    }
}
