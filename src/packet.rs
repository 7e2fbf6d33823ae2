//! Frame: the raw captured unit that flows through the capture pipeline
//! before IP/TCP reassembly.

/// An immutable on-wire frame. Frames are never mutated after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Microseconds since the Unix epoch.
    pub ts_usec: u64,
    /// Effective captured length (after snaplen truncation).
    pub caplen: u32,
    /// Length as seen on the wire before any truncation.
    pub wirelen: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(ts_usec: u64, wirelen: u32, data: Vec<u8>) -> Self {
        let caplen = data.len() as u32;
        Self { ts_usec, caplen, wirelen, data }
    }

    pub fn ts_seconds(&self) -> u64 {
        self.ts_usec / 1_000_000
    }

    pub fn ts_subsecond_usec(&self) -> u64 {
        self.ts_usec % 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_seconds_and_subsecond_split() {
        let f = Frame::new(1_700_000_123_456, 10, b"x".to_vec());
        assert_eq!(f.ts_seconds(), 1_700_000);
        assert_eq!(f.ts_subsecond_usec(), 123_456);
    }

    #[test]
    fn test_new_frame_caplen_matches_data_len() {
        let f = Frame::new(0, 100, vec![1, 2, 3]);
        assert_eq!(f.caplen, 3);
        assert_eq!(f.wirelen, 100);
    }
}
