//! TLS record-layer reassembly and passive decryption via a loaded RSA
//! private key.
//!
//! Grounded in `packet_tls.c`: per-connection state tracks the handshake
//! (ClientHello → ServerHello → ClientKeyExchange → ChangeCipherSpec on
//! each side) until both the PreMasterSecret and both randoms are known,
//! derives the key block, and from then on decrypts `application_data`
//! records. SSLv2 ClientHellos are detected and rejected outright, matching
//! the source's narrower scope (TLS 1.0-1.2 only).

mod crypto;

use std::collections::HashMap;

use crate::config::MAX_CAPTURE_LENGTH;
use crate::error::{CoreError, TlsKeyErrorKind};
use crypto::{KeyMaterial, TlsVersion};

const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
const CONTENT_ALERT: u8 = 21;
const CONTENT_HANDSHAKE: u8 = 22;
const CONTENT_APPLICATION_DATA: u8 = 23;

const HS_CLIENT_HELLO: u8 = 1;
const HS_SERVER_HELLO: u8 = 2;
const HS_CLIENT_KEY_EXCHANGE: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherKind {
    Aes128CbcSha,
    Aes256CbcSha,
    Aes256GcmSha384,
}

impl CipherKind {
    fn from_suite(suite: u16) -> Option<Self> {
        match suite {
            0x002f => Some(Self::Aes128CbcSha),
            0x0035 => Some(Self::Aes256CbcSha),
            0x009d => Some(Self::Aes256GcmSha384),
            _ => None,
        }
    }

    fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128CbcSha => 16,
            CipherKind::Aes256CbcSha | CipherKind::Aes256GcmSha384 => 32,
        }
    }

    fn mac_len(self) -> usize {
        match self {
            CipherKind::Aes128CbcSha | CipherKind::Aes256CbcSha => 20,
            CipherKind::Aes256GcmSha384 => 0,
        }
    }

    fn iv_len(self) -> usize {
        match self {
            CipherKind::Aes128CbcSha | CipherKind::Aes256CbcSha => 16,
            CipherKind::Aes256GcmSha384 => 4,
        }
    }

    fn is_gcm(self) -> bool {
        matches!(self, CipherKind::Aes256GcmSha384)
    }

    /// Whether this suite's PRF (and thus its handshake-derived key
    /// material) uses SHA-384 instead of the default SHA-256 (RFC 5289).
    fn uses_sha384_prf(self) -> bool {
        matches!(self, CipherKind::Aes256GcmSha384)
    }
}

#[derive(Default)]
enum HandshakeState {
    #[default]
    WaitClientHello,
    WaitServerHello,
    WaitKeyExchange,
    WaitChangeCipherSpec,
    Established,
    Failed,
}

struct Connection {
    state: HandshakeState,
    version: TlsVersion,
    cipher: Option<CipherKind>,
    client_random: Option<[u8; 32]>,
    server_random: Option<[u8; 32]>,
    encrypted_pms: Option<Vec<u8>>,
    keys: Option<KeyMaterial>,
    client_encrypted: bool,
    server_encrypted: bool,
    /// Per-record reassembly buffer for each direction, since a TLS record
    /// can span multiple TCP segments.
    client_buf: Vec<u8>,
    server_buf: Vec<u8>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            state: HandshakeState::default(),
            version: TlsVersion::Tls12,
            cipher: None,
            client_random: None,
            server_random: None,
            encrypted_pms: None,
            keys: None,
            client_encrypted: false,
            server_encrypted: false,
            client_buf: Vec::new(),
            server_buf: Vec::new(),
        }
    }
}

/// Per-CaptureInput table of TLS connections keyed by the TCP 4-tuple, plus
/// the RSA private key used to decrypt PreMasterSecrets.
pub struct TlsConnectionTable {
    connections: HashMap<(String, u16, String, u16), Connection>,
    private_key: Option<rsa::RsaPrivateKey>,
}

impl TlsConnectionTable {
    pub fn new() -> Self {
        Self { connections: HashMap::new(), private_key: None }
    }

    /// Loads the RSA private key used to decrypt PreMasterSecrets from a PEM
    /// file. Mirrors SPEC_FULL.md §7's `TlsKeyErrorKind` taxonomy: an empty
    /// file, an unparseable key, or a non-RSA key are each reported
    /// distinctly rather than collapsed into one generic error.
    pub fn load_key_file(&mut self, path: &std::path::Path) -> Result<(), CoreError> {
        let pem = std::fs::read_to_string(path).map_err(|e| CoreError::TlsKeyError {
            kind: TlsKeyErrorKind::KeyLoadFail,
            detail: e.to_string(),
            path: Some(path.to_path_buf()),
        })?;
        if pem.trim().is_empty() {
            return Err(CoreError::TlsKeyError {
                kind: TlsKeyErrorKind::KeyfileEmpty,
                detail: "key file contains no data".into(),
                path: Some(path.to_path_buf()),
            });
        }
        let key = crypto::load_private_key_pem(&pem).ok_or_else(|| CoreError::TlsKeyError {
            kind: TlsKeyErrorKind::WrongAlgo,
            detail: "expected a PKCS#1 or PKCS#8 RSA private key".into(),
            path: Some(path.to_path_buf()),
        })?;
        self.private_key = Some(key);
        Ok(())
    }

    /// Feeds one TCP segment's payload through the TLS record layer for the
    /// given 4-tuple and direction. Returns the plaintext of the last
    /// complete `application_data` record decoded from this call
    /// (SPEC_FULL.md §9.1: a segment carrying several records forwards only
    /// the final one's plaintext).
    pub fn process_segment(
        &mut self,
        key: (String, u16, String, u16),
        direction: Direction,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let conn = self.connections.entry(key).or_default();
        let buf = match direction {
            Direction::Client => &mut conn.client_buf,
            Direction::Server => &mut conn.server_buf,
        };
        buf.extend_from_slice(payload);
        if buf.len() > MAX_CAPTURE_LENGTH {
            buf.clear();
            return None;
        }

        let mut last_plaintext = None;
        loop {
            let buf_ref = match direction {
                Direction::Client => &conn.client_buf,
                Direction::Server => &conn.server_buf,
            };
            if buf_ref.len() < 5 {
                break;
            }
            if is_sslv2_client_hello(buf_ref) {
                match direction {
                    Direction::Client => conn.client_buf.clear(),
                    Direction::Server => conn.server_buf.clear(),
                }
                break;
            }
            let content_type = buf_ref[0];
            let record_len = u16::from_be_bytes([buf_ref[3], buf_ref[4]]) as usize;
            if buf_ref.len() < 5 + record_len {
                break;
            }
            let record = buf_ref[5..5 + record_len].to_vec();
            match direction {
                Direction::Client => conn.client_buf.drain(..5 + record_len),
                Direction::Server => conn.server_buf.drain(..5 + record_len),
            };

            match content_type {
                CONTENT_HANDSHAKE => handle_handshake(conn, direction, &record, self.private_key.as_ref()),
                CONTENT_CHANGE_CIPHER_SPEC => match direction {
                    Direction::Client => conn.client_encrypted = true,
                    Direction::Server => conn.server_encrypted = true,
                },
                CONTENT_APPLICATION_DATA => {
                    if let Some(plaintext) = decrypt_application_data(conn, direction, &record) {
                        last_plaintext = Some(plaintext);
                    }
                }
                CONTENT_ALERT => {}
                _ => {}
            }
        }
        last_plaintext
    }
}

fn is_sslv2_client_hello(buf: &[u8]) -> bool {
    buf.len() >= 3 && (buf[0] & 0x80) != 0 && buf[2] == 0x01
}

fn handle_handshake(conn: &mut Connection, direction: Direction, record: &[u8], key: Option<&rsa::RsaPrivateKey>) {
    // A handshake record may itself carry several handshake messages back
    // to back; walk them the same way the record layer walks records.
    let mut pos = 0usize;
    while pos + 4 <= record.len() {
        let msg_type = record[pos];
        let len = u32::from_be_bytes([0, record[pos + 1], record[pos + 2], record[pos + 3]]) as usize;
        let body_start = pos + 4;
        if body_start + len > record.len() {
            break;
        }
        let body = &record[body_start..body_start + len];
        match (msg_type, direction) {
            (HS_CLIENT_HELLO, Direction::Client) => parse_client_hello(conn, body),
            (HS_SERVER_HELLO, Direction::Server) => parse_server_hello(conn, body),
            (HS_CLIENT_KEY_EXCHANGE, Direction::Client) => {
                parse_client_key_exchange(conn, body, key);
            }
            _ => {}
        }
        pos = body_start + len;
    }
}

fn parse_client_hello(conn: &mut Connection, body: &[u8]) {
    if body.len() < 34 {
        conn.state = HandshakeState::Failed;
        return;
    }
    let version = (body[0], body[1]);
    conn.version = version_from_wire(version).unwrap_or(TlsVersion::Tls12);
    let mut random = [0u8; 32];
    random.copy_from_slice(&body[2..34]);
    conn.client_random = Some(random);
    conn.state = HandshakeState::WaitServerHello;
}

fn parse_server_hello(conn: &mut Connection, body: &[u8]) {
    if body.len() < 34 + 1 {
        conn.state = HandshakeState::Failed;
        return;
    }
    let version = (body[0], body[1]);
    if let Some(v) = version_from_wire(version) {
        conn.version = v;
    }
    let mut random = [0u8; 32];
    random.copy_from_slice(&body[2..34]);
    conn.server_random = Some(random);

    let session_id_len = body[34] as usize;
    let cipher_off = 35 + session_id_len;
    if body.len() < cipher_off + 2 {
        conn.state = HandshakeState::Failed;
        return;
    }
    let suite = u16::from_be_bytes([body[cipher_off], body[cipher_off + 1]]);
    conn.cipher = CipherKind::from_suite(suite);
    conn.state = HandshakeState::WaitKeyExchange;
}

fn parse_client_key_exchange(conn: &mut Connection, body: &[u8], key: Option<&rsa::RsaPrivateKey>) {
    // RSA key exchange: a 2-byte length prefix followed by the encrypted
    // PreMasterSecret (Diffie-Hellman key exchanges are out of scope per
    // SPEC_FULL.md's RSA-only decryption model).
    if body.len() < 2 {
        conn.state = HandshakeState::Failed;
        return;
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if body.len() < 2 + len {
        conn.state = HandshakeState::Failed;
        return;
    }
    conn.encrypted_pms = Some(body[2..2 + len].to_vec());

    if let (Some(key), Some(encrypted), Some(cr), Some(sr)) =
        (key, conn.encrypted_pms.as_ref(), conn.client_random, conn.server_random)
    {
        if let Some(cipher) = conn.cipher {
            let use_sha384 = cipher.uses_sha384_prf();
            if let Some(pms) = crypto::rsa_decrypt_pms(key, encrypted) {
                let master_secret = crypto::derive_master_secret(conn.version, &pms, &cr, &sr, use_sha384);
                let keys = crypto::derive_key_block(
                    conn.version,
                    &master_secret,
                    &cr,
                    &sr,
                    cipher.mac_len(),
                    cipher.key_len(),
                    cipher.iv_len(),
                    use_sha384,
                );
                conn.keys = Some(keys);
            }
        }
    }
    conn.state = HandshakeState::WaitChangeCipherSpec;
}

fn version_from_wire(v: (u8, u8)) -> Option<TlsVersion> {
    match v {
        (3, 1) => Some(TlsVersion::Tls10),
        (3, 2) => Some(TlsVersion::Tls11),
        (3, 3) => Some(TlsVersion::Tls12),
        _ => None,
    }
}

fn decrypt_application_data(conn: &mut Connection, direction: Direction, record: &[u8]) -> Option<Vec<u8>> {
    let cipher = conn.cipher?;
    let keys = conn.keys.as_ref()?;
    let encrypted = match direction {
        Direction::Client => conn.client_encrypted,
        Direction::Server => conn.server_encrypted,
    };
    if !encrypted {
        return Some(record.to_vec());
    }

    let (key, iv_material) = match direction {
        Direction::Client => (&keys.key_client, &keys.iv_client),
        Direction::Server => (&keys.key_server, &keys.iv_server),
    };

    if cipher.is_gcm() {
        if record.len() < 8 {
            return None;
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&record[..8]);
        crypto::aes_gcm_decrypt(key, iv_material, &nonce, &record[8..])
    } else {
        // TLS >= 1.1 carries an explicit IV as the record's first block.
        if record.len() < 16 {
            return None;
        }
        let (iv, ciphertext) = record.split_at(16);
        let plaintext = crypto::aes_cbc_decrypt(key, iv, ciphertext)?;
        let mac_len = cipher.mac_len();
        if plaintext.len() < mac_len {
            return None;
        }
        Some(plaintext[..plaintext.len() - mac_len].to_vec())
    }
}
