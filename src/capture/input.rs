//! CaptureInput: one packet source (live interface, offline pcap, gzip
//! pcap, stdin, or a HEP listener) driven by its own worker thread.
//!
//! Grounded in SPEC_FULL.md §5's cancellation design: a cooperative stop
//! flag polled with a bounded timeout, generalized from one platform
//! backend to any packet source, plus the `pcap`/`flate2` crates' own APIs
//! for the live/offline/gzip cases.

use std::collections::HashMap;
use std::io::Read;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::address::Address;
use crate::config::{CaptureConfig, HepListenerConfig, LIVE_SNAPLEN, POLL_TIMEOUT_MS};
use crate::dissect::ip::{IpDatagram, IpReassembler, LinkType};
use crate::dissect::sdp;
use crate::dissect::sip::{self, ValidatorOutcome};
use crate::dissect::tcp::{flow_key, TcpReassembler};
use crate::dissect::tls::{Direction, TlsConnectionTable};
use crate::dissect::ws;
use crate::dissect::rtp::StreamTable;
use crate::hep;
use crate::packet::Frame;
use crate::storage::{Storage, StreamSnapshot};

use super::output::CaptureOutput;

pub enum CaptureInput {
    Live { device: String, bpf_filter: Option<String> },
    Offline { path: PathBuf },
    OfflineGzip { path: PathBuf },
    Stdin,
    HepListener { config: HepListenerConfig },
}

/// Live-reconfiguration requests a running `CaptureManager` can queue for its
/// workers, polled once per capture-loop iteration (SPEC_FULL.md §4.9): a new
/// BPF filter (live captures only) or a new TLS keyfile (every worker with a
/// `Pipeline`), applied without restarting the manager.
#[derive(Default)]
pub struct PendingReconfig {
    pub bpf_filter: Mutex<Option<String>>,
    pub keyfile: Mutex<Option<PathBuf>>,
}

impl PendingReconfig {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_pending_keyfile(pipeline: &mut Pipeline, pending: &PendingReconfig) {
    let Some(path) = pending.keyfile.lock().expect("keyfile mutex poisoned").take() else { return };
    if let Err(e) = pipeline.tls.load_key_file(&path) {
        tracing::error!("failed to reload TLS keyfile {}: {e}", path.display());
    }
}

/// Per-CaptureInput pipeline state: reassembly tables, the TLS connection
/// table, the RTP/RTCP stream table, and the SDP-announced-endpoint →
/// Call-ID index the classifier needs to attribute a stream to a call.
struct Pipeline {
    ip: IpReassembler,
    tcp: TcpReassembler,
    tls: TlsConnectionTable,
    streams: StreamTable,
    sdp_index: HashMap<(String, u16), String>,
    retransmissions: sip::RetransmissionTracker,
}

impl Pipeline {
    /// Builds a fresh pipeline for one worker, loading the configured RSA
    /// key into the TLS connection table up front so decryption is live from
    /// the first ClientKeyExchange this worker sees.
    fn new(config: &CaptureConfig) -> Self {
        let mut tls = TlsConnectionTable::new();
        if let Some(keyfile) = &config.keyfile {
            if let Err(e) = tls.load_key_file(keyfile) {
                tracing::error!("failed to load TLS keyfile {}: {e}", keyfile.display());
            }
        }
        Self {
            ip: IpReassembler::new(),
            tcp: TcpReassembler::new(),
            tls,
            streams: StreamTable::new(),
            sdp_index: HashMap::new(),
            retransmissions: sip::RetransmissionTracker::new(),
        }
    }
}

/// Entry point run by each capture worker thread.
pub fn run_capture_loop(
    input: CaptureInput,
    shutdown: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    storage: Arc<Storage>,
    output: Arc<Mutex<Option<CaptureOutput>>>,
    include_rtp: bool,
    config: CaptureConfig,
    pending: Arc<PendingReconfig>,
) {
    let mut pipeline = Pipeline::new(&config);

    let result = match input {
        CaptureInput::Live { device, bpf_filter } => run_live(&device, bpf_filter.as_deref(), &shutdown, &paused, &mut pipeline, &storage, &output, include_rtp, &config, &pending),
        CaptureInput::Offline { path } => run_offline_file(&path, &shutdown, &mut pipeline, &storage, &output, include_rtp, &config, &pending),
        CaptureInput::OfflineGzip { path } => run_offline_gzip(&path, &shutdown, &mut pipeline, &storage, &output, include_rtp, &config, &pending),
        CaptureInput::Stdin => run_stdin(&shutdown, &mut pipeline, &storage, &output, include_rtp, &config, &pending),
        CaptureInput::HepListener { config: hep_cfg } => run_hep_listener(&hep_cfg, &shutdown, &storage),
    };

    if let Err(e) = result {
        tracing::error!("capture input exited: {e:#}");
    }
}

fn run_live(
    device: &str,
    bpf_filter: Option<&str>,
    shutdown: &AtomicBool,
    paused: &AtomicBool,
    pipeline: &mut Pipeline,
    storage: &Storage,
    output: &Mutex<Option<CaptureOutput>>,
    include_rtp: bool,
    config: &CaptureConfig,
    pending: &PendingReconfig,
) -> Result<(), crate::error::CoreError> {
    let mut cap = pcap::Capture::from_device(device)
        .map_err(|e| crate::error::CoreError::SourceOpenError(e.to_string()))?
        .promisc(true)
        .snaplen(LIVE_SNAPLEN)
        .timeout(POLL_TIMEOUT_MS)
        .open()
        .map_err(|e| crate::error::CoreError::SourceOpenError(e.to_string()))?;

    if let Some(filter) = bpf_filter {
        let _ = cap.filter(filter, true);
    }
    let link_type = link_type_from_dlt(cap.get_datalink().0 as u32);

    while !shutdown.load(Ordering::Relaxed) {
        if let Some(filter) = pending.bpf_filter.lock().expect("bpf filter mutex poisoned").take() {
            if let Err(e) = cap.filter(&filter, true) {
                tracing::error!("failed to apply updated BPF filter: {e}");
            }
        }
        apply_pending_keyfile(pipeline, pending);

        if paused.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(POLL_TIMEOUT_MS as u64));
            continue;
        }
        match cap.next_packet() {
            Ok(packet) => {
                let frame = Frame::new(
                    packet.header.ts.tv_sec as u64 * 1_000_000 + packet.header.ts.tv_usec as u64,
                    packet.header.len,
                    packet.data.to_vec(),
                );
                if let Some(sink) = output.lock().expect("output mutex poisoned").as_mut() {
                    sink.write_frame(&frame);
                }
                process_frame(link_type, frame, pipeline, storage, include_rtp, config);
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => return Err(crate::error::CoreError::SourceOpenError(e.to_string())),
        }
    }
    Ok(())
}

fn run_offline_file(
    path: &PathBuf,
    shutdown: &AtomicBool,
    pipeline: &mut Pipeline,
    storage: &Storage,
    output: &Mutex<Option<CaptureOutput>>,
    include_rtp: bool,
    config: &CaptureConfig,
    pending: &PendingReconfig,
) -> Result<(), crate::error::CoreError> {
    let file = std::fs::File::open(path)?;
    read_pcap_stream(file, shutdown, pipeline, storage, output, include_rtp, config, pending)
}

fn run_offline_gzip(
    path: &PathBuf,
    shutdown: &AtomicBool,
    pipeline: &mut Pipeline,
    storage: &Storage,
    output: &Mutex<Option<CaptureOutput>>,
    include_rtp: bool,
    config: &CaptureConfig,
    pending: &PendingReconfig,
) -> Result<(), crate::error::CoreError> {
    let file = std::fs::File::open(path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    read_pcap_stream(decoder, shutdown, pipeline, storage, output, include_rtp, config, pending)
}

fn run_stdin(
    shutdown: &AtomicBool,
    pipeline: &mut Pipeline,
    storage: &Storage,
    output: &Mutex<Option<CaptureOutput>>,
    include_rtp: bool,
    config: &CaptureConfig,
    pending: &PendingReconfig,
) -> Result<(), crate::error::CoreError> {
    read_pcap_stream(std::io::stdin(), shutdown, pipeline, storage, output, include_rtp, config, pending)
}

/// Minimal classic-pcap-format reader (global header + record headers),
/// used for the two sources libpcap itself can't read from directly: a
/// gzip-compressed file and stdin.
fn read_pcap_stream<R: Read>(
    mut reader: R,
    shutdown: &AtomicBool,
    pipeline: &mut Pipeline,
    storage: &Storage,
    output: &Mutex<Option<CaptureOutput>>,
    include_rtp: bool,
    config: &CaptureConfig,
    pending: &PendingReconfig,
) -> Result<(), crate::error::CoreError> {
    let mut global = [0u8; 24];
    reader.read_exact(&mut global)?;
    let magic = u32::from_le_bytes([global[0], global[1], global[2], global[3]]);
    let swap_endian = magic == 0xd4c3_b2a1;
    let link_type_raw = read_u32(&global[20..24], swap_endian);
    let link_type = link_type_from_dlt(link_type_raw);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        apply_pending_keyfile(pipeline, pending);
        let mut rec_header = [0u8; 16];
        match reader.read_exact(&mut rec_header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let ts_sec = read_u32(&rec_header[0..4], swap_endian);
        let ts_usec = read_u32(&rec_header[4..8], swap_endian);
        let incl_len = read_u32(&rec_header[8..12], swap_endian) as usize;
        let orig_len = read_u32(&rec_header[12..16], swap_endian);

        let mut data = vec![0u8; incl_len];
        reader.read_exact(&mut data)?;

        let frame = Frame::new(ts_sec as u64 * 1_000_000 + ts_usec as u64, orig_len, data);
        if let Some(sink) = output.lock().expect("output mutex poisoned").as_mut() {
            sink.write_frame(&frame);
        }
        process_frame(link_type, frame, pipeline, storage, include_rtp, config);
    }
}

fn read_u32(b: &[u8], swap: bool) -> u32 {
    let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    if swap { v.swap_bytes() } else { v }
}

fn link_type_from_dlt(dlt: u32) -> LinkType {
    match dlt {
        1 => LinkType::Ethernet,
        0 => LinkType::Loopback,
        113 => LinkType::LinuxSllV1,
        276 => LinkType::LinuxSllV2,
        239 => LinkType::Nflog,
        other => LinkType::Unknown(other),
    }
}

fn run_hep_listener(config: &HepListenerConfig, shutdown: &AtomicBool, storage: &Storage) -> Result<(), crate::error::CoreError> {
    let socket = UdpSocket::bind((config.addr, config.port))?;
    socket.set_read_timeout(Some(std::time::Duration::from_millis(POLL_TIMEOUT_MS as u64)))?;
    let mut buf = vec![0u8; 65536];

    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => {
                let decoded = match config.version {
                    crate::config::HepVersion::V2 => hep::decode_v2(&buf[..len]),
                    crate::config::HepVersion::V3 => hep::decode_v3(&buf[..len], config.password.as_deref()),
                };
                if let Some(msg) = decoded {
                    if let ValidatorOutcome::CompleteSip(_) = sip::validate(&msg.payload) {
                        let parsed = sip::parse(&msg.payload);
                        let _ = storage.record_message(&parsed, msg.src, msg.dst, msg.ts_sec as u64 * 1_000_000 + msg.ts_usec as u64);
                    }
                }
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn parse_udp_header(payload: &[u8]) -> Option<(u16, u16, &[u8])> {
    if payload.len() < 8 {
        return None;
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    Some((src_port, dst_port, &payload[8..]))
}

struct TcpHeaderInfo<'a> {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    psh: bool,
    payload: &'a [u8],
}

fn parse_tcp_header(payload: &[u8]) -> Option<TcpHeaderInfo<'_>> {
    if payload.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let seq = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let data_offset = ((payload[12] >> 4) as usize) * 4;
    let psh = payload[13] & 0x08 != 0;
    if payload.len() < data_offset {
        return None;
    }
    Some(TcpHeaderInfo { src_port, dst_port, seq, psh, payload: &payload[data_offset..] })
}

const PROTO_UDP: u8 = 17;
const PROTO_TCP: u8 = 6;

fn process_frame(link_type: LinkType, frame: Frame, pipeline: &mut Pipeline, storage: &Storage, include_rtp: bool, config: &CaptureConfig) {
    let arrival_usec = frame.ts_usec;
    let Some(datagram) = pipeline.ip.accept(link_type, frame) else { return };
    let IpDatagram { src, dst, transport, payload, .. } = datagram;

    match transport {
        PROTO_UDP => {
            let Some((src_port, dst_port, body)) = parse_udp_header(&payload) else { return };
            let src = Address::new(src.ip, src_port);
            let dst = Address::new(dst.ip, dst_port);
            handle_candidate_message(body, &src, &dst, pipeline, storage, include_rtp, arrival_usec);
        }
        PROTO_TCP => {
            let Some(hdr) = parse_tcp_header(&payload) else { return };
            let src = Address::new(src.ip, hdr.src_port);
            let dst = Address::new(dst.ip, hdr.dst_port);
            let tls_direction = config.tls_server.as_ref().and_then(|ts| {
                if ts.addr_eq(&dst) {
                    Some(Direction::Client)
                } else if ts.addr_eq(&src) {
                    Some(Direction::Server)
                } else {
                    None
                }
            });
            let is_tls_candidate = tls_direction.is_some();

            let key = flow_key(&src, &dst);

            // Key the TLS connection table on the unordered flow tuple so
            // both directions of the same connection land in one entry.
            let segment_payload = tls_direction.map(|direction| {
                let (a, b) = if src.ip <= dst.ip || (src.ip == dst.ip && src.port <= dst.port) {
                    (&src, &dst)
                } else {
                    (&dst, &src)
                };
                let tls_key = (a.ip.clone(), a.port, b.ip.clone(), b.port);
                pipeline.tls.process_segment(tls_key, direction, hdr.payload)
            }).flatten();

            match segment_payload {
                Some(plaintext) => {
                    let messages = pipeline.tcp.accept(key, hdr.seq, hdr.psh, &plaintext);
                    for msg in messages {
                        dispatch_sip_or_rtp(&msg, &src, &dst, pipeline, storage, include_rtp, arrival_usec);
                    }
                }
                None if !is_tls_candidate => {
                    if let Some(unmasked) = ws::try_unmask(hdr.payload) {
                        dispatch_sip_or_rtp(&unmasked, &src, &dst, pipeline, storage, include_rtp, arrival_usec);
                    } else {
                        let messages = pipeline.tcp.accept(key, hdr.seq, hdr.psh, hdr.payload);
                        for msg in messages {
                            dispatch_sip_or_rtp(&msg, &src, &dst, pipeline, storage, include_rtp, arrival_usec);
                        }
                    }
                }
                None => {}
            }
        }
        _ => {}
    }
}

fn handle_candidate_message(body: &[u8], src: &Address, dst: &Address, pipeline: &mut Pipeline, storage: &Storage, include_rtp: bool, arrival_usec: u64) {
    match sip::validate(body) {
        ValidatorOutcome::CompleteSip(_) | ValidatorOutcome::MultipleSip(_) => {
            dispatch_sip_or_rtp(body, src, dst, pipeline, storage, include_rtp, arrival_usec);
        }
        ValidatorOutcome::NotSip => {
            if include_rtp {
                pipeline.streams.ingest(src, dst, body, arrival_usec);
                attribute_stream_to_call(src, dst, pipeline, storage);
            }
        }
    }
}

fn dispatch_sip_or_rtp(buf: &[u8], src: &Address, dst: &Address, pipeline: &mut Pipeline, storage: &Storage, include_rtp: bool, arrival_usec: u64) {
    match sip::validate(buf) {
        ValidatorOutcome::NotSip => {
            if include_rtp {
                pipeline.streams.ingest(src, dst, buf, arrival_usec);
                attribute_stream_to_call(src, dst, pipeline, storage);
            }
        }
        _ => {
            let mut msg = sip::parse(buf);
            pipeline.retransmissions.check(&mut msg);
            if !msg.body.is_empty() {
                let info = sdp::extract(&msg.body);
                if let Some(call_id) = msg.call_id.clone() {
                    for media in &info.media {
                        pipeline.sdp_index.insert((media.ip.clone(), media.port), call_id.clone());
                    }
                }
            }
            let _ = storage.record_message(&msg, src.clone(), dst.clone(), arrival_usec);
        }
    }
}

fn attribute_stream_to_call(src: &Address, dst: &Address, pipeline: &Pipeline, storage: &Storage) {
    let call_id = pipeline
        .sdp_index
        .get(&(dst.ip.clone(), dst.port))
        .or_else(|| pipeline.sdp_index.get(&(src.ip.clone(), src.port)));
    if let Some(call_id) = call_id {
        let key = crate::dissect::rtp::StreamKey::exact(src, dst);
        if let Some(stream) = pipeline.streams.stream(&key) {
            storage.record_stream(
                call_id,
                StreamSnapshot {
                    src: src.clone(),
                    dst: dst.clone(),
                    packet_count: stream.stats.packet_count,
                    rtcp_packet_count: stream.stats.rtcp_packet_count,
                    lost: stream.stats.lost,
                    expected: stream.stats.expected,
                    jitter: stream.stats.jitter,
                    max_jitter: stream.stats.max_jitter,
                    mean_jitter: stream.stats.mean_jitter,
                    max_delta: stream.stats.max_delta,
                    ssrc: stream.stats.ssrc,
                },
            );
        }
    }
}
