//! Reliable UDP transport.
//!
//! A small ARQ protocol with a stateless-cookie handshake so the server
//! never allocates session state for a spoofed source:
//!
//!   hello → challenge(cookie) → response(cookie)
//!
//! Handshake packet, 24 bytes: `conv:u32 LE | cmd=0xFF | sub | reserved:u16 |
//! cookie[16]`. Data packets: `conv:u32 | cmd | sub | seq:u32 | len:u16 |
//! payload`. Each request/response is a fresh segment stream; the final
//! segment carries the FIN sub-flag. KCP never goes through a proxy and is
//! mutually exclusive with TLS.

use std::collections::{BTreeMap, HashSet};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::TransportError;
use crate::{Endpoint, Transport, TransportKind, MAX_MESSAGE_LEN};

pub const HANDSHAKE_LEN: usize = 24;
pub const DATA_HEADER_LEN: usize = 12;

pub const CMD_HANDSHAKE: u8 = 0xFF;
pub const CMD_PUSH: u8 = 0x01;
pub const CMD_ACK: u8 = 0x02;

pub const SUB_HELLO: u8 = 0x01;
pub const SUB_CHALLENGE: u8 = 0x02;
pub const SUB_RESPONSE: u8 = 0x03;
/// On a PUSH packet: this segment ends the message.
pub const SUB_FIN: u8 = 0x01;

const WINDOW: usize = 32;

#[derive(Debug, Clone)]
pub struct KcpConfig {
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub retransmit_after: Duration,
    pub mtu_payload: usize,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            retransmit_after: Duration::from_millis(300),
            mtu_payload: 1152,
        }
    }
}

pub fn build_handshake(conv: u32, sub: u8, cookie: &[u8; 16]) -> [u8; HANDSHAKE_LEN] {
    let mut pkt = [0u8; HANDSHAKE_LEN];
    pkt[..4].copy_from_slice(&conv.to_le_bytes());
    pkt[4] = CMD_HANDSHAKE;
    pkt[5] = sub;
    pkt[8..].copy_from_slice(cookie);
    pkt
}

pub fn parse_handshake(pkt: &[u8]) -> Option<(u32, u8, [u8; 16])> {
    if pkt.len() != HANDSHAKE_LEN || pkt[4] != CMD_HANDSHAKE {
        return None;
    }
    let conv = u32::from_le_bytes(pkt[..4].try_into().expect("len"));
    let cookie: [u8; 16] = pkt[8..].try_into().expect("len");
    Some((conv, pkt[5], cookie))
}

pub fn build_data(conv: u32, cmd: u8, sub: u8, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
    pkt.extend_from_slice(&conv.to_le_bytes());
    pkt.push(cmd);
    pkt.push(sub);
    pkt.extend_from_slice(&seq.to_le_bytes());
    pkt.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

pub fn parse_data(pkt: &[u8]) -> Option<(u32, u8, u8, u32, &[u8])> {
    if pkt.len() < DATA_HEADER_LEN {
        return None;
    }
    let conv = u32::from_le_bytes(pkt[..4].try_into().expect("len"));
    let cmd = pkt[4];
    let sub = pkt[5];
    let seq = u32::from_le_bytes(pkt[6..10].try_into().expect("len"));
    let len = u16::from_le_bytes(pkt[10..12].try_into().expect("len")) as usize;
    if pkt.len() != DATA_HEADER_LEN + len {
        return None;
    }
    Some((conv, cmd, sub, seq, &pkt[DATA_HEADER_LEN..]))
}

struct Session {
    socket: UdpSocket,
    conv: u32,
    last_used: Instant,
}

pub struct KcpTransport {
    endpoint: Endpoint,
    config: KcpConfig,
    session: Mutex<Option<Session>>,
}

impl KcpTransport {
    pub fn new(endpoint: Endpoint, config: KcpConfig) -> Self {
        Self {
            endpoint,
            config,
            session: Mutex::new(None),
        }
    }

    fn handshake(&self) -> Result<Session, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket
            .connect((self.endpoint.host.as_str(), self.endpoint.port))
            .map_err(|_| TransportError::Dns(self.endpoint.key()))?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        let hello = build_handshake(0, SUB_HELLO, &[0u8; 16]);
        let mut buf = [0u8; 2048];
        for attempt in 0..4 {
            socket.send(&hello)?;
            match socket.recv(&mut buf) {
                Ok(n) => {
                    if let Some((conv, SUB_CHALLENGE, cookie)) = parse_handshake(&buf[..n]) {
                        let response = build_handshake(conv, SUB_RESPONSE, &cookie);
                        socket.send(&response)?;
                        debug!(endpoint = %self.endpoint, conv, "kcp session established");
                        return Ok(Session {
                            socket,
                            conv,
                            last_used: Instant::now(),
                        });
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    debug!(attempt, "kcp hello timed out, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TransportError::Timeout)
    }

    /// Push the request segments until all are acked. Response segments can
    /// start arriving while acks are still outstanding; they are collected
    /// into `early` instead of being dropped.
    fn send_stream(
        &self,
        session: &Session,
        request: &[u8],
        deadline: Instant,
        early: &mut Vec<(u8, u32, Vec<u8>)>,
    ) -> Result<(), TransportError> {
        let chunks: Vec<&[u8]> = if request.is_empty() {
            vec![&[]]
        } else {
            request.chunks(self.config.mtu_payload).collect()
        };
        let total = chunks.len();
        let mut unacked: HashSet<u32> = (0..total as u32).collect();
        let mut last_send = Instant::now() - self.config.retransmit_after;
        let mut buf = [0u8; 2048];

        while !unacked.is_empty() {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            if last_send.elapsed() >= self.config.retransmit_after {
                // (re)send up to WINDOW outstanding segments, lowest first
                let mut pending: Vec<u32> = unacked.iter().copied().collect();
                pending.sort_unstable();
                for &seq in pending.iter().take(WINDOW) {
                    let idx = seq as usize;
                    let sub = if idx + 1 == total { SUB_FIN } else { 0 };
                    let pkt = build_data(session.conv, CMD_PUSH, sub, seq, chunks[idx]);
                    session.socket.send(&pkt)?;
                }
                last_send = Instant::now();
            }
            session
                .socket
                .set_read_timeout(Some(self.config.retransmit_after))?;
            match session.socket.recv(&mut buf) {
                Ok(n) => match parse_data(&buf[..n]) {
                    Some((conv, CMD_ACK, _, seq, _)) if conv == session.conv => {
                        unacked.remove(&seq);
                    }
                    Some((conv, CMD_PUSH, sub, seq, payload)) if conv == session.conv => {
                        let ack = build_data(session.conv, CMD_ACK, 0, seq, &[]);
                        session.socket.send(&ack)?;
                        early.push((sub, seq, payload.to_vec()));
                    }
                    _ => {}
                },
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn recv_stream(
        &self,
        session: &Session,
        deadline: Instant,
        early: Vec<(u8, u32, Vec<u8>)>,
    ) -> Result<Vec<u8>, TransportError> {
        let mut segments: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut fin_seq: Option<u32> = None;
        let mut buf = [0u8; 2048];
        let mut received = 0usize;

        for (sub, seq, payload) in early {
            received += payload.len();
            segments.insert(seq, payload);
            if sub & SUB_FIN != 0 {
                fin_seq = Some(seq);
            }
        }

        loop {
            if let Some(fin) = fin_seq {
                if (0..=fin).all(|s| segments.contains_key(&s)) {
                    let mut out = Vec::with_capacity(received);
                    for (_, seg) in segments {
                        out.extend_from_slice(&seg);
                    }
                    return Ok(out);
                }
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            session
                .socket
                .set_read_timeout(Some(self.config.retransmit_after))?;
            match session.socket.recv(&mut buf) {
                Ok(n) => {
                    if let Some((conv, CMD_PUSH, sub, seq, payload)) = parse_data(&buf[..n]) {
                        if conv != session.conv {
                            continue;
                        }
                        // ack every push, duplicates included
                        let ack = build_data(session.conv, CMD_ACK, 0, seq, &[]);
                        session.socket.send(&ack)?;
                        if !segments.contains_key(&seq) {
                            received += payload.len();
                            if received > MAX_MESSAGE_LEN {
                                return Err(TransportError::Oversize(received));
                            }
                            segments.insert(seq, payload.to_vec());
                        }
                        if sub & SUB_FIN != 0 {
                            fin_seq = Some(seq);
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for KcpTransport {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if request.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::Oversize(request.len()));
        }
        let mut guard = self.session.lock();
        let stale = guard
            .as_ref()
            .map(|s| s.last_used.elapsed() > self.config.idle_timeout)
            .unwrap_or(true);
        if stale {
            *guard = Some(self.handshake()?);
        }
        let deadline = Instant::now() + self.config.request_timeout;
        let result = {
            let session = guard.as_mut().expect("just set");
            session.last_used = Instant::now();
            let mut early = Vec::new();
            self.send_stream(session, request, deadline, &mut early)
                .and_then(|()| self.recv_stream(session, deadline, early))
        };
        if result.is_err() {
            *guard = None;
        }
        result
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Kcp
    }

    fn reset(&self) {
        *self.session.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Minimal in-test relay speaking the same protocol: cookie handshake,
    /// per-segment acks, echoes each message back with an `echo:` prefix.
    fn spawn_relay(drop_first_push: bool) -> Endpoint {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        thread::spawn(move || {
            let conv = 7u32;
            let cookie = [0xC0u8; 16];
            let mut buf = [0u8; 2048];
            let mut segments: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
            let mut fin: Option<u32> = None;
            let mut dropped_once = !drop_first_push;
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf) else {
                    return;
                };
                if let Some((_, sub, _cookie)) = parse_handshake(&buf[..n]).map(|(c, s, k)| (c, s, k))
                {
                    if sub == SUB_HELLO {
                        let challenge = build_handshake(conv, SUB_CHALLENGE, &cookie);
                        socket.send_to(&challenge, peer).unwrap();
                    }
                    continue;
                }
                if let Some((c, CMD_PUSH, sub, seq, payload)) = parse_data(&buf[..n]) {
                    if c != conv {
                        continue;
                    }
                    if !dropped_once {
                        dropped_once = true;
                        continue; // simulate loss; client must retransmit
                    }
                    socket
                        .send_to(&build_data(conv, CMD_ACK, 0, seq, &[]), peer)
                        .unwrap();
                    segments.insert(seq, payload.to_vec());
                    if sub & SUB_FIN != 0 {
                        fin = Some(seq);
                    }
                    if let Some(f) = fin {
                        if (0..=f).all(|s| segments.contains_key(&s)) {
                            let mut msg = b"echo:".to_vec();
                            for (_, seg) in std::mem::take(&mut segments) {
                                msg.extend_from_slice(&seg);
                            }
                            fin = None;
                            // reply as a segment stream (single segment here)
                            let reply = build_data(conv, CMD_PUSH, SUB_FIN, 0, &msg);
                            socket.send_to(&reply, peer).unwrap();
                        }
                    }
                }
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    #[test]
    fn handshake_packet_roundtrip() {
        let pkt = build_handshake(42, SUB_CHALLENGE, &[9u8; 16]);
        assert_eq!(pkt.len(), HANDSHAKE_LEN);
        let (conv, sub, cookie) = parse_handshake(&pkt).unwrap();
        assert_eq!((conv, sub, cookie), (42, SUB_CHALLENGE, [9u8; 16]));
    }

    #[test]
    fn data_packet_roundtrip() {
        let pkt = build_data(1, CMD_PUSH, SUB_FIN, 5, b"abc");
        let (conv, cmd, sub, seq, payload) = parse_data(&pkt).unwrap();
        assert_eq!((conv, cmd, sub, seq), (1, CMD_PUSH, SUB_FIN, 5));
        assert_eq!(payload, b"abc");
        // truncated length field rejected
        assert!(parse_data(&pkt[..pkt.len() - 1]).is_none());
    }

    #[test]
    fn round_trip_through_relay() {
        let endpoint = spawn_relay(false);
        let transport = KcpTransport::new(endpoint, KcpConfig::default());
        let reply = transport.round_trip(b"ping").unwrap();
        assert_eq!(reply, b"echo:ping");
        // session reuse
        let reply = transport.round_trip(b"pong").unwrap();
        assert_eq!(reply, b"echo:pong");
    }

    #[test]
    fn retransmits_after_loss() {
        let endpoint = spawn_relay(true);
        let mut config = KcpConfig::default();
        config.retransmit_after = Duration::from_millis(50);
        let transport = KcpTransport::new(endpoint, config);
        let reply = transport.round_trip(b"lossy").unwrap();
        assert_eq!(reply, b"echo:lossy");
    }

    #[test]
    fn multi_segment_message() {
        let endpoint = spawn_relay(false);
        let mut config = KcpConfig::default();
        config.mtu_payload = 16;
        let transport = KcpTransport::new(endpoint, config);
        let request = vec![0x5Au8; 100];
        let reply = transport.round_trip(&request).unwrap();
        assert_eq!(&reply[..5], b"echo:");
        assert_eq!(&reply[5..], &request[..]);
    }
}
