//! two phase port negotiation between peers, UDP only
//!
//! The client fires a header-only probe carrying its stream parameters at
//! the server's control port.  The server checks the parameters against its
//! own, binds a fresh ephemeral port, and answers with exactly three bytes:
//! the new port, little endian, 24 bits.  All further traffic runs between
//! the client's source port and that ephemeral port.  A server that cannot
//! take the client (hub full) answers with a zero port, which no client
//! will accept.
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::common::error::SessionError;
use crate::common::packet::{PacketBuffer, StreamParams, HEADER_SIZE};
use crate::net::sock_with_tos;

/// where a server listens for probes unless told otherwise
pub const DEFAULT_CONTROL_PORT: u16 = 4464;
/// the port reply is 24 bits, little endian
pub const PORT_REPLY_SIZE: usize = 3;
/// probe retry cadence while the client waits for a reply
const PROBE_RETRY: Duration = Duration::from_secs(1);

pub fn encode_port_reply(port: u16) -> [u8; PORT_REPLY_SIZE] {
    let mut reply = [0u8; PORT_REPLY_SIZE];
    LittleEndian::write_u24(&mut reply, u32::from(port));
    reply
}

/// decode a reply; None for anything that is not a usable port number
pub fn decode_port_reply(buf: &[u8]) -> Option<u16> {
    if buf.len() != PORT_REPLY_SIZE {
        return None;
    }
    let port = LittleEndian::read_u24(buf);
    if port == 0 || port > u32::from(u16::MAX) {
        return None;
    }
    Some(port as u16)
}

/// bind the first free port at or above `base`.
///
/// Walks a window of ports so a hub can hand each worker its own.
pub fn bind_ephemeral(base: u16, span: u16) -> Result<(UdpSocket, u16), SessionError> {
    for offset in 0..span {
        let port = base.saturating_add(offset);
        if let Ok(sock) = sock_with_tos::new(port) {
            return Ok((sock, port));
        }
    }
    Err(SessionError::BindFailed(base))
}

/// client side: probe the server and wait for the port reply.
///
/// Retries the probe once a second until `n_hs` has elapsed, then gives up
/// with `HandshakeTimeout`.  Returns the peer address to use for the
/// session traffic.
pub fn client_handshake(
    sock: &UdpSocket,
    server: SocketAddr,
    params: &StreamParams,
    n_hs: Duration,
) -> Result<SocketAddr, SessionError> {
    let mut probe = PacketBuffer::new();
    params.fill_header(&mut probe);
    sock.set_read_timeout(Some(PROBE_RETRY))
        .map_err(|e| SessionError::SocketError(e.to_string()))?;
    let deadline = Instant::now() + n_hs;
    let mut reply = [0u8; PORT_REPLY_SIZE];
    while Instant::now() < deadline {
        sock.send_to(probe.get_send_buffer(), server)
            .map_err(|e| SessionError::SocketError(e.to_string()))?;
        match sock.recv_from(&mut reply) {
            Ok((amt, from)) => {
                if from.ip() != server.ip() {
                    continue;
                }
                match decode_port_reply(&reply[..amt]) {
                    Some(port) => {
                        let peer = SocketAddr::new(server.ip(), port);
                        info!("peer moved us to {}", peer);
                        return Ok(peer);
                    }
                    None => {
                        // busy or garbled reply; keep trying until the clock runs out
                        debug!("unusable handshake reply of {} bytes", amt);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(SessionError::SocketError(e.to_string())),
        }
    }
    Err(SessionError::HandshakeTimeout)
}

/// what a valid probe told the server
#[derive(Debug)]
pub struct Probe {
    pub client: SocketAddr,
}

/// server side: wait on the control socket for a compatible probe.
///
/// Incompatible probes are dropped and counted, never answered; their
/// clients are left to time out.  Returns when a compatible probe arrives
/// or `stopping` goes up (then `None`).
pub fn wait_for_probe(
    sock: &UdpSocket,
    params: &StreamParams,
    mismatch_counter: &AtomicU64,
    stopping: &AtomicBool,
) -> Result<Option<Probe>, SessionError> {
    sock.set_read_timeout(Some(Duration::from_millis(250)))
        .map_err(|e| SessionError::SocketError(e.to_string()))?;
    let mut msg = PacketBuffer::new();
    loop {
        if stopping.load(Ordering::Relaxed) {
            return Ok(None);
        }
        match sock.recv_from(msg.get_buffer()) {
            Ok((amt, from)) => {
                if amt < HEADER_SIZE {
                    continue;
                }
                if msg.set_nbytes(amt).is_err() {
                    continue;
                }
                if let Err(what) = params.matches_header(&msg) {
                    mismatch_counter.fetch_add(1, Ordering::Relaxed);
                    warn!("dropping probe from {}: {}", from, what);
                    continue;
                }
                return Ok(Some(Probe { client: from }));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(SessionError::SocketError(e.to_string())),
        }
    }
}

/// server side: answer a probe with the ephemeral port triplet
pub fn send_port_reply(
    sock: &UdpSocket,
    client: SocketAddr,
    port: u16,
) -> Result<(), SessionError> {
    sock.send_to(&encode_port_reply(port), client)
        .map_err(|e| SessionError::SocketError(e.to_string()))?;
    Ok(())
}
