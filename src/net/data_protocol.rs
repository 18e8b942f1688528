//! the two I/O loops of a running session
//!
//! The sender drains the send ring, wraps each payload in a header (plus the
//! previous payloads when redundancy is on), and fires it at the peer.  The
//! receiver blocks on the socket, validates each header against the
//! negotiated parameters, and feeds payloads to the receive ring with
//! duplicate suppression so redundancy fills gaps instead of doubling audio.
//!
//! Both loops run on their own thread and talk to the rest of the session
//! only through the rings, the shared counters, and the event channel.
use log::{debug, info, warn};
use rand::Rng;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::common::box_error::BoxError;
use crate::common::error::SessionError;
use crate::common::packet::{seq_is_newer, PacketBuffer, StreamParams};
use crate::session::SessionEvent;
use crate::sound::ring::{RingConsumer, RingProducer};

/// how long the sender naps when the send ring has nothing for it
const SENDER_IDLE: Duration = Duration::from_micros(200);
/// socket poll granularity on the receive side
const RECV_POLL: Duration = Duration::from_millis(250);
/// consecutive socket failures before the loop gives up
const SOCKET_ERROR_LIMIT: u64 = 1000;
/// misconfigured packets tolerated before a never-heard peer is declared
/// incompatible
const INCOMPATIBLE_LIMIT: u64 = 50;

/// shared counters the supervisor folds into its interval report
pub struct LinkCounters {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_recv: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub seq_gaps: AtomicU64,
    pub out_of_order: AtomicU64,
    pub peer_config_mismatch: AtomicU64,
    pub send_would_block: AtomicU64,
    pub socket_errors: AtomicU64,
}

impl LinkCounters {
    pub fn new() -> LinkCounters {
        LinkCounters {
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_recv: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            seq_gaps: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            peer_config_mismatch: AtomicU64::new(0),
            send_would_block: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
        }
    }
}

impl Default for LinkCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// synthetic network trouble for testing loss recovery without a bad network
#[derive(Debug, Clone, Copy)]
pub struct Impairment {
    /// drop probability per datagram, 0.0 to 1.0
    pub loss: f64,
    /// uniform extra delay in [0, jitter_max]
    pub jitter_max: Duration,
    /// constant extra delay as a fraction of the audio period
    pub delay_rel: f64,
}

/// knobs for the two loops
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// payloads per datagram (1 = no redundancy)
    pub redundancy: usize,
    /// peer silence before PeerTimeout
    pub timeout: Duration,
    /// ask for elevated scheduling on the I/O threads
    pub use_rt_udp_priority: bool,
    pub impairment: Option<Impairment>,
    /// one audio period, used by the impairment delay
    pub period: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        ProtocolOptions {
            redundancy: 1,
            timeout: Duration::from_secs(10),
            use_rt_udp_priority: false,
            impairment: None,
            period: Duration::from_micros(2667),
        }
    }
}

/// drain the send ring onto the wire until told to stop.
///
/// The datagram carries the current payload first, then up to R-1 previous
/// payloads oldest last; the header seq is the newest payload's.
pub fn sender_loop(
    mut ring: RingConsumer,
    sock: UdpSocket,
    peer: SocketAddr,
    params: StreamParams,
    opts: ProtocolOptions,
    counters: Arc<LinkCounters>,
    stopping: Arc<AtomicBool>,
    start: Instant,
) -> Result<(), BoxError> {
    if opts.use_rt_udp_priority {
        // scheduling class changes need privileges we may not have; the
        // host's scheduler gets us close enough when it refuses
        info!("realtime priority requested for the sender thread");
    }
    let payload_len = params.payload_bytes_in();
    let history_len = opts.redundancy.saturating_sub(1);
    let mut history: VecDeque<Vec<u8>> = VecDeque::with_capacity(history_len + 1);
    let mut scratch = vec![0u8; payload_len];
    let mut msg = PacketBuffer::new();
    params.fill_header(&mut msg);
    let mut next_seq: u16 = 0;
    let mut rng = rand::thread_rng();
    let mut consecutive_errors: u64 = 0;

    while !stopping.load(Ordering::Relaxed) {
        if !ring.try_pop(&mut scratch) {
            sleep(SENDER_IDLE);
            continue;
        }
        msg.clear_payloads();
        msg.set_sequence_num(next_seq);
        msg.set_timestamp(start.elapsed().as_millis() as u64);
        msg.push_payload(&scratch)?;
        for prev in &history {
            msg.push_payload(prev)?;
        }
        if history_len > 0 {
            // recycle the oldest buffer instead of allocating
            let mut buf = if history.len() >= history_len {
                history.pop_back().unwrap()
            } else {
                vec![0u8; payload_len]
            };
            buf.copy_from_slice(&scratch);
            history.push_front(buf);
        }
        next_seq = next_seq.wrapping_add(1);

        if let Some(sim) = &opts.impairment {
            if rng.gen::<f64>() < sim.loss {
                // the datagram "left" but the network ate it
                counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if !sim.jitter_max.is_zero() {
                sleep(sim.jitter_max.mul_f64(rng.gen::<f64>()));
            }
            if sim.delay_rel > 0.0 {
                sleep(opts.period.mul_f64(sim.delay_rel));
            }
        }

        match sock.send_to(msg.get_send_buffer(), peer) {
            Ok(n) => {
                counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                consecutive_errors = 0;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                counters.send_would_block.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.socket_errors.fetch_add(1, Ordering::Relaxed);
                consecutive_errors += 1;
                if consecutive_errors > SOCKET_ERROR_LIMIT {
                    return Err(Box::new(SessionError::SocketError(e.to_string())));
                }
            }
        }
    }
    debug!("sender loop done, {} payloads", next_seq);
    Ok(())
}

/// pull datagrams off the socket and feed the receive ring until told to
/// stop.  Sends session events for the first packet, peer timeout, and the
/// peer's exit notice.
pub fn receiver_loop(
    mut ring: RingProducer,
    sock: UdpSocket,
    params: StreamParams,
    opts: ProtocolOptions,
    counters: Arc<LinkCounters>,
    stopping: Arc<AtomicBool>,
    events: mpsc::Sender<SessionEvent>,
    mut broadcast: Option<RingProducer>,
) -> Result<(), BoxError> {
    if opts.use_rt_udp_priority {
        info!("realtime priority requested for the receiver thread");
    }
    sock.set_read_timeout(Some(RECV_POLL))?;
    let payload_len = params.payload_bytes_out();
    let mut msg = PacketBuffer::new();
    let mut last_written: Option<u16> = None;
    let mut last_header: Option<u16> = None;
    let mut heard_from_peer = false;
    let mut silent_since = Instant::now();
    let mut consecutive_errors: u64 = 0;

    while !stopping.load(Ordering::Relaxed) {
        match sock.recv_from(msg.get_buffer()) {
            Ok((amt, _src)) => {
                consecutive_errors = 0;
                if !msg.is_valid(amt) {
                    continue;
                }
                msg.set_nbytes(amt)?;
                if msg.is_exit() {
                    info!("peer sent its exit notice");
                    let _res = events.send(SessionEvent::Ended(SessionError::PeerStopped));
                    return Ok(());
                }
                silent_since = Instant::now();
                if let Err(what) = params.matches_header(&msg) {
                    let seen = counters.peer_config_mismatch.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("dropped packet from misconfigured peer: {}", what);
                    if !heard_from_peer && seen >= INCOMPATIBLE_LIMIT {
                        let _res = events.send(SessionEvent::Ended(
                            SessionError::IncompatiblePeer(what),
                        ));
                        return Ok(());
                    }
                    continue;
                }
                if !heard_from_peer {
                    heard_from_peer = true;
                    let _res = events.send(SessionEvent::FirstPacket);
                }
                counters.packets_recv.fetch_add(1, Ordering::Relaxed);
                counters.bytes_recv.fetch_add(amt as u64, Ordering::Relaxed);

                let newest = msg.get_sequence_num();
                if let Some(last) = last_header {
                    let ahead = newest.wrapping_sub(last);
                    if ahead == 0 || ahead >= 0x8000 {
                        counters.out_of_order.fetch_add(1, Ordering::Relaxed);
                    } else if ahead > 1 {
                        counters
                            .seq_gaps
                            .fetch_add(u64::from(ahead) - 1, Ordering::Relaxed);
                    }
                }
                if last_header.map_or(true, |last| seq_is_newer(newest, last)) {
                    last_header = Some(newest);
                }

                // oldest embedded payload first so the ring stays in order
                let count = msg.payload_count(payload_len);
                for i in (0..count).rev() {
                    let seq = newest.wrapping_sub(i as u16);
                    let fresh = match last_written {
                        None => true,
                        Some(last) => seq_is_newer(seq, last),
                    };
                    if !fresh {
                        continue;
                    }
                    if let Some(payload) = msg.payload(i, payload_len) {
                        ring.push(payload);
                        if i == 0 {
                            if let Some(bcast) = broadcast.as_mut() {
                                bcast.push(payload);
                            }
                        }
                        last_written = Some(seq);
                    }
                }
            }
            Err(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                if heard_from_peer && silent_since.elapsed() > opts.timeout {
                    warn!("peer silent for {:?}", opts.timeout);
                    let _res = events.send(SessionEvent::Ended(SessionError::PeerTimeout));
                    // keep listening; the supervisor decides whether that
                    // ends the session or just gets logged
                    silent_since = Instant::now();
                }
            }
            Err(e) => {
                counters.socket_errors.fetch_add(1, Ordering::Relaxed);
                consecutive_errors += 1;
                if consecutive_errors > SOCKET_ERROR_LIMIT {
                    return Err(Box::new(SessionError::SocketError(e.to_string())));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test_data_protocol {
    use super::*;
    use crate::common::packet::{BitResolution, SampleRateCode};
    use crate::sound::ring::{ring_pair, UnderrunMode};
    use std::thread;

    fn test_params() -> StreamParams {
        StreamParams {
            frames: 4,
            rate: SampleRateCode::Sr48,
            bits: BitResolution::Bit16,
            channels_in: 1,
            channels_out: 1,
        }
    }

    fn loopback_pair() -> (UdpSocket, UdpSocket, SocketAddr) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();
        (a, b, b_addr)
    }

    #[test]
    fn sender_emits_strictly_increasing_seqs() {
        // push 20 payloads through the sender and watch the wire
        let params = test_params();
        let payload_len = params.payload_bytes_in();
        let (sock, peer_sock, peer_addr) = loopback_pair();
        peer_sock
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let (mut prod, cons, _mon) = ring_pair(payload_len, 64, UnderrunMode::Zeros);
        for i in 0..20u8 {
            prod.push(&vec![i; payload_len]);
        }
        let counters = Arc::new(LinkCounters::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = {
            let counters = counters.clone();
            let stopping = stopping.clone();
            let opts = ProtocolOptions::default();
            thread::spawn(move || {
                sender_loop(
                    cons,
                    sock,
                    peer_addr,
                    params,
                    opts,
                    counters,
                    stopping,
                    Instant::now(),
                )
            })
        };
        let mut msg = PacketBuffer::new();
        let mut last_ts = 0u64;
        for expect in 0..20u16 {
            let (amt, _src) = peer_sock.recv_from(msg.get_buffer()).unwrap();
            msg.set_nbytes(amt).unwrap();
            assert_eq!(msg.get_sequence_num(), expect);
            assert!(msg.get_timestamp() >= last_ts);
            last_ts = msg.get_timestamp();
        }
        stopping.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
        assert_eq!(counters.packets_sent.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn redundancy_carries_previous_payloads() {
        let params = test_params();
        let payload_len = params.payload_bytes_in();
        let (sock, peer_sock, peer_addr) = loopback_pair();
        peer_sock
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let (mut prod, cons, _mon) = ring_pair(payload_len, 64, UnderrunMode::Zeros);
        for i in 0..3u8 {
            prod.push(&vec![i + 1; payload_len]);
        }
        let counters = Arc::new(LinkCounters::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = {
            let stopping = stopping.clone();
            let opts = ProtocolOptions {
                redundancy: 2,
                ..ProtocolOptions::default()
            };
            thread::spawn(move || {
                sender_loop(
                    cons,
                    sock,
                    peer_addr,
                    params,
                    opts,
                    counters,
                    stopping,
                    Instant::now(),
                )
            })
        };
        let mut msg = PacketBuffer::new();
        // first datagram has only the current payload
        let (amt, _) = peer_sock.recv_from(msg.get_buffer()).unwrap();
        msg.set_nbytes(amt).unwrap();
        assert_eq!(msg.payload_count(payload_len), 1);
        assert_eq!(msg.payload(0, payload_len).unwrap()[0], 1);
        // from then on: current plus previous
        for seq in 2..=3u8 {
            let (amt, _) = peer_sock.recv_from(msg.get_buffer()).unwrap();
            msg.set_nbytes(amt).unwrap();
            assert_eq!(msg.payload_count(payload_len), 2);
            assert_eq!(msg.payload(0, payload_len).unwrap()[0], seq);
            assert_eq!(msg.payload(1, payload_len).unwrap()[0], seq - 1);
        }
        stopping.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn receiver_fills_gaps_from_redundancy() {
        // R = 2, datagrams 3 and 7 never arrive, payloads 0..=9 still do
        let params = test_params();
        let payload_len = params.payload_bytes_out();
        let (send_sock, recv_sock, recv_addr) = loopback_pair();
        let (prod, mut cons, _mon) = ring_pair(payload_len, 32, UnderrunMode::Zeros);
        let counters = Arc::new(LinkCounters::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel();
        let handle = {
            let counters = counters.clone();
            let stopping = stopping.clone();
            let opts = ProtocolOptions::default();
            thread::spawn(move || {
                receiver_loop(
                    prod, recv_sock, params, opts, counters, stopping, events_tx, None,
                )
            })
        };
        let mut msg = PacketBuffer::new();
        params.fill_header(&mut msg);
        let mut prev: Option<Vec<u8>> = None;
        for seq in 0..10u16 {
            let payload = vec![seq as u8 + 1; payload_len];
            msg.clear_payloads();
            msg.set_sequence_num(seq);
            msg.push_payload(&payload).unwrap();
            if let Some(p) = &prev {
                msg.push_payload(p).unwrap();
            }
            if seq != 3 && seq != 7 {
                send_sock.send_to(msg.get_send_buffer(), recv_addr).unwrap();
                // keep arrival order deterministic
                sleep(Duration::from_millis(5));
            }
            prev = Some(payload);
        }
        sleep(Duration::from_millis(100));
        let mut out = vec![0u8; payload_len];
        for seq in 0..10u16 {
            assert!(cons.try_pop(&mut out), "payload {} missing", seq);
            assert_eq!(out[0], seq as u8 + 1, "wrong payload at {}", seq);
        }
        assert!(!cons.try_pop(&mut out), "extra payloads written");
        assert_eq!(events_rx.try_recv(), Ok(SessionEvent::FirstPacket));
        stopping.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
        assert_eq!(counters.packets_recv.load(Ordering::Relaxed), 8);
        assert_eq!(counters.seq_gaps.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn receiver_drops_misconfigured_peer() {
        let params = test_params();
        let payload_len = params.payload_bytes_out();
        let (send_sock, recv_sock, recv_addr) = loopback_pair();
        let (prod, mut cons, _mon) = ring_pair(payload_len, 8, UnderrunMode::Zeros);
        let counters = Arc::new(LinkCounters::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let (events_tx, _events_rx) = mpsc::channel();
        let handle = {
            let counters = counters.clone();
            let stopping = stopping.clone();
            thread::spawn(move || {
                receiver_loop(
                    prod,
                    recv_sock,
                    params,
                    ProtocolOptions::default(),
                    counters,
                    stopping,
                    events_tx,
                    None,
                )
            })
        };
        let mut msg = PacketBuffer::new();
        let wrong = StreamParams {
            bits: BitResolution::Bit24,
            ..params
        };
        wrong.fill_header(&mut msg);
        msg.push_payload(&vec![1u8; wrong.payload_bytes_in()]).unwrap();
        send_sock.send_to(msg.get_send_buffer(), recv_addr).unwrap();
        sleep(Duration::from_millis(100));
        let mut out = vec![0u8; payload_len];
        assert!(!cons.try_pop(&mut out));
        assert_eq!(counters.peer_config_mismatch.load(Ordering::Relaxed), 1);
        stopping.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn receiver_reports_peer_exit() {
        let params = test_params();
        let (send_sock, recv_sock, recv_addr) = loopback_pair();
        let (prod, _cons, _mon) =
            ring_pair(params.payload_bytes_out(), 8, UnderrunMode::Zeros);
        let counters = Arc::new(LinkCounters::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel();
        let handle = {
            let stopping = stopping.clone();
            thread::spawn(move || {
                receiver_loop(
                    prod,
                    recv_sock,
                    params,
                    ProtocolOptions::default(),
                    counters,
                    stopping,
                    events_tx,
                    None,
                )
            })
        };
        let mut msg = PacketBuffer::new();
        msg.make_exit();
        send_sock.send_to(msg.get_send_buffer(), recv_addr).unwrap();
        let event = events_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, SessionEvent::Ended(SessionError::PeerStopped));
        handle.join().unwrap().unwrap();
    }
}
