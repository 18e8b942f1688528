//! one peer to peer audio link: engine + rings + network loops + supervisor
//!
//! The session owns the threads.  The audio callback lives in the jack
//! thread, the sender and receiver each get their own, and the caller's
//! thread becomes the supervisor: it watches the event channel, turns the
//! stats counters into interval reports, and runs the orderly stop when
//! anything ends the party.  Nothing in here is on the audio hot path.
use log::{error, info, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::common::error::{ErrorSlot, SessionError};
use crate::common::packet::{BitResolution, SampleRateCode, StreamParams};
use crate::common::stream_time_stat::{MicroTimer, StreamTimeStat};
use crate::net::data_protocol::{self, Impairment, LinkCounters, ProtocolOptions};
use crate::net::handshake;
use crate::net::sock_with_tos;
use crate::sound::engine::AudioEngine;
use crate::sound::jack_thread;
use crate::sound::plugin::BoxedPlugin;
use crate::sound::ring::{ring_pair, RingConsumer, RingMonitor, UnderrunMode};
use crate::utils::get_micro_time;

/// lifecycle of a session, kept in an atomic so any thread may look
#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum SessionState {
    Unbound = 0,
    Listening,
    Connecting,
    Running,
    Stopping,
    Stopped,
}

/// what the worker threads tell the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// first packet from the peer arrived; the link is live
    FirstPacket,
    /// something ended the session (or wants to)
    Ended(SessionError),
}

/// which side of the handshake we play
#[derive(Debug, Clone)]
pub enum SessionRole {
    /// connect out to a server
    Client { host: String, port: u16 },
    /// await exactly one peer on the local control port
    Server,
}

/// everything a session needs to know before it binds
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// channels each way
    pub channels: usize,
    /// wire bit depth, one of 8/16/24/32
    pub bits: u8,
    /// jitter buffer length in periods
    pub queue_len: usize,
    /// payloads per datagram
    pub redundancy: usize,
    pub underrun_mode: UnderrunMode,
    /// local UDP port (control port in server mode)
    pub local_port: u16,
    pub sample_rate: u32,
    pub period_frames: usize,
    /// peer silence tolerance while running
    pub timeout: Duration,
    /// end the session on the first peer timeout instead of just logging
    pub stop_on_timeout: bool,
    pub handshake_timeout: Duration,
    /// emit an interval report every so often; None disables
    pub stats_interval: Option<Duration>,
    /// append interval reports to this file as plain text lines
    pub stats_file: Option<PathBuf>,
    /// name of our audio host client
    pub client_name: String,
    /// auto connect to the physical audio ports
    pub connect_ports: bool,
    pub use_rt_udp_priority: bool,
    /// extra deep ring for monitor taps; 0 disables
    pub broadcast_queue: usize,
    pub impairment: Option<Impairment>,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            channels: 2,
            bits: 16,
            queue_len: 4,
            redundancy: 1,
            underrun_mode: UnderrunMode::Wavetable,
            local_port: handshake::DEFAULT_CONTROL_PORT,
            sample_rate: 48000,
            period_frames: 128,
            timeout: Duration::from_secs(10),
            stop_on_timeout: false,
            handshake_timeout: Duration::from_secs(5),
            stats_interval: None,
            stats_file: None,
            client_name: "jacktrip".to_string(),
            connect_ports: true,
            use_rt_udp_priority: false,
            broadcast_queue: 0,
            impairment: None,
        }
    }
}

impl SessionParams {
    pub fn validate(&self) -> Result<(), SessionError> {
        if BitResolution::from_bits(self.bits).is_none() {
            return Err(SessionError::ConfigInvalid(format!(
                "bit resolution {}",
                self.bits
            )));
        }
        if self.channels == 0 || self.channels > crate::sound::engine::MAX_CHANNELS {
            return Err(SessionError::ConfigInvalid(format!(
                "{} channels",
                self.channels
            )));
        }
        if self.queue_len < 2 {
            return Err(SessionError::ConfigInvalid(
                "queue length must be at least 2 periods".to_string(),
            ));
        }
        if self.redundancy == 0 {
            return Err(SessionError::ConfigInvalid(
                "redundancy factor must be at least 1".to_string(),
            ));
        }
        if self.period_frames == 0 || self.period_frames > u16::MAX as usize {
            return Err(SessionError::ConfigInvalid(format!(
                "period of {} frames",
                self.period_frames
            )));
        }
        if SampleRateCode::from_rate(self.sample_rate) == SampleRateCode::Undef {
            return Err(SessionError::ConfigInvalid(format!(
                "sample rate {} is outside the wire format set",
                self.sample_rate
            )));
        }
        Ok(())
    }
    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            frames: self.period_frames as u16,
            rate: SampleRateCode::from_rate(self.sample_rate),
            // validate() ran before anyone calls this
            bits: BitResolution::from_bits(self.bits).unwrap_or(BitResolution::Bit16),
            channels_in: self.channels as u8,
            channels_out: self.channels as u8,
        }
    }
    /// wall clock length of one audio period
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_frames as f64 / self.sample_rate as f64)
    }
    fn protocol_options(&self) -> ProtocolOptions {
        ProtocolOptions {
            redundancy: self.redundancy,
            timeout: self.timeout,
            use_rt_udp_priority: self.use_rt_udp_priority,
            impairment: self.impairment,
            period: self.period(),
        }
    }
}

/// clonable remote control for a running session
#[derive(Clone)]
pub struct SessionHandle {
    stopping: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    broadcast: Arc<Mutex<Option<RingConsumer>>>,
}

impl SessionHandle {
    /// ask the session to come down.  Safe from any thread, any number of
    /// times.
    pub fn stop(&self) -> () {
        self.stopping.store(true, Ordering::Release);
    }
    pub fn state(&self) -> SessionState {
        num::FromPrimitive::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(SessionState::Stopped)
    }
    /// claim the monitor tap.  Present once the session is connected and a
    /// broadcast queue was configured; the first caller gets it.
    pub fn take_broadcast(&self) -> Option<RingConsumer> {
        match self.broadcast.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        }
    }
}

pub struct Session {
    params: SessionParams,
    state: Arc<AtomicU8>,
    stopping: Arc<AtomicBool>,
    counters: Arc<LinkCounters>,
    error_slot: Arc<ErrorSlot>,
    mismatches: Arc<AtomicU64>,
    broadcast_out: Arc<Mutex<Option<RingConsumer>>>,
    plugins_to_net: Vec<BoxedPlugin>,
    plugins_from_net: Vec<BoxedPlugin>,
    replay_fade: usize,
}

impl Session {
    pub fn new(params: SessionParams) -> Result<Session, SessionError> {
        params.validate()?;
        Ok(Session {
            params,
            state: Arc::new(AtomicU8::new(SessionState::Unbound as u8)),
            stopping: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(LinkCounters::new()),
            error_slot: Arc::new(ErrorSlot::new()),
            mismatches: Arc::new(AtomicU64::new(0)),
            broadcast_out: Arc::new(Mutex::new(None)),
            plugins_to_net: vec![],
            plugins_from_net: vec![],
            replay_fade: 0,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            stopping: self.stopping.clone(),
            state: self.state.clone(),
            broadcast: self.broadcast_out.clone(),
        }
    }
    pub fn counters(&self) -> Arc<LinkCounters> {
        self.counters.clone()
    }
    pub fn state(&self) -> SessionState {
        num::FromPrimitive::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(SessionState::Stopped)
    }
    fn set_state(&self, s: SessionState) -> () {
        self.state.store(s as u8, Ordering::Release);
    }

    /// queue a capture side plugin for the engine.  Only before `run`.
    pub fn append_plugin_to_network(&mut self, p: BoxedPlugin) -> Result<(), SessionError> {
        if self.state() != SessionState::Unbound {
            return Err(SessionError::ConfigInvalid(
                "plugins must be added before the session starts".to_string(),
            ));
        }
        self.plugins_to_net.push(p);
        Ok(())
    }
    /// queue a playback side plugin for the engine.  Only before `run`.
    pub fn append_plugin_from_network(&mut self, p: BoxedPlugin) -> Result<(), SessionError> {
        if self.state() != SessionState::Unbound {
            return Err(SessionError::ConfigInvalid(
                "plugins must be added before the session starts".to_string(),
            ));
        }
        self.plugins_from_net.push(p);
        Ok(())
    }
    /// smooth repeated wavetable replays over the last k frames
    pub fn set_replay_fade(&mut self, k: usize) -> () {
        self.replay_fade = k;
    }
    /// change the jitter buffer length.  Only before the session binds.
    pub fn set_queue_length(&mut self, q: usize) -> Result<(), SessionError> {
        if self.state() != SessionState::Unbound {
            return Err(SessionError::ConfigInvalid(
                "queue length is fixed once the session starts".to_string(),
            ));
        }
        if q < 2 {
            return Err(SessionError::ConfigInvalid(
                "queue length must be at least 2 periods".to_string(),
            ));
        }
        self.params.queue_len = q;
        Ok(())
    }

    /// run the session to completion.  Returns Ok on a clean stop (operator
    /// request or peer disconnect), the terminal error otherwise.
    pub fn run(&mut self, role: SessionRole) -> Result<(), SessionError> {
        let sock =
            sock_with_tos::new(self.params.local_port).map_err(|e| {
                error!("bind failed: {}", e);
                SessionError::BindFailed(self.params.local_port)
            })?;
        let stream = self.params.stream_params();

        // phase one: find out who we are talking to and on what port
        let (data_sock, peer) = match role {
            SessionRole::Client { ref host, port } => {
                self.set_state(SessionState::Connecting);
                let server = resolve_peer(host, port)?;
                info!("probing {}", server);
                let peer =
                    handshake::client_handshake(&sock, server, &stream, self.params.handshake_timeout)?;
                (sock, peer)
            }
            SessionRole::Server => {
                self.set_state(SessionState::Listening);
                info!("awaiting a peer on port {}", self.params.local_port);
                let probe =
                    match handshake::wait_for_probe(&sock, &stream, &self.mismatches, &self.stopping)? {
                        Some(p) => p,
                        None => {
                            // stopped while listening
                            self.set_state(SessionState::Stopped);
                            return Ok(());
                        }
                    };
                let (data_sock, port) = handshake::bind_ephemeral(49152, 4096)?;
                handshake::send_port_reply(&sock, probe.client, port)?;
                info!("moved peer {} to port {}", probe.client, port);
                (data_sock, probe.client)
            }
        };

        self.run_connected(data_sock, peer)
    }

    /// shared path once the socket and peer address are settled.
    /// Used directly by hub workers, which do their own handshaking.
    pub fn run_connected(
        &mut self,
        sock: UdpSocket,
        peer: SocketAddr,
    ) -> Result<(), SessionError> {
        let stream = self.params.stream_params();
        let payload_in = stream.payload_bytes_in();
        let payload_out = stream.payload_bytes_out();

        let (send_prod, send_cons, _send_mon) =
            ring_pair(payload_in, self.params.queue_len, UnderrunMode::Zeros);
        let (recv_prod, recv_cons, recv_mon) =
            ring_pair(payload_out, self.params.queue_len, self.params.underrun_mode);
        let broadcast = if self.params.broadcast_queue > 0 {
            let (bprod, bcons, _bmon) = ring_pair(
                payload_out,
                self.params.broadcast_queue,
                UnderrunMode::Zeros,
            );
            // monitor subscribers claim the consumer through the handle
            if let Ok(mut slot) = self.broadcast_out.lock() {
                *slot = Some(bcons);
            }
            Some(bprod)
        } else {
            None
        };

        let mut engine = AudioEngine::setup(
            self.params.channels,
            self.params.channels,
            self.params.bits,
            self.params.period_frames,
            send_prod,
            recv_cons,
            self.error_slot.clone(),
        )?;
        engine.set_replay_fade(self.replay_fade);
        for p in self.plugins_to_net.drain(..) {
            engine.append_plugin_to_network(p)?;
        }
        for p in self.plugins_from_net.drain(..) {
            engine.append_plugin_from_network(p)?;
        }

        let (events_tx, events_rx) = mpsc::channel();
        let opts = self.params.protocol_options();
        let start = Instant::now();

        let sender_sock = sock
            .try_clone()
            .map_err(|e| SessionError::SocketError(e.to_string()))?;
        let sender_counters = self.counters.clone();
        let sender_stopping = self.stopping.clone();
        let sender_opts = opts.clone();
        let sender = thread::spawn(move || {
            data_protocol::sender_loop(
                send_cons,
                sender_sock,
                peer,
                stream,
                sender_opts,
                sender_counters,
                sender_stopping,
                start,
            )
        });

        let recv_sock = sock
            .try_clone()
            .map_err(|e| SessionError::SocketError(e.to_string()))?;
        let recv_counters = self.counters.clone();
        let recv_stopping = self.stopping.clone();
        let recv_events = events_tx.clone();
        let receiver = thread::spawn(move || {
            data_protocol::receiver_loop(
                recv_prod,
                recv_sock,
                stream,
                opts,
                recv_counters,
                recv_stopping,
                recv_events,
                broadcast,
            )
        });

        let audio_stopping = self.stopping.clone();
        let audio_events = events_tx.clone();
        let client_name = self.params.client_name.clone();
        let expected_rate = self.params.sample_rate;
        let connect_ports = self.params.connect_ports;
        let audio = thread::spawn(move || {
            jack_thread::run(
                engine,
                &client_name,
                expected_rate,
                connect_ports,
                audio_stopping,
                audio_events,
            )
        });

        // the workers hold the only senders now; a dead channel means they
        // are all gone
        drop(events_tx);

        let cause = self.supervise(events_rx, &recv_mon);

        // orderly stop: flag first, exit notice to the peer, then join in
        // sender, receiver, audio order
        self.set_state(SessionState::Stopping);
        self.stopping.store(true, Ordering::Release);
        send_exit_notice(&sock, peer);
        let _res = sender.join();
        let _res = receiver.join();
        let _res = audio.join();
        self.set_state(SessionState::Stopped);

        match cause {
            None => Ok(()),
            Some(err) if err.is_disconnect() => {
                info!("session ended because {}", err);
                Ok(())
            }
            Some(err) => {
                error!("session ended because {}", err);
                Err(err)
            }
        }
    }

    /// event pump and interval reporting.  Returns the terminal cause, or
    /// None for an operator stop.
    fn supervise(
        &self,
        events: mpsc::Receiver<SessionEvent>,
        recv_mon: &RingMonitor,
    ) -> Option<SessionError> {
        let interval = self
            .params
            .stats_interval
            .map(|d| d.as_micros())
            .unwrap_or(0);
        let mut report_timer = MicroTimer::new(get_micro_time(), interval.max(1));
        let mut depth_stat = StreamTimeStat::new(64);

        loop {
            if self.stopping.load(Ordering::Acquire) {
                return None;
            }
            if let Some(err) = self.error_slot.take() {
                return Some(err);
            }
            match events.recv_timeout(Duration::from_millis(200)) {
                Ok(SessionEvent::FirstPacket) => {
                    info!("peer is live, session running");
                    self.set_state(SessionState::Running);
                }
                Ok(SessionEvent::Ended(SessionError::PeerTimeout))
                    if !self.params.stop_on_timeout =>
                {
                    warn!("peer timeout; holding the line with the underrun policy");
                }
                Ok(SessionEvent::Ended(err)) => return Some(err),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // every worker thread is gone; nothing left to supervise
                    return Some(SessionError::SocketError(
                        "all session threads exited".to_string(),
                    ));
                }
            }
            depth_stat.add_sample(recv_mon.occupancy() as f64);
            let now = get_micro_time();
            if self.params.stats_interval.is_some() && report_timer.expired(now) {
                report_timer.reset(now);
                self.report_interval(recv_mon, &mut depth_stat);
            }
        }
    }

    fn report_interval(&self, recv_mon: &RingMonitor, depth_stat: &mut StreamTimeStat) -> () {
        let c = &self.counters;
        let status = json!({
            "packets_sent": c.packets_sent.load(Ordering::Relaxed),
            "packets_recv": c.packets_recv.load(Ordering::Relaxed),
            "seq_gaps": c.seq_gaps.load(Ordering::Relaxed),
            "out_of_order": c.out_of_order.load(Ordering::Relaxed),
            "underruns": recv_mon.underruns(),
            "overflows": recv_mon.overflows(),
            "depth_mean": depth_stat.get_mean(),
            "depth_peak": depth_stat.get_peak(),
        });
        info!("stats: {}", status);
        if let Some(path) = &self.params.stats_file {
            let epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let line = format!(
                "{} {} {} {} {} {} {:.2}\n",
                epoch,
                c.packets_sent.load(Ordering::Relaxed),
                c.packets_recv.load(Ordering::Relaxed),
                c.seq_gaps.load(Ordering::Relaxed),
                recv_mon.underruns(),
                recv_mon.overflows(),
                depth_stat.get_mean(),
            );
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(mut f) => {
                    let _res = f.write_all(line.as_bytes());
                }
                Err(e) => warn!("could not append stats to {:?}: {}", path, e),
            }
        }
        depth_stat.clear();
    }
}

fn resolve_peer(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| SessionError::ConfigInvalid(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| SessionError::ConfigInvalid(format!("no address for {}", host)))
}

/// best effort goodbye so the peer reports a disconnect instead of a timeout
fn send_exit_notice(sock: &UdpSocket, peer: SocketAddr) -> () {
    let mut msg = crate::common::packet::PacketBuffer::new();
    msg.make_exit();
    let _res = sock.send_to(msg.get_send_buffer(), peer);
}
