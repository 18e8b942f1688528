//! the hub's accept loop: one control socket, a bounded worker table
//!
//! Probes arrive on the control port exactly as in the two peer handshake.
//! Each compatible probe gets the next free worker slot and a fresh
//! ephemeral port; a full table gets the zero port busy reply and the
//! client gives up on its own.  The worker table is behind one mutex that
//! is only ever taken here, at accept and reap; audio routing reads the
//! patcher's published snapshot instead.
use log::{info, warn};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::common::error::SessionError;
use crate::common::packet::PacketBuffer;
use crate::hub::patcher::{PatchMode, Patcher, WorkerInfo};
use crate::hub::worker::{HubWorker, WorkerEvent};
use crate::net::handshake;
use crate::net::sock_with_tos;
use crate::session::SessionParams;

/// how many peers a hub serves at once unless told otherwise
pub const DEFAULT_MAX_WORKERS: usize = 4;
/// first ephemeral port handed to workers unless told otherwise
pub const DEFAULT_BASE_PORT: u16 = 61002;
/// how far past the base the port scan is willing to walk
const PORT_SCAN_SPAN: u16 = 4096;

#[derive(Debug, Clone)]
pub struct HubParams {
    /// template for each worker's session; the listener fills in the
    /// client name and turns port auto-connect off per worker
    pub session: SessionParams,
    pub max_workers: usize,
    pub base_port: u16,
    pub patch_mode: PatchMode,
    pub matrix_file: Option<PathBuf>,
    /// let the patcher touch the real audio graph
    pub connect_audio: bool,
}

impl Default for HubParams {
    fn default() -> Self {
        HubParams {
            session: SessionParams::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            base_port: DEFAULT_BASE_PORT,
            patch_mode: PatchMode::ServerToClient,
            matrix_file: None,
            connect_audio: true,
        }
    }
}

/// clonable remote control for a running hub
#[derive(Clone)]
pub struct HubHandle {
    stopping: Arc<AtomicBool>,
}

impl HubHandle {
    pub fn stop(&self) -> () {
        self.stopping.store(true, Ordering::Release);
    }
}

pub struct HubListener {
    params: HubParams,
    stopping: Arc<AtomicBool>,
    mismatches: Arc<AtomicU64>,
    workers: Mutex<Vec<Option<HubWorker>>>,
}

impl HubListener {
    pub fn new(params: HubParams) -> Result<HubListener, SessionError> {
        params.session.validate()?;
        if params.max_workers == 0 {
            return Err(SessionError::ConfigInvalid(
                "hub needs at least one worker slot".to_string(),
            ));
        }
        let mut slots = Vec::with_capacity(params.max_workers);
        slots.resize_with(params.max_workers, || None);
        Ok(HubListener {
            params,
            stopping: Arc::new(AtomicBool::new(false)),
            mismatches: Arc::new(AtomicU64::new(0)),
            workers: Mutex::new(slots),
        })
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            stopping: self.stopping.clone(),
        }
    }
    pub fn mismatch_count(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }
    /// active worker descriptions, for the patcher and for status output
    pub fn active_workers(&self) -> Vec<WorkerInfo> {
        match self.workers.lock() {
            Ok(workers) => workers
                .iter()
                .flatten()
                .map(|w| w.info())
                .collect(),
            Err(_) => vec![],
        }
    }

    /// run the accept loop until stopped.  Blocks the calling thread.
    pub fn run(&self) -> Result<(), SessionError> {
        let control = sock_with_tos::new(self.params.session.local_port)
            .map_err(|_| SessionError::BindFailed(self.params.session.local_port))?;
        control
            .set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(|e| SessionError::SocketError(e.to_string()))?;
        let mut patcher = Patcher::new(
            self.params.patch_mode,
            self.params.session.channels,
            self.params.matrix_file.as_deref(),
            self.params.connect_audio,
        )?;
        let stream = self.params.session.stream_params();
        let (events_tx, events_rx) = mpsc::channel();
        let mut msg = PacketBuffer::new();
        info!(
            "hub listening on port {}, patch mode {}",
            self.params.session.local_port, self.params.patch_mode
        );

        while !self.stopping.load(Ordering::Acquire) {
            // reap finished workers before looking for new ones
            let mut reaped_any = false;
            while let Ok(WorkerEvent::Stopped(id)) = events_rx.try_recv() {
                if let Ok(mut workers) = self.workers.lock() {
                    if let Some(worker) = workers[id].take() {
                        info!("reaping worker {}", id);
                        worker.reap();
                        reaped_any = true;
                    }
                }
            }
            if reaped_any {
                patcher.rewire(&self.active_workers());
            }

            let (amt, client) = match control.recv_from(msg.get_buffer()) {
                Ok(got) => got,
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(SessionError::SocketError(e.to_string())),
            };
            if msg.set_nbytes(amt).is_err() {
                continue;
            }
            if let Err(what) = stream.matches_header(&msg) {
                self.mismatches.fetch_add(1, Ordering::Relaxed);
                warn!("dropping probe from {}: {}", client, what);
                continue;
            }

            // a client that missed our reply probes again; answer with the
            // port its worker already holds instead of spawning another
            let existing = match self.workers.lock() {
                Ok(workers) => workers
                    .iter()
                    .flatten()
                    .find(|w| w.client_addr() == client)
                    .map(|w| w.port()),
                Err(_) => None,
            };
            if let Some(port) = existing {
                handshake::send_port_reply(&control, client, port)?;
                continue;
            }

            let free_slot = match self.workers.lock() {
                Ok(workers) => workers.iter().position(|w| w.is_none()),
                Err(_) => None,
            };
            let id = match free_slot {
                Some(id) => id,
                None => {
                    warn!("hub full, turning away {}", client);
                    let _res = control.send_to(&handshake::encode_port_reply(0), client);
                    continue;
                }
            };

            let (worker_sock, port) =
                match handshake::bind_ephemeral(self.params.base_port, PORT_SCAN_SPAN) {
                    Ok(bound) => bound,
                    Err(e) => {
                        warn!("no ephemeral port for {}: {}", client, e);
                        let _res = control.send_to(&handshake::encode_port_reply(0), client);
                        continue;
                    }
                };
            handshake::send_port_reply(&control, client, port)?;

            let mut worker_params = self.params.session.clone();
            worker_params.client_name =
                format!("{}_{}", self.params.session.client_name, id);
            worker_params.connect_ports = false;
            match HubWorker::spawn(id, worker_params, worker_sock, client, port, events_tx.clone())
            {
                Ok(worker) => {
                    info!("worker {} serving {} on port {}", id, client, port);
                    if let Ok(mut workers) = self.workers.lock() {
                        workers[id] = Some(worker);
                    }
                    patcher.rewire(&self.active_workers());
                }
                Err(e) => warn!("could not spawn worker for {}: {}", client, e),
            }
        }

        // orderly shutdown: stop every worker, then join them
        info!("hub stopping");
        if let Ok(mut workers) = self.workers.lock() {
            for slot in workers.iter() {
                if let Some(worker) = slot {
                    worker.stop();
                }
            }
            for slot in workers.iter_mut() {
                if let Some(worker) = slot.take() {
                    worker.reap();
                }
            }
        }
        patcher.rewire(&[]);
        Ok(())
    }
}

#[cfg(test)]
mod test_listener {
    use super::*;
    use crate::common::packet::{BitResolution, SampleRateCode, StreamParams};
    use crate::net::handshake::decode_port_reply;
    use std::net::UdpSocket;
    use std::thread;

    fn quiet_params(port: u16) -> HubParams {
        HubParams {
            session: SessionParams {
                local_port: port,
                connect_ports: false,
                ..SessionParams::default()
            },
            connect_audio: false,
            max_workers: 2,
            ..HubParams::default()
        }
    }

    fn probe_for(params: &SessionParams) -> PacketBuffer {
        let mut msg = PacketBuffer::new();
        params.stream_params().fill_header(&mut msg);
        msg
    }

    #[test]
    fn rejects_zero_workers() {
        let mut params = quiet_params(0);
        params.max_workers = 0;
        assert!(HubListener::new(params).is_err());
    }

    #[test]
    fn incompatible_probe_is_counted_not_answered() {
        let port = 47810;
        let hub = Arc::new(HubListener::new(quiet_params(port)).unwrap());
        let handle = hub.handle();
        let runner = {
            let hub = hub.clone();
            thread::spawn(move || hub.run())
        };
        // a mismatched stream advertisement
        let wrong = StreamParams {
            frames: 256,
            rate: SampleRateCode::Sr44,
            bits: BitResolution::Bit24,
            channels_in: 6,
            channels_out: 6,
        };
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut msg = PacketBuffer::new();
        wrong.fill_header(&mut msg);
        client
            .send_to(msg.get_send_buffer(), ("127.0.0.1", port))
            .unwrap();
        // no reply should come back
        let mut reply = [0u8; 8];
        assert!(client.recv_from(&mut reply).is_err());
        assert_eq!(hub.mismatch_count(), 1);
        assert!(hub.active_workers().is_empty());
        handle.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn compatible_probe_gets_an_ephemeral_port() {
        let port = 47811;
        let hub = Arc::new(HubListener::new(quiet_params(port)).unwrap());
        let handle = hub.handle();
        let runner = {
            let hub = hub.clone();
            thread::spawn(move || hub.run())
        };
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let msg = probe_for(&SessionParams::default());
        client
            .send_to(msg.get_send_buffer(), ("127.0.0.1", port))
            .unwrap();
        let mut reply = [0u8; 8];
        let (amt, _from) = client.recv_from(&mut reply).unwrap();
        assert_eq!(amt, 3);
        let worker_port = decode_port_reply(&reply[..amt]).unwrap();
        assert!(worker_port >= DEFAULT_BASE_PORT);
        handle.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn full_hub_sends_the_busy_reply() {
        use crate::hub::worker::HubWorker;
        let port = 47812;
        let mut params = quiet_params(port);
        params.max_workers = 1;
        let hub = Arc::new(HubListener::new(params).unwrap());
        // occupy the only slot with a worker the listener will never reap
        // (its stop event goes to a channel the listener is not draining)
        let (side_tx, _side_rx) = mpsc::channel();
        let worker_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let parked = HubWorker::spawn(
            0,
            SessionParams {
                connect_ports: false,
                ..SessionParams::default()
            },
            worker_sock,
            "127.0.0.1:9".parse().unwrap(),
            61002,
            side_tx,
        )
        .unwrap();
        hub.workers.lock().unwrap()[0] = Some(parked);

        let handle = hub.handle();
        let runner = {
            let hub = hub.clone();
            thread::spawn(move || hub.run())
        };
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let msg = probe_for(&SessionParams::default());
        client
            .send_to(msg.get_send_buffer(), ("127.0.0.1", port))
            .unwrap();
        let mut reply = [0u8; 8];
        let (amt, _) = client.recv_from(&mut reply).unwrap();
        assert_eq!(amt, 3);
        // the busy triplet decodes to nothing a client would use
        assert_eq!(decode_port_reply(&reply[..amt]), None);
        handle.stop();
        runner.join().unwrap().unwrap();
    }
}
