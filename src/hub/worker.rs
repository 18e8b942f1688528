//! one hub worker: a full session on behalf of one remote peer
//!
//! The listener does the handshake; the worker just gets the already bound
//! ephemeral socket and the client address and runs a session on its own
//! thread.  When the session ends, for any reason, the worker posts a
//! Stopped event so the listener can reap the slot and rewire the patch.
use log::{info, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use crate::common::error::SessionError;
use crate::hub::patcher::WorkerInfo;
use crate::session::{Session, SessionHandle, SessionParams};

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum WorkerState {
    Spawning = 0,
    Running,
    Stopping,
    Reaped,
}

/// what workers tell the listener
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Stopped(usize),
}

pub struct HubWorker {
    id: usize,
    client_name: String,
    port: u16,
    client_addr: SocketAddr,
    state: Arc<AtomicU8>,
    session: SessionHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl HubWorker {
    /// start a session for `client` on its own thread.
    ///
    /// `params` should already carry the worker's client name and have port
    /// auto-connect off; the patcher owns the wiring.
    pub fn spawn(
        id: usize,
        params: SessionParams,
        sock: UdpSocket,
        client: SocketAddr,
        port: u16,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<HubWorker, SessionError> {
        let client_name = params.client_name.clone();
        let mut session = Session::new(params)?;
        let handle = session.handle();
        let state = Arc::new(AtomicU8::new(WorkerState::Spawning as u8));
        let thread_state = state.clone();
        let thread = thread::spawn(move || {
            thread_state.store(WorkerState::Running as u8, Ordering::Release);
            match session.run_connected(sock, client) {
                Ok(()) => info!("worker {} finished", id),
                Err(e) => warn!("worker {} ended with {}", id, e),
            }
            thread_state.store(WorkerState::Stopping as u8, Ordering::Release);
            let _res = events.send(WorkerEvent::Stopped(id));
        });
        Ok(HubWorker {
            id,
            client_name,
            port,
            client_addr: client,
            state,
            session: handle,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }
    pub fn state(&self) -> WorkerState {
        num::FromPrimitive::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(WorkerState::Reaped)
    }
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            client_name: self.client_name.clone(),
        }
    }

    /// ask the worker's session to come down
    pub fn stop(&self) -> () {
        self.session.stop();
    }

    /// join the worker thread and free the slot
    pub fn reap(mut self) -> () {
        self.session.stop();
        if let Some(thread) = self.thread.take() {
            let _res = thread.join();
        }
        self.state
            .store(WorkerState::Reaped as u8, Ordering::Release);
    }
}
