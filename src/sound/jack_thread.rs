//! drives the engine from the jack server's process callback
//!
//! Owns the jack client for the lifetime of the session.  Port naming is
//! send_1..n for capture into the network and receive_1..n for playback out
//! of it.  The engine is handed in, moved into the callback closure, and
//! never seen again; everything it needs to say goes through its rings and
//! the error slot.
use jack;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use crate::common::box_error::BoxError;
use crate::common::error::SessionError;
use crate::common::packet::SampleRateCode;
use crate::session::SessionEvent;
use crate::sound::engine::{AudioEngine, MAX_CHANNELS};

// jack_client_open is not reentrant; every client creation in the process
// goes through this lock, and only the creation.
static CLIENT_REGISTRATION: Mutex<()> = Mutex::new(());

/// serialized jack client creation, shared with the hub's patcher
pub fn open_client(name: &str) -> Result<jack::Client, SessionError> {
    let _guard = CLIENT_REGISTRATION.lock();
    match jack::Client::new(name, jack::ClientOptions::NO_START_SERVER) {
        Ok((client, _status)) => Ok(client),
        Err(e) => Err(SessionError::AudioHostUnavailable(e.to_string())),
    }
}

/// open the client, register the ports, and run the engine until `stopping`
/// goes up or the server shuts us down.
pub fn run(
    mut engine: AudioEngine,
    client_name: &str,
    expected_rate: u32,
    connect_ports: bool,
    stopping: Arc<AtomicBool>,
    events: mpsc::Sender<SessionEvent>,
) -> Result<(), BoxError> {
    let client = match open_client(client_name) {
        Ok(client) => client,
        Err(err) => {
            let _res = events.send(SessionEvent::Ended(err.clone()));
            return Err(Box::new(err));
        }
    };

    // the wire format is pinned to a fixed rate set; refuse anything else
    let host_rate = client.sample_rate() as u32;
    if SampleRateCode::from_rate(host_rate) == SampleRateCode::Undef || host_rate != expected_rate
    {
        let err = SessionError::ConfigInvalid(format!(
            "host runs at {} Hz, session wants {}",
            host_rate, expected_rate
        ));
        let _res = events.send(SessionEvent::Ended(err.clone()));
        return Err(Box::new(err));
    }
    if client.buffer_size() as usize != engine.frames() {
        let err = SessionError::ConfigInvalid(format!(
            "host period is {} frames, session wants {}",
            client.buffer_size(),
            engine.frames()
        ));
        let _res = events.send(SessionEvent::Ended(err.clone()));
        return Err(Box::new(err));
    }

    let num_in = engine.channels_in();
    let num_out = engine.channels_out();
    let mut in_ports = vec![];
    for i in 0..num_in {
        in_ports.push(client.register_port(&format!("send_{}", i + 1), jack::AudioIn::default())?);
    }
    let mut out_ports = vec![];
    for i in 0..num_out {
        out_ports
            .push(client.register_port(&format!("receive_{}", i + 1), jack::AudioOut::default())?);
    }

    let cb_stopping = stopping.clone();
    let process_callback = move |_: &jack::Client, ps: &jack::ProcessScope| -> jack::Control {
        if cb_stopping.load(Ordering::Relaxed) {
            return jack::Control::Quit;
        }
        static EMPTY: [f32; 0] = [];
        let mut ins: [&[f32]; MAX_CHANNELS] = [&EMPTY; MAX_CHANNELS];
        for (i, port) in in_ports.iter().enumerate() {
            ins[i] = port.as_slice(ps);
        }
        let mut outs: [&mut [f32]; MAX_CHANNELS] = std::array::from_fn(|_| Default::default());
        for (i, port) in out_ports.iter_mut().enumerate() {
            outs[i] = port.as_mut_slice(ps);
        }
        engine.process(&ins[..num_in], &mut outs[..num_out]);
        jack::Control::Continue
    };
    let process = jack::ClosureProcessHandler::new(process_callback);

    let notifications = Notifications {
        events: events.clone(),
    };
    let active_client = client.activate_async(notifications, process)?;

    if connect_ports {
        connect_default_ports(active_client.as_client(), client_name, num_in, num_out);
    }

    while !stopping.load(Ordering::Relaxed) {
        sleep(Duration::from_millis(100));
    }
    active_client.deactivate()?;
    info!("audio host client closed");
    Ok(())
}

/// wire the physical capture ports into us and us into playback.
/// Missing physical ports get a warning, not a failure; a headless box
/// might legitimately have none.
fn connect_default_ports(client: &jack::Client, name: &str, num_in: usize, num_out: usize) -> () {
    for i in 0..num_in {
        let res = client.connect_ports_by_name(
            &format!("system:capture_{}", i + 1),
            &format!("{}:send_{}", name, i + 1),
        );
        if let Err(e) = res {
            warn!("could not connect capture {}: {}", i + 1, e);
        }
    }
    for i in 0..num_out {
        let res = client.connect_ports_by_name(
            &format!("{}:receive_{}", name, i + 1),
            &format!("system:playback_{}", i + 1),
        );
        if let Err(e) = res {
            warn!("could not connect playback {}: {}", i + 1, e);
        }
    }
}

struct Notifications {
    events: mpsc::Sender<SessionEvent>,
}

impl jack::NotificationHandler for Notifications {
    fn thread_init(&self, _: &jack::Client) {}

    fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        warn!("audio host shut down ({:?}): {}", status, reason);
        let _res = self.events.send(SessionEvent::Ended(
            SessionError::AudioHostShutdown(reason.to_string()),
        ));
    }

    fn sample_rate(&mut self, _: &jack::Client, srate: jack::Frames) -> jack::Control {
        info!("audio host sample rate changed to {}", srate);
        jack::Control::Continue
    }

    fn xrun(&mut self, _: &jack::Client) -> jack::Control {
        jack::Control::Continue
    }
}
