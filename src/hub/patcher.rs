//! auto-patch: who hears whom when workers come and go
//!
//! Every worker is its own audio host client with send_n input ports (into
//! the network, toward that peer) and receive_n output ports (what that peer
//! played at us).  The patcher recomputes the full connection list whenever
//! the worker set changes, publishes it as an immutable snapshot, and diffs
//! old against new so only the changed graph edges get touched.  The audio
//! callbacks never see a half applied matrix: they read whatever snapshot
//! was current when they looked, and the host applies graph changes between
//! periods.
use log::warn;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::common::error::SessionError;
use crate::sound::jack_thread;

/// policy for wiring worker audio ports together
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatchMode {
    /// server device feeds every client; every client feeds the server device
    ServerToClient,
    /// every client hears themselves (loopback, good for link tests)
    ClientEcho,
    /// every client hears the mix of all the other clients
    ClientFofi,
    /// operator supplied connection list from a matrix file
    ReservedMatrix,
    /// ClientFofi plus the server device on both sides
    FullMix,
    /// hands off, the operator patches by hand
    NoAuto,
}

impl FromStr for PatchMode {
    type Err = String;
    fn from_str(s: &str) -> Result<PatchMode, String> {
        match s.to_lowercase().as_str() {
            "server" | "servertoclient" | "0" => Ok(PatchMode::ServerToClient),
            "echo" | "clientecho" | "1" => Ok(PatchMode::ClientEcho),
            "fofi" | "clientfofi" | "2" => Ok(PatchMode::ClientFofi),
            "matrix" | "reservedmatrix" | "3" => Ok(PatchMode::ReservedMatrix),
            "fullmix" | "4" => Ok(PatchMode::FullMix),
            "noauto" | "none" | "5" => Ok(PatchMode::NoAuto),
            _ => Err(format!("unknown patch mode '{}'", s)),
        }
    }
}

impl fmt::Display for PatchMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PatchMode::ServerToClient => "servertoclient",
            PatchMode::ClientEcho => "clientecho",
            PatchMode::ClientFofi => "clientfofi",
            PatchMode::ReservedMatrix => "reservedmatrix",
            PatchMode::FullMix => "fullmix",
            PatchMode::NoAuto => "noauto",
        };
        write!(f, "{}", name)
    }
}

/// the little a worker needs to expose for patching
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: usize,
    pub client_name: String,
}

/// a directed jack connection, source port then destination port
pub type Connection = (String, String);

/// compute the full desired connection list for the active workers.
///
/// Pure so every policy is testable without an audio host.
pub fn compute_connections(
    mode: PatchMode,
    workers: &[WorkerInfo],
    channels: usize,
    matrix: &[Connection],
) -> Vec<Connection> {
    let mut wires: Vec<Connection> = vec![];
    match mode {
        PatchMode::NoAuto => {}
        PatchMode::ReservedMatrix => {
            wires.extend_from_slice(matrix);
        }
        PatchMode::ServerToClient => {
            for w in workers {
                for c in 1..=channels {
                    wires.push((
                        format!("system:capture_{}", c),
                        format!("{}:send_{}", w.client_name, c),
                    ));
                    wires.push((
                        format!("{}:receive_{}", w.client_name, c),
                        format!("system:playback_{}", c),
                    ));
                }
            }
        }
        PatchMode::ClientEcho => {
            for w in workers {
                for c in 1..=channels {
                    wires.push((
                        format!("{}:receive_{}", w.client_name, c),
                        format!("{}:send_{}", w.client_name, c),
                    ));
                }
            }
        }
        PatchMode::ClientFofi | PatchMode::FullMix => {
            for listener in workers {
                for talker in workers {
                    if listener.id == talker.id {
                        continue;
                    }
                    for c in 1..=channels {
                        wires.push((
                            format!("{}:receive_{}", talker.client_name, c),
                            format!("{}:send_{}", listener.client_name, c),
                        ));
                    }
                }
            }
            if mode == PatchMode::FullMix {
                for w in workers {
                    for c in 1..=channels {
                        wires.push((
                            format!("system:capture_{}", c),
                            format!("{}:send_{}", w.client_name, c),
                        ));
                        wires.push((
                            format!("{}:receive_{}", w.client_name, c),
                            format!("system:playback_{}", c),
                        ));
                    }
                }
            }
        }
    }
    wires
}

/// load a matrix file: one connection per line, source and destination
/// port names separated by whitespace, '#' starts a comment
pub fn load_matrix(path: &Path) -> Result<Vec<Connection>, SessionError> {
    let text = fs::read_to_string(path).map_err(|e| {
        SessionError::ConfigInvalid(format!("cannot read matrix file {:?}: {}", path, e))
    })?;
    let mut wires = vec![];
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(src), Some(dst), None) => wires.push((src.to_string(), dst.to_string())),
            _ => {
                return Err(SessionError::ConfigInvalid(format!(
                    "matrix file {:?} line {}: want 'source destination'",
                    path,
                    lineno + 1
                )))
            }
        }
    }
    Ok(wires)
}

/// owns the published routing snapshot and, when an audio host is around,
/// applies the diff to the real graph
pub struct Patcher {
    mode: PatchMode,
    channels: usize,
    matrix: Vec<Connection>,
    connect_audio: bool,
    jack: Option<jack::Client>,
    current: Mutex<Arc<Vec<Connection>>>,
}

impl Patcher {
    pub fn new(
        mode: PatchMode,
        channels: usize,
        matrix_file: Option<&Path>,
        connect_audio: bool,
    ) -> Result<Patcher, SessionError> {
        let matrix = match (mode, matrix_file) {
            (PatchMode::ReservedMatrix, Some(path)) => load_matrix(path)?,
            (PatchMode::ReservedMatrix, None) => {
                return Err(SessionError::ConfigInvalid(
                    "reservedmatrix patch mode needs a matrix file".to_string(),
                ))
            }
            _ => vec![],
        };
        Ok(Patcher {
            mode,
            channels,
            matrix,
            connect_audio,
            jack: None,
            current: Mutex::new(Arc::new(vec![])),
        })
    }

    /// the connection list the hub is currently running with
    pub fn snapshot(&self) -> Arc<Vec<Connection>> {
        match self.current.lock() {
            Ok(cur) => cur.clone(),
            Err(_) => Arc::new(vec![]),
        }
    }

    /// recompute for this worker set, apply the diff, publish the snapshot
    pub fn rewire(&mut self, workers: &[WorkerInfo]) -> () {
        let wanted = compute_connections(self.mode, workers, self.channels, &self.matrix);
        let previous = self.snapshot();
        if self.connect_audio {
            self.apply_diff(&previous, &wanted);
        }
        if let Ok(mut cur) = self.current.lock() {
            *cur = Arc::new(wanted);
        }
    }

    fn apply_diff(&mut self, previous: &[Connection], wanted: &[Connection]) -> () {
        if self.jack.is_none() {
            match jack_thread::open_client("hub_patcher") {
                Ok(client) => self.jack = Some(client),
                Err(e) => {
                    warn!("patcher has no audio host, routing not applied: {}", e);
                    return;
                }
            }
        }
        let client = self.jack.as_ref().unwrap();
        for old in previous {
            if !wanted.contains(old) {
                let _res = client.disconnect_ports_by_name(&old.0, &old.1);
            }
        }
        for new in wanted {
            if !previous.contains(new) {
                if let Err(e) = client.connect_ports_by_name(&new.0, &new.1) {
                    warn!("could not connect {} -> {}: {}", new.0, new.1, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test_patcher {
    use super::*;

    fn two_workers() -> Vec<WorkerInfo> {
        vec![
            WorkerInfo {
                id: 0,
                client_name: "hub_0".to_string(),
            },
            WorkerInfo {
                id: 1,
                client_name: "hub_1".to_string(),
            },
        ]
    }

    #[test]
    fn parse_modes() {
        assert_eq!("fullmix".parse::<PatchMode>().unwrap(), PatchMode::FullMix);
        assert_eq!("ECHO".parse::<PatchMode>().unwrap(), PatchMode::ClientEcho);
        assert_eq!("2".parse::<PatchMode>().unwrap(), PatchMode::ClientFofi);
        assert!("sideways".parse::<PatchMode>().is_err());
    }

    #[test]
    fn noauto_wires_nothing() {
        let wires = compute_connections(PatchMode::NoAuto, &two_workers(), 2, &[]);
        assert!(wires.is_empty());
    }

    #[test]
    fn server_to_client_wires_the_device_both_ways() {
        let wires = compute_connections(PatchMode::ServerToClient, &two_workers(), 2, &[]);
        // 2 workers x 2 channels x (capture->send + receive->playback)
        assert_eq!(wires.len(), 8);
        assert!(wires.contains(&(
            "system:capture_1".to_string(),
            "hub_0:send_1".to_string()
        )));
        assert!(wires.contains(&(
            "hub_1:receive_2".to_string(),
            "system:playback_2".to_string()
        )));
    }

    #[test]
    fn client_echo_loops_each_worker() {
        let wires = compute_connections(PatchMode::ClientEcho, &two_workers(), 1, &[]);
        assert_eq!(wires.len(), 2);
        assert!(wires.contains(&("hub_0:receive_1".to_string(), "hub_0:send_1".to_string())));
    }

    #[test]
    fn fofi_connects_everyone_but_self() {
        let wires = compute_connections(PatchMode::ClientFofi, &two_workers(), 1, &[]);
        assert_eq!(wires.len(), 2);
        assert!(wires.contains(&("hub_1:receive_1".to_string(), "hub_0:send_1".to_string())));
        assert!(wires.contains(&("hub_0:receive_1".to_string(), "hub_1:send_1".to_string())));
        // never to itself
        assert!(!wires.contains(&("hub_0:receive_1".to_string(), "hub_0:send_1".to_string())));
    }

    #[test]
    fn fullmix_is_fofi_plus_the_device() {
        let fofi = compute_connections(PatchMode::ClientFofi, &two_workers(), 1, &[]);
        let full = compute_connections(PatchMode::FullMix, &two_workers(), 1, &[]);
        assert_eq!(full.len(), fofi.len() + 4);
        for wire in &fofi {
            assert!(full.contains(wire));
        }
    }

    #[test]
    fn snapshot_swaps_on_rewire() {
        let mut patcher = Patcher::new(PatchMode::ClientEcho, 1, None, false).unwrap();
        assert!(patcher.snapshot().is_empty());
        patcher.rewire(&two_workers());
        assert_eq!(patcher.snapshot().len(), 2);
        patcher.rewire(&[]);
        assert!(patcher.snapshot().is_empty());
    }

    #[test]
    fn matrix_file_round_trip() {
        let dir = std::env::temp_dir().join("patcher_matrix_test");
        let _res = std::fs::create_dir_all(&dir);
        let path = dir.join("matrix.txt");
        std::fs::write(&path, "# monitor feed\nhub_0:receive_1 system:playback_1\n").unwrap();
        let wires = load_matrix(&path).unwrap();
        assert_eq!(
            wires,
            vec![(
                "hub_0:receive_1".to_string(),
                "system:playback_1".to_string()
            )]
        );
        std::fs::write(&path, "only_one_field\n").unwrap();
        assert!(load_matrix(&path).is_err());
    }
}
