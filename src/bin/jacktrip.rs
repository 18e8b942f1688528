//! operator binary: one flag set, four modes (client, server, hub client,
//! hub server)
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use jacktrip_rust::common::config::Config;
use jacktrip_rust::common::error::SessionError;
use jacktrip_rust::hub::listener::{HubListener, HubParams, DEFAULT_BASE_PORT, DEFAULT_MAX_WORKERS};
use jacktrip_rust::hub::patcher::PatchMode;
use jacktrip_rust::session::{Session, SessionParams, SessionRole};
use jacktrip_rust::sound::plugin::Limiter;
use jacktrip_rust::sound::ring::UnderrunMode;

#[derive(Parser)]
#[command(version, about = "uncompressed multichannel audio over UDP", long_about = None)]
struct Args {
    /// client mode: connect to this host
    #[arg(short = 'c', long = "client", value_name = "HOST")]
    client: Option<String>,

    /// server mode: await one peer
    #[arg(short = 's', long = "server", default_value_t = false)]
    server: bool,

    /// hub client mode: connect to this hub server
    #[arg(short = 'C', long = "hub-client", value_name = "HOST")]
    hub_client: Option<String>,

    /// hub server mode: serve many peers through one audio device
    #[arg(short = 'S', long = "hub-server", default_value_t = false)]
    hub_server: bool,

    /// number of channels each way
    #[arg(short = 'n', long = "channels", default_value_t = 2)]
    channels: usize,

    /// jitter buffer length in periods
    #[arg(short = 'q', long = "queue", default_value_t = 4)]
    queue: usize,

    /// redundancy factor (payloads per datagram)
    #[arg(short = 'r', long = "redundancy", default_value_t = 1)]
    redundancy: usize,

    /// wire bit resolution (8, 16, 24, 32)
    #[arg(short = 'b', long = "bits", default_value_t = 16)]
    bits: u8,

    /// underrun policy zeros instead of wavetable replay
    #[arg(short = 'z', long = "zeros", default_value_t = false)]
    zeros: bool,

    /// stop the session on the first peer timeout
    #[arg(short = 't', long = "stop-on-timeout", default_value_t = false)]
    stop_on_timeout: bool,

    /// local UDP port
    #[arg(short = 'B', long = "bind-port", default_value_t = 4464)]
    bind_port: u16,

    /// remote UDP port
    #[arg(short = 'P', long = "peer-port")]
    peer_port: Option<u16>,

    /// hub base ephemeral port
    #[arg(short = 'U', long = "hub-port", default_value_t = DEFAULT_BASE_PORT)]
    hub_port: u16,

    /// local audio client name
    #[arg(short = 'J', long = "client-name", default_value = "jacktrip")]
    client_name: String,

    /// remote client name to request (hub client mode)
    #[arg(short = 'K', long = "remote-name")]
    remote_name: Option<String>,

    /// hub auto patch mode (servertoclient, clientecho, clientfofi,
    /// reservedmatrix, fullmix, noauto)
    #[arg(short = 'p', long = "patch-mode", default_value = "servertoclient")]
    patch_mode: String,

    /// do not auto connect the audio ports
    #[arg(short = 'D', long = "no-auto-connect", default_value_t = false)]
    no_auto_connect: bool,

    /// emit I/O stats every N seconds
    #[arg(short = 'I', long = "io-stats", value_name = "SECONDS")]
    io_stats: Option<u64>,

    /// attach the limiter to the inbound and/or outbound chain (i, o, io)
    #[arg(short = 'O', long = "limiter", value_name = "i|o|io")]
    limiter: Option<String>,

    /// expected outbound client count, for limiter headroom
    #[arg(short = 'a', long = "assumed-clients", default_value_t = 1)]
    assumed_clients: usize,

    /// plugin spec, e.g. "i:limiter, o:limiter"
    #[arg(short = 'f', long = "plugins", value_name = "SPEC")]
    plugins: Option<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let modes = [
        args.client.is_some(),
        args.server,
        args.hub_client.is_some(),
        args.hub_server,
    ]
    .iter()
    .filter(|m| **m)
    .count();
    if modes != 1 {
        error!("pick exactly one of -c, -s, -C, -S");
        exit(1);
    }

    // installation defaults, command line wins
    let mut config = Config::build();
    let _res = config.load_from_file();
    let stats_file = match config.get_value("io_stat_file", "") {
        "" => None,
        path => Some(PathBuf::from(path)),
    };

    let params = SessionParams {
        channels: args.channels,
        bits: args.bits,
        queue_len: args.queue,
        redundancy: args.redundancy,
        underrun_mode: if args.zeros {
            UnderrunMode::Zeros
        } else {
            UnderrunMode::Wavetable
        },
        local_port: args.bind_port,
        sample_rate: config.get_u32_value("sample_rate", 48000),
        period_frames: config.get_u32_value("period_frames", 128) as usize,
        timeout: Duration::from_secs(config.get_u32_value("timeout_secs", 10) as u64),
        stop_on_timeout: args.stop_on_timeout,
        handshake_timeout: Duration::from_secs(5),
        stats_interval: args.io_stats.map(Duration::from_secs),
        stats_file,
        client_name: args.client_name.clone(),
        connect_ports: !args.no_auto_connect,
        use_rt_udp_priority: config.get_bool_value("use_rt_udp_priority", false),
        broadcast_queue: config.get_u32_value("broadcast_queue", 0) as usize,
        impairment: None,
    };

    if args.hub_server {
        let patch_mode = match args.patch_mode.parse::<PatchMode>() {
            Ok(mode) => mode,
            Err(e) => {
                error!("{}", e);
                exit(1);
            }
        };
        let matrix_file = match config.get_value("patch_matrix_file", "") {
            "" => None,
            path => Some(PathBuf::from(path)),
        };
        let hub = match HubListener::new(HubParams {
            session: params,
            max_workers: config.get_u32_value("max_workers", DEFAULT_MAX_WORKERS as u32) as usize,
            base_port: args.hub_port,
            patch_mode,
            matrix_file,
            connect_audio: !args.no_auto_connect,
        }) {
            Ok(hub) => hub,
            Err(e) => {
                error!("{}", e);
                exit(e.exit_code());
            }
        };
        match hub.run() {
            Ok(()) => exit(0),
            Err(e) => {
                error!("{}", e);
                exit(e.exit_code());
            }
        }
    }

    let mut session = match Session::new(params) {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            exit(e.exit_code());
        }
    };
    if let Err(e) = attach_plugins(&mut session, &args) {
        error!("{}", e);
        exit(e.exit_code());
    }

    let role = if let Some(host) = args.client {
        SessionRole::Client {
            host,
            port: args.peer_port.unwrap_or(4464),
        }
    } else if let Some(host) = args.hub_client {
        if let Some(name) = &args.remote_name {
            info!("asking the hub to know us as '{}'", name);
        }
        SessionRole::Client {
            host,
            port: args.peer_port.unwrap_or(4464),
        }
    } else {
        SessionRole::Server
    };

    match session.run(role) {
        Ok(()) => exit(0),
        Err(e) => {
            error!("{}", e);
            exit(e.exit_code());
        }
    }
}

/// wire up -O and -f.  Only the built in limiter is known; anything else in
/// a plugin spec is a configuration error.
fn attach_plugins(session: &mut Session, args: &Args) -> Result<(), SessionError> {
    let rate = 48000.0;
    let mut inbound = false;
    let mut outbound = false;
    if let Some(spec) = &args.limiter {
        match spec.as_str() {
            "i" => inbound = true,
            "o" => outbound = true,
            "io" | "oi" => {
                inbound = true;
                outbound = true;
            }
            other => {
                return Err(SessionError::ConfigInvalid(format!(
                    "limiter spec '{}', want i, o, or io",
                    other
                )))
            }
        }
    }
    if let Some(spec) = &args.plugins {
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (side, name) = part.split_once(':').ok_or_else(|| {
                SessionError::ConfigInvalid(format!("plugin spec '{}', want side:name", part))
            })?;
            if name.trim() != "limiter" {
                return Err(SessionError::ConfigInvalid(format!(
                    "unknown plugin '{}'",
                    name.trim()
                )));
            }
            match side.trim() {
                "i" => inbound = true,
                "o" => outbound = true,
                other => {
                    return Err(SessionError::ConfigInvalid(format!(
                        "plugin side '{}', want i or o",
                        other
                    )))
                }
            }
        }
    }
    if inbound {
        session.append_plugin_from_network(Box::new(Limiter::new(
            args.channels,
            args.assumed_clients,
            rate,
        )))?;
    }
    if outbound {
        session.append_plugin_to_network(Box::new(Limiter::new(
            args.channels,
            args.assumed_clients,
            rate,
        )))?;
    }
    Ok(())
}
