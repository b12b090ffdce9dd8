//! The process-wide runtime value.
//!
//! Owns the configuration, the tick counter, the timer steering word
//! and either the server peer pool or the client peer. Everything that
//! used to be ambient state threads through this one value: socket
//! receive threads deliver frames here, the timer thread ticks here,
//! and workers reach their phases through it.

use std::sync::atomic::{AtomicI8, AtomicU16, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use jamlink_proto::frame::Frame;
use jamlink_proto::{DEFAULT_PORT, PEERS_MAX, PORTS_MAX};

use crate::client::Client;
use crate::events::ClientEvent;
use crate::server::Server;
use crate::socket::{self, SocketAddress, SocketError, Transport};
use crate::timer;

#[derive(Clone)]
pub struct Config {
    /// Base UDP port; stripes bind consecutive ports above it.
    pub port: u16,
    /// Shared 64-bit secret; zero accepts any password.
    pub server_passwd: u64,
    /// Secondary secret granting mixer access; zero grants everyone.
    pub mixer_passwd: u64,
    /// Participant slots; zero selects client mode.
    pub num_server_peers: usize,
    /// Worker threads cooperating on the server tick (1..=64).
    pub num_workers: usize,
    /// UDP send/receive buffer size in bytes.
    pub udp_buffer_size: usize,
    /// Refuse the per-frame port rotation feature.
    pub no_multi_port: bool,
    /// Serve silence to every participant (streaming-only servers).
    pub mute_peer_audio: bool,
    /// Chat lines greeting a new participant.
    pub welcome_lines: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            server_passwd: 0,
            mixer_passwd: 0,
            num_server_peers: 0,
            num_workers: 1,
            udp_buffer_size: 2000 * PORTS_MAX,
            no_multi_port: false,
            mute_peer_audio: false,
            welcome_lines: Vec::new(),
        }
    }
}

pub struct Runtime {
    pub config: Config,
    pub ticks: AtomicU16,
    /// Per-tick period steering: -1 faster, 0 nominal, +1 slower.
    pub timer_adjust: AtomicI8,
    server: Option<Server>,
    client: Option<Client>,
}

impl Runtime {
    /// Build a server runtime. Sockets and threads start with
    /// [`Runtime::start`].
    pub fn new_server(config: Config) -> Arc<Self> {
        debug_assert!(config.num_server_peers > 0);
        // the buffer-adjust visitor walks `ticks & 0x3fff`; the peer cap
        // keeps every slot inside that window
        debug_assert!(config.num_server_peers <= PEERS_MAX);

        let server = Server::new(config.num_server_peers, config.num_workers);
        Arc::new(Self {
            config,
            ticks: AtomicU16::new(0),
            timer_adjust: AtomicI8::new(0),
            server: Some(server),
            client: None,
        })
    }

    /// Build a client runtime delivering events to `events`.
    pub fn new_client(config: Config, events: Sender<ClientEvent>) -> Arc<Self> {
        Arc::new(Self {
            config,
            ticks: AtomicU16::new(0),
            timer_adjust: AtomicI8::new(0),
            server: None,
            client: Some(Client::new(events)),
        })
    }

    pub fn ticks(&self) -> u16 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    /// Single entry point for received datagrams.
    pub fn frame_receive(&self, src: &SocketAddress, bytes: &[u8]) {
        let frame = Frame::from_bytes(bytes);
        if let Some(client) = &self.client {
            client.receive(self, src, &frame);
        } else if let Some(server) = &self.server {
            server.receive(self, src, &frame);
        }
    }

    /// Advance the media plane by one tick. Normally driven by the
    /// timer thread; exposed so tests can step deterministically.
    /// Returns whether the server still has valid participants (always
    /// true in client mode).
    pub fn run_tick(&self) -> bool {
        let active = if let Some(client) = &self.client {
            client.tick(self);
            true
        } else if let Some(server) = &self.server {
            server.tick(self)
        } else {
            false
        };
        self.ticks.fetch_add(1, Ordering::Relaxed);
        active
    }

    /// Bind the UDP sockets and start the receive, worker and timer
    /// threads. Threads live for the process.
    pub fn start(self: &Arc<Self>) -> Result<(), SocketError> {
        if let Some(server) = &self.server {
            for ipv6 in [false, true] {
                let mut transports = Vec::with_capacity(PORTS_MAX);
                let mut bound = true;
                for i in 0..PORTS_MAX {
                    match socket::bind_udp(
                        ipv6,
                        self.config.port.wrapping_add(i as u16),
                        self.config.udp_buffer_size,
                        1,
                    ) {
                        Ok((sock, _)) => {
                            self.spawn_receive(sock.clone());
                            transports.push(Transport::Udp(sock));
                        }
                        Err(err) => {
                            if ipv6 {
                                log::warn!("no IPv6 stripe {}: {}", i, err);
                                bound = false;
                                break;
                            }
                            return Err(err);
                        }
                    }
                }
                if bound {
                    server.install_stripe_transports(ipv6, transports);
                }
            }

            for shift in 1..server.executor.num_workers() {
                let rt = Arc::clone(self);
                std::thread::Builder::new()
                    .name(format!("jamlink-worker-{}", shift))
                    .spawn(move || worker_loop(rt, shift))
                    .map_err(SocketError::Thread)?;
            }
        } else if let Some(client) = &self.client {
            for ipv6 in [false, true] {
                match socket::bind_udp(ipv6, self.config.port, self.config.udp_buffer_size, 128) {
                    Ok((sock, port)) => {
                        log::debug!(
                            "client bound {} port {}",
                            if ipv6 { "IPv6" } else { "IPv4" },
                            port
                        );
                        self.spawn_receive(sock.clone());
                        client.install_transport(ipv6, Transport::Udp(sock));
                    }
                    Err(err) => {
                        if !ipv6 {
                            return Err(err);
                        }
                        log::warn!("no IPv6 socket: {}", err);
                    }
                }
            }
        }

        timer::spawn(Arc::clone(self)).map_err(SocketError::Thread)?;
        Ok(())
    }

    fn spawn_receive(self: &Arc<Self>, sock: Arc<std::net::UdpSocket>) {
        let rt = Arc::clone(self);
        let transport = Transport::Udp(sock.clone());
        let _ = std::thread::Builder::new()
            .name("jamlink-rx".to_string())
            .spawn(move || {
                socket::receive_loop(sock, transport, |src, bytes| {
                    rt.frame_receive(&src, &bytes[..]);
                });
            });
    }
}

fn worker_loop(rt: Arc<Runtime>, shift: usize) {
    let Some(server) = rt.server() else {
        return;
    };
    loop {
        let phase = server.executor.claim(shift);
        server.run_phase(&rt, phase, shift);
        server.executor.complete(shift);
    }
}
