//! End-to-end media-plane tests: a client runtime and a server runtime
//! wired back to back through in-process queue transports, stepped one
//! tick at a time.

use std::net::SocketAddr;

use crossbeam_channel::Receiver;

use jamlink_engine::events::event_channel;
use jamlink_engine::{
    BIT_MUTE, BIT_SOLO, ClientEvent, Config, ConnectConfig, Runtime, SocketAddress, Transport,
};
use jamlink_proto::output::OutputPacketizer;
use jamlink_proto::packet::{kind, PacketBuf, Ping};
use jamlink_proto::{DEF_SAMPLES, NOM_SAMPLES, PORTS_MAX};

const SERVER_PORT: u16 = 22124;

fn server_addr() -> SocketAddress {
    SocketAddress::from_addr(SocketAddr::from(([127, 0, 0, 1], SERVER_PORT)))
}

fn client_addr(port: u16) -> SocketAddress {
    SocketAddress::from_addr(SocketAddr::from(([127, 0, 0, 1], port)))
}

struct Loopback {
    server_rt: std::sync::Arc<Runtime>,
    client_rt: std::sync::Arc<Runtime>,
    events: Receiver<ClientEvent>,
    from_client: Receiver<(SocketAddr, Box<[u8]>)>,
    from_server: Receiver<(SocketAddr, Box<[u8]>)>,
}

fn loopback(server_config: Config) -> Loopback {
    let (client_tx, from_client) = crossbeam_channel::unbounded();
    let (server_tx, from_server) = crossbeam_channel::unbounded();

    let server_rt = Runtime::new_server(server_config);
    server_rt
        .server()
        .unwrap()
        .install_stripe_transports(false, vec![Transport::Queue(server_tx); PORTS_MAX]);

    let (events_tx, events) = event_channel();
    let client_rt = Runtime::new_client(Config::default(), events_tx);
    client_rt
        .client()
        .unwrap()
        .install_transport(false, Transport::Queue(client_tx));

    Loopback {
        server_rt,
        client_rt,
        events,
        from_client,
        from_server,
    }
}

impl Loopback {
    /// One paired tick: client, shuttle, server, shuttle back.
    fn step(&self) {
        self.client_rt.run_tick();
        while let Ok((_, bytes)) = self.from_client.try_recv() {
            self.server_rt.frame_receive(&client_addr(50001), &bytes);
        }
        self.server_rt.run_tick();
        while let Ok((_, bytes)) = self.from_server.try_recv() {
            self.client_rt.frame_receive(&server_addr(), &bytes);
        }
    }

    fn drain_events(&self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn connect_config() -> ConnectConfig {
    ConnectConfig {
        host: "127.0.0.1".to_string(),
        port: SERVER_PORT,
        passwd: 0xfeed_beef,
        name: "alice".to_string(),
        icon: vec![1, 2, 3, 4],
        downlink_fmt: kind::AUDIO_16_BIT_2CH,
        uplink_fmt: kind::AUDIO_16_BIT_2CH,
        features: 0,
    }
}

#[test]
fn ping_handshake_creates_the_session() {
    let lb = loopback(Config {
        num_server_peers: 1,
        server_passwd: 0xfeed_beef,
        ..Config::default()
    });

    lb.client_rt
        .client()
        .unwrap()
        .connect(&lb.client_rt, &connect_config())
        .unwrap();

    for _ in 0..64 {
        lb.step();
    }

    let server = lb.server_rt.server().unwrap();
    {
        let peer = server.peer(0).lock();
        assert!(peer.valid, "handshake must activate peer 0");
        assert!(peer.allow_mixer_access);
    }

    // the control round-trip completed within a couple of ticks
    assert!(lb.client_rt.client().unwrap().ping_time() < 8);

    // the name echo tells the client its own index
    let events = lb.drain_events();
    assert!(events.contains(&ClientEvent::FaderSelf { index: 0 }));
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::FaderName { index: 0, name } if name == "alice")));
}

#[test]
fn wrong_password_is_ignored_silently() {
    let lb = loopback(Config {
        num_server_peers: 1,
        server_passwd: 0x1111_2222,
        ..Config::default()
    });

    let mut cfg = connect_config();
    cfg.passwd = 0xbad0_bad0;
    lb.client_rt
        .client()
        .unwrap()
        .connect(&lb.client_rt, &cfg)
        .unwrap();

    for _ in 0..64 {
        lb.step();
    }

    assert!(!lb.server_rt.server().unwrap().peer(0).lock().valid);
    // no reply of any kind reached the client
    assert!(lb.from_server.is_empty());
    assert_eq!(lb.client_rt.client().unwrap().ping_time(), 0);
}

#[test]
fn chat_comes_back_with_the_sender_name() {
    let lb = loopback(Config {
        num_server_peers: 2,
        ..Config::default()
    });

    lb.client_rt
        .client()
        .unwrap()
        .connect(&lb.client_rt, &connect_config())
        .unwrap();

    // let the opening control burst (ping, configure, name, icon) settle
    for _ in 0..64 {
        lb.step();
    }
    lb.drain_events();

    lb.client_rt.client().unwrap().send_chat("tune up!");
    for _ in 0..64 {
        lb.step();
    }

    let events = lb.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ClientEvent::Chat(text) if text == "[alice]: tune up!")),
        "events: {:?}",
        events
    );
}

#[test]
fn audio_round_trips_through_the_mix() {
    let lb = loopback(Config {
        num_server_peers: 1,
        ..Config::default()
    });

    let client = lb.client_rt.client().unwrap();
    client.connect(&lb.client_rt, &connect_config()).unwrap();

    let mut peak_out = 0.0f32;
    for i in 0..400 {
        // the device callback delivers one tick of a loud sine
        let mut left: Vec<f32> = (0..DEF_SAMPLES)
            .map(|s| {
                let n = (i * DEF_SAMPLES + s) as f32;
                0.5 * (std::f32::consts::TAU * 440.0 * n / 48000.0).sin()
            })
            .collect();
        let mut right = left.clone();
        client.sound_process(&mut left, &mut right);

        for &v in &left {
            peak_out = peak_out.max(v.abs());
        }
        lb.step();
    }

    // the server decoded our uplink audio
    let server = lb.server_rt.server().unwrap();
    let level = server.peer(0).lock().in_level[0].get_level();
    assert!(level > 0.1, "server input level {}", level);

    // and the downlink mix made it back into the callback output
    assert!(peak_out > 0.1, "client heard nothing of the mix");
}

/// Drives a bare protocol endpoint against the server, no client
/// runtime involved.
struct FakeClient {
    out: OutputPacketizer,
    src: SocketAddress,
    value: f32,
}

impl FakeClient {
    fn new(port: u16, passwd: u64, value: f32) -> Self {
        let mut out = OutputPacketizer::new();
        let mut pkt = PacketBuf::new();
        pkt.put_ping(
            kind::PING_REQUEST,
            Ping {
                packets: 0,
                time_ms: 0,
                passwd,
                features: 0,
            },
        );
        out.queue_pkt(pkt);
        Self {
            out,
            src: client_addr(port),
            value,
        }
    }

    fn pump(&mut self, rt: &Runtime, tick: u16) {
        if !self.out.is_xor_frame() {
            let samples = [self.value; NOM_SAMPLES];
            let mut pkt = PacketBuf::new();
            pkt.put_16bit_2ch(&samples, &samples);
            self.out.append_pkt(&pkt);
        }
        let (frame, bytes, _) = self.out.emit(tick);
        rt.frame_receive(&self.src, &frame.as_bytes()[..bytes]);
    }
}

#[test]
fn retransmitted_control_is_delivered_once() {
    let (server_tx, from_server) = crossbeam_channel::unbounded();
    let rt = Runtime::new_server(Config {
        num_server_peers: 2,
        ..Config::default()
    });
    let server = rt.server().unwrap();
    server.install_stripe_transports(false, vec![Transport::Queue(server_tx); PORTS_MAX]);

    // activation scans from the top: A lands in slot 1, B in slot 0
    let mut a = FakeClient::new(40001, 0, 0.0);
    let mut b = FakeClient::new(40002, 0, 0.0);
    a.pump(&rt, 0);
    b.pump(&rt, 0);
    rt.run_tick();
    assert_eq!(server.peer(1).lock().output_pkt.peer_seqno(), 1);

    // the same chat control packet in two wire frames, as a
    // retransmission would produce it
    let mut chat = PacketBuf::new();
    chat.put_raw_data(kind::CHAT_REQUEST, b"once only", 0);
    chat.set_seq_local(1);
    chat.set_seq_peer(0);

    for seq in [1u8, 3u8] {
        let mut frame = jamlink_proto::frame::Frame::new();
        frame.set_sequence(seq);
        assert!(frame.push_packet(&chat));
        rt.frame_receive(&client_addr(40001), frame.as_bytes());
    }

    for tick in 1..80u16 {
        // B acknowledges whatever the server has in flight so its
        // reliable queue keeps draining towards the chat reply
        let pend = server.peer(0).lock().output_pkt.pend_seqno();
        if !b.out.is_xor_frame() {
            let mut ack = PacketBuf::new();
            ack.put_silence(0);
            ack.set_kind(kind::ACK);
            ack.set_seq_peer(pend);
            b.out.append_pkt(&ack);
        }
        b.pump(&rt, tick);
        rt.run_tick();
    }

    // delivered to the application exactly once: the reliable stream
    // advanced past ping + chat and no further
    assert_eq!(server.peer(1).lock().output_pkt.peer_seqno(), 2);

    // and exactly one reply got queued for the other participant (the
    // wire may carry it several times until it is acknowledged)
    let b_addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], 40002));
    let mut reply_frames = 0;
    while let Ok((dst, bytes)) = from_server.try_recv() {
        if dst != b_addr {
            continue;
        }
        let frame = jamlink_proto::frame::Frame::from_bytes(&bytes);
        if frame.packets().any(|p| p.kind() == kind::CHAT_REPLY) {
            reply_frames += 1;
        }
    }
    assert!(reply_frames >= 1);
}

#[test]
fn mixer_bits_shape_each_peers_mix() {
    let rt = Runtime::new_server(Config {
        num_server_peers: 3,
        ..Config::default()
    });
    let server = rt.server().unwrap();

    // activation scans slots from the top, so the first connection
    // lands in the last slot
    let mut a = FakeClient::new(40001, 0, 0.1);
    let mut b = FakeClient::new(40002, 0, 0.2);
    let mut c = FakeClient::new(40003, 0, 0.3);
    let (ia, ib, ic) = (2usize, 1usize, 0usize);

    for tick in 0..300u16 {
        a.pump(&rt, tick);
        b.pump(&rt, tick);
        c.pump(&rt, tick);
        rt.run_tick();
    }
    assert!(server.peer(ia).lock().valid);
    assert!(server.peer(ib).lock().valid);
    assert!(server.peer(ic).lock().valid);

    // tolerance covers mu-law quantisation plus the ping-pong fill's
    // slight decay when a ring momentarily runs dry
    let close = |x: f32, want: f32, what: &str| {
        assert!((x - want).abs() < 1e-2, "{}: got {} want {}", what, x, want);
    };

    // everyone hears the default mix
    close(
        server.peer(ia).lock().out_audio[0][10],
        0.1 + 0.2 + 0.3,
        "default mix",
    );

    // muting your own contribution removes exactly that share
    server.peer(ia).lock().bits[ia] = BIT_MUTE;
    for tick in 300..306u16 {
        a.pump(&rt, tick);
        b.pump(&rt, tick);
        c.pump(&rt, tick);
        rt.run_tick();
    }
    close(
        server.peer(ia).lock().out_audio[0][10],
        0.2 + 0.3,
        "self mute",
    );
    close(
        server.peer(ib).lock().out_audio[0][10],
        0.1 + 0.2 + 0.3,
        "unaffected peer",
    );

    // soloing one peer leaves only that contribution, at unity gain
    server.peer(ia).lock().bits[ia] = 0;
    server.peer(ia).lock().bits[ib] = BIT_SOLO;
    for tick in 306..312u16 {
        a.pump(&rt, tick);
        b.pump(&rt, tick);
        c.pump(&rt, tick);
        rt.run_tick();
    }
    close(server.peer(ia).lock().out_audio[0][10], 0.2, "solo");
}
