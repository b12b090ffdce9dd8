//! Headless client: joins a server without audio hardware and prints
//! the event stream.
//!
//! Usage: cargo run --example headless_client [host]

use std::time::Duration;

use jamlink_engine::events::event_channel;
use jamlink_engine::sound::{DummySoundBackend, SoundBackend};
use jamlink_engine::{Config, ConnectConfig, Runtime};
use jamlink_proto::packet::kind;
use jamlink_proto::{DEFAULT_PORT, FEATURE_MULTI_PORT};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let (events_tx, events) = event_channel();
    let rt = Runtime::new_client(
        Config {
            port: 0, // any local port
            ..Config::default()
        },
        events_tx,
    );

    if let Err(err) = rt.start() {
        eprintln!("cannot start client: {}", err);
        std::process::exit(1);
    }

    let mut backend = DummySoundBackend::new();
    if let Err(err) = backend.start(rt.clone(), 96) {
        eprintln!("cannot start sound backend: {}", err);
        std::process::exit(1);
    }

    let client = rt.client().expect("client runtime");
    if let Err(err) = client.connect(
        &rt,
        &ConnectConfig {
            host,
            port: DEFAULT_PORT,
            passwd: 0,
            name: "headless".to_string(),
            icon: Vec::new(),
            downlink_fmt: kind::AUDIO_16_BIT_2CH,
            uplink_fmt: kind::AUDIO_16_BIT_2CH,
            features: FEATURE_MULTI_PORT,
        },
    ) {
        eprintln!("cannot connect: {}", err);
        std::process::exit(1);
    }

    client.send_chat("hello from the headless client");

    loop {
        match events.recv_timeout(Duration::from_secs(5)) {
            Ok(event) => println!("{:?}", event),
            Err(_) => println!("ping {} ms", client.ping_time()),
        }
    }
}
