//! Listen-only client on real audio hardware: joins a server and plays
//! the mix through the default cpal output device. The microphone side
//! stays silent, so this is a monitor seat in the session.
//!
//! Usage: cargo run --example cpal_listener [host]

use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};

use jamlink_engine::events::event_channel;
use jamlink_engine::{Config, ConnectConfig, Runtime};
use jamlink_proto::packet::kind;
use jamlink_proto::{DEFAULT_PORT, SAMPLE_RATE};

/// Samples handed to the engine per callback slice.
const CHUNK: usize = 96;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let (events_tx, events) = event_channel();
    let rt = Runtime::new_client(
        Config {
            port: 0,
            ..Config::default()
        },
        events_tx,
    );
    rt.start().expect("start client runtime");

    let client_rt = Arc::clone(&rt);
    let audio_host = cpal::default_host();
    let device = audio_host
        .default_output_device()
        .expect("no output device");
    let config = StreamConfig {
        channels: 2,
        sample_rate: SampleRate(SAMPLE_RATE as u32),
        buffer_size: BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                let Some(client) = client_rt.client() else {
                    data.fill(0.0);
                    return;
                };
                let mut left = [0.0f32; CHUNK];
                let mut right = [0.0f32; CHUNK];

                for frames in data.chunks_mut(2 * CHUNK) {
                    let n = frames.len() / 2;
                    left[..n].fill(0.0);
                    right[..n].fill(0.0);
                    client.sound_process(&mut left[..n], &mut right[..n]);
                    for (i, pair) in frames.chunks_exact_mut(2).enumerate() {
                        pair[0] = left[i];
                        pair[1] = right[i];
                    }
                }
            },
            |err| eprintln!("stream error: {}", err),
            None,
        )
        .expect("build output stream");
    stream.play().expect("start stream");

    let client = rt.client().expect("client runtime");
    client
        .connect(
            &rt,
            &ConnectConfig {
                host,
                port: DEFAULT_PORT,
                passwd: 0,
                name: "listener".to_string(),
                icon: Vec::new(),
                downlink_fmt: kind::AUDIO_16_BIT_2CH,
                uplink_fmt: kind::AUDIO_SILENCE,
                features: 0,
            },
        )
        .expect("connect");

    loop {
        match events.recv_timeout(Duration::from_secs(5)) {
            Ok(event) => println!("{:?}", event),
            Err(_) => println!("ping {} ms", client.ping_time()),
        }
    }
}
