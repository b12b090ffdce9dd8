//! Minimal mixing server.
//!
//! Binds the default port range and mixes for up to 16 participants.
//!
//! Usage: cargo run --example server
//! Connect clients with the headless_client example.

use std::sync::Arc;
use std::time::Duration;

use jamlink_engine::{Config, Runtime};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let rt = Runtime::new_server(Config {
        num_server_peers: 16,
        num_workers: 2,
        welcome_lines: vec!["welcome to the jam".to_string()],
        ..Config::default()
    });

    if let Err(err) = rt.start() {
        eprintln!("cannot start server: {}", err);
        std::process::exit(1);
    }

    println!("server listening on UDP {}", rt.config.port);
    keep_alive(rt);
}

fn keep_alive(_rt: Arc<Runtime>) {
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
