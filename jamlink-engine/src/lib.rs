//! The jamlink media plane.
//!
//! A central mixing server and its clients exchange 2048-byte UDP frames
//! on a 1 ms wall-clock tick. The server composes a personalised mix for
//! every participant; clients run a symmetric DSP path between the audio
//! device callback and the wire. This crate owns the peers, the
//! scheduler, the worker pool and the socket plumbing; the wire format
//! lives in `jamlink-proto` and the signal chain in `jamlink-dsp`.

pub mod client;
pub mod events;
pub mod executor;
pub mod media;
pub mod runtime;
pub mod server;
pub mod socket;
pub mod sound;
pub mod timer;

pub use client::{Client, ClientPeer, ConnectConfig};
pub use events::ClientEvent;
pub use runtime::{Config, Runtime};
pub use server::{Server, ServerPeer};
pub use socket::{SocketAddress, Transport};

/// Mixer bits, one byte per (viewer, subject) pair.
pub const BIT_MUTE: u8 = 1 << 0;
pub const BIT_SOLO: u8 = 1 << 1;
pub const BIT_INVERT: u8 = 1 << 2;

/// Pack a signed 5-bit gain index into the upper bits of a mixer byte.
pub const fn bit_gain_set(gain: i8) -> u8 {
    ((gain as u8) & 31) << 3
}
