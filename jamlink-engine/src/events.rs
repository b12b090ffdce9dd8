//! Typed events from the client tick to the embedding application.
//!
//! The protocol thread never blocks on the consumer: events go through
//! an unbounded channel and are dropped if the receiver is gone. A
//! headless receiver is enough for tests.

use crossbeam_channel::{unbounded, Receiver, Sender};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Chat line, already prefixed with the sender's name by the server.
    Chat(String),
    Lyrics(String),
    /// First fader reply carrying our own participant index.
    FaderSelf { index: u8 },
    FaderLevel { index: u8, left: f32, right: f32 },
    FaderGain { index: u8, gain: f32 },
    FaderPan { index: u8, pan: f32 },
    FaderName { index: u8, name: String },
    FaderIcon { index: u8, icon: Vec<u8> },
    FaderEq { index: u8, spec: String },
    FaderDisconnect { index: u8 },
    /// The reliable control stream timed out; the session was torn down.
    ControlTimeout,
}

/// Create the event channel handed to [`crate::Client`] at construction.
pub fn event_channel() -> (Sender<ClientEvent>, Receiver<ClientEvent>) {
    unbounded()
}
