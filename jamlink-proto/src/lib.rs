//! Wire protocol for the jamlink real-time media plane.
//!
//! Every datagram is a fixed 2048-byte frame carrying a one-byte sequence
//! number and a run of 4-byte-aligned sub-packets. Audio rides unsequenced
//! and loss-tolerant; every third frame is the XOR of the two preceding data
//! frames, so a single loss per triple is recoverable. Control messages use
//! an independent stop-and-wait sub-stream with ACK piggybacking on top of
//! the same frames.

pub mod frame;
pub mod input;
pub mod jitter;
pub mod mulaw;
pub mod output;
pub mod packet;

/// Audio sample rate. The protocol is fixed at 48 kHz.
pub const SAMPLE_RATE: usize = 48_000;

/// Samples per 1 ms tick.
pub const DEF_SAMPLES: usize = SAMPLE_RATE / 1000;

/// Nominal audio payload per data frame (1.5 ms window, two data frames
/// out of every three carry 3 ms of audio between them).
pub const NOM_SAMPLES: usize = (3 * SAMPLE_RATE) / (2 * 1000);

/// Maximum number of participants on a server.
pub const PEERS_MAX: usize = 256;

/// Redundancy grouping: two data frames followed by one XOR frame.
pub const RED_MAX: usize = 3;

/// Number of UDP ports striped across when multi-port is negotiated.
pub const PORTS_MAX: usize = 5 * RED_MAX;

/// Frame sequence modulus. Divisible by both the redundancy group size
/// and the rotation group size, so the [data, data, XOR] pattern tiles
/// the sequence ring exactly.
pub const SEQ_MAX: usize = 17 * PORTS_MAX;

/// Size of one UDP datagram. Fixed; unused trailer bytes are zero.
pub const FRAME_BYTES: usize = 2048;

/// Largest single sub-packet (255 length units of 4 bytes).
pub const MAX_PKT: usize = 255 * 4;

/// Feature bit: rotate the destination port per frame across
/// [`PORTS_MAX`] consecutive UDP ports.
pub const FEATURE_MULTI_PORT: u32 = 1 << 1;

/// Default UDP port of the mixing server.
pub const DEFAULT_PORT: u16 = 22124;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ring_tiles_redundancy_groups() {
        assert_eq!(SEQ_MAX % RED_MAX, 0);
        assert_eq!(SEQ_MAX % 5, 0);
        assert!(SEQ_MAX <= 255);
    }
}
