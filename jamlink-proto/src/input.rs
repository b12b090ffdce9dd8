//! Incoming frame reordering, XOR loss recovery and silence synthesis.
//!
//! Received frames are slotted by sequence number. Delivery walks the
//! ring from the rotation point that keeps reading contiguous with the
//! last delivered frame, classifying each slot by its position in the
//! [data, data, XOR] triple: data slots deliver directly or recover via
//! the triple's XOR frame; XOR slots are never delivered and retire the
//! triple's validity bits. When the consumer is running dry the walk
//! stops waiting and synthesizes a silence frame instead.

use crate::frame::Frame;
use crate::jitter::JitterStats;
use crate::packet::PacketBuf;
use crate::{RED_MAX, SEQ_MAX};

/// Slots per rotation group.
const NMAX: usize = 5;

/// Number of rotation groups in the sequence ring.
const BMAX: usize = SEQ_MAX / NMAX;

pub struct InputPacketizer {
    pub jitter: JitterStats,
    slots: Vec<Frame>,
    valid: [bool; SEQ_MAX],
    last_seqno: u8,
}

impl Default for InputPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl InputPacketizer {
    pub fn new() -> Self {
        Self {
            jitter: JitterStats::new(),
            slots: vec![Frame::new(); SEQ_MAX],
            valid: [false; SEQ_MAX],
            last_seqno: 0,
        }
    }

    pub fn init(&mut self) {
        self.jitter.clear();
        for slot in &mut self.slots {
            slot.clear();
        }
        self.valid = [false; SEQ_MAX];
        self.last_seqno = 0;
    }

    pub fn last_seqno(&self) -> u8 {
        self.last_seqno
    }

    /// Store a received frame. Frames arriving half a ring late are
    /// stale and dropped.
    pub fn receive(&mut self, frame: &Frame, ticks: u16) {
        let rx_seqno = frame.sequence() as usize;
        let delta = (SEQ_MAX + rx_seqno - self.last_seqno as usize) % SEQ_MAX;

        if delta >= SEQ_MAX / 2 {
            return;
        }

        self.slots[rx_seqno] = frame.clone();
        self.valid[rx_seqno] = true;
        self.jitter.rx_packet(ticks);
    }

    fn silence_frame() -> Frame {
        let mut frame = Frame::new();
        let pkt = PacketBuf::silence_nominal();
        frame.body_mut()[..pkt.bytes()].copy_from_slice(pkt.as_bytes());
        frame
    }

    /// Deliver the next frame in sequence, if possible.
    ///
    /// A delivered frame is either the received frame, an XOR-recovered
    /// frame, or - only when `low_water` trades latency for continuity -
    /// a synthesized silence frame. Returns `None` while it is still
    /// worth waiting for the network.
    pub fn first_pkt(&mut self, low_water: bool) -> Option<Frame> {
        let mut mask: u64 = 0;
        for x in 0..BMAX {
            for y in 0..NMAX {
                if self.valid[NMAX * x + y] {
                    mask |= 1u64 << x;
                    break;
                }
            }
        }

        if mask == 0 {
            return None;
        }

        // try to continue at the last sequence number
        mask |= 1u64 << (self.last_seqno as usize / NMAX);

        // the rotation yielding the smallest value marks where the
        // occupied groups begin
        let mut start = mask;
        let mut min_x = 0;
        for x in 0..BMAX {
            if start > mask {
                start = mask;
                min_x = x;
            }
            if mask & 1 != 0 {
                mask >>= 1;
                mask |= 1u64 << (BMAX - 1);
            } else {
                mask >>= 1;
            }
        }

        let begin = min_x * NMAX;
        let mut x = begin;
        loop {
            let delta = (SEQ_MAX + x - self.last_seqno as usize) % SEQ_MAX;
            let fresh = delta < SEQ_MAX / 2;

            match x % RED_MAX {
                0 | 1 => {
                    if fresh {
                        let (data_slot, xor_slot) = if x % RED_MAX == 0 {
                            (x + 1, x + 2)
                        } else {
                            (x - 1, x + 1)
                        };

                        if self.valid[x] {
                            self.last_seqno = ((x + 1) % SEQ_MAX) as u8;
                            return Some(self.slots[x].clone());
                        } else if self.valid[data_slot] && self.valid[xor_slot] {
                            // the triple's XOR frame combined with the
                            // surviving data frame reproduces this one
                            self.last_seqno = ((x + 1) % SEQ_MAX) as u8;
                            let mut recovered = self.slots[xor_slot].clone();
                            recovered.xor_assign(&self.slots[data_slot]);
                            self.jitter.rx_recover();
                            return Some(recovered);
                        } else if low_water {
                            self.last_seqno = ((x + 1) % SEQ_MAX) as u8;
                            self.jitter.rx_damage();
                            return Some(Self::silence_frame());
                        } else {
                            // wait a bit for the packet
                            return None;
                        }
                    }
                }
                _ => {
                    if fresh {
                        self.last_seqno = ((x + 1) % SEQ_MAX) as u8;
                    }
                    self.valid[x - 2] = false;
                    self.valid[x - 1] = false;
                    self.valid[x] = false;
                }
            }

            x = (x + 1) % SEQ_MAX;
            if x == begin {
                break;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputPacketizer;
    use crate::packet::{kind, PacketBuf};
    use crate::NOM_SAMPLES;

    fn emit_frames(count: usize) -> Vec<(Frame, usize)> {
        let mut out = OutputPacketizer::new();
        let mut frames = Vec::new();
        for tick in 0..count as u16 {
            if !out.is_xor_frame() {
                let mut pkt = PacketBuf::new();
                pkt.put_midi(&[0x90, 0x30 + (tick as u8 & 0x0f), 0x40]);
                out.append_pkt(&pkt);
            }
            let (frame, bytes, _) = out.emit(tick);
            frames.push((frame, bytes));
        }
        frames
    }

    fn first_midi_note(frame: &Frame) -> Option<u8> {
        frame.packets().find_map(|p| {
            if p.kind() == kind::MIDI_PACKET {
                let mut buf = [0u8; 8];
                let n = p.get_midi(&mut buf)?;
                if n >= 2 {
                    return Some(buf[1]);
                }
            }
            None
        })
    }

    #[test]
    fn in_order_delivery_skips_xor_slots() {
        let mut input = InputPacketizer::new();
        let frames = emit_frames(9);

        let mut delivered = Vec::new();
        for (tick, (frame, _)) in frames.iter().enumerate() {
            input.receive(frame, tick as u16);
            while let Some(got) = input.first_pkt(false) {
                delivered.push(got);
            }
        }

        // six data frames out of nine; XOR slots never surface
        assert_eq!(delivered.len(), 6);
        assert_eq!(input.jitter.packet_damage(), 0);
        assert_eq!(input.jitter.packet_recover(), 0);
        for (i, frame) in delivered.iter().enumerate() {
            let seq = frame.sequence() as usize;
            assert_ne!(seq % RED_MAX, RED_MAX - 1, "frame {} was an XOR slot", i);
        }
    }

    #[test]
    fn single_loss_is_recovered_from_xor() {
        let mut input = InputPacketizer::new();
        let frames = emit_frames(3);

        // deliver D0, drop D1, deliver X
        input.receive(&frames[0].0, 0);
        let d0 = input.first_pkt(false).expect("d0");
        assert_eq!(first_midi_note(&d0), first_midi_note(&frames[0].0));

        input.receive(&frames[2].0, 2);
        let d1 = input.first_pkt(false).expect("recovered d1");
        assert_eq!(first_midi_note(&d1), first_midi_note(&frames[1].0));
        assert_eq!(input.jitter.packet_recover(), 1);
    }

    #[test]
    fn double_loss_yields_silence_under_low_water() {
        let mut input = InputPacketizer::new();
        let frames = emit_frames(6);

        // drop D0 and D1 of the first triple entirely; deliver X and the
        // next triple so the reader has a reason to advance
        input.receive(&frames[2].0, 2);
        input.receive(&frames[3].0, 3);

        // without pressure the reader waits
        assert!(input.first_pkt(false).is_none());

        // under low-water pressure both holes fill with silence
        for _ in 0..2 {
            let frame = input.first_pkt(true).expect("silence frame");
            let silence = frame
                .packets()
                .find(|p| p.kind() == kind::AUDIO_SILENCE)
                .expect("silence packet");
            assert_eq!(silence.get_silence(), NOM_SAMPLES);
        }
        assert_eq!(input.jitter.packet_damage(), 2);

        // the next triple's data frame follows in order
        let next = input.first_pkt(false).expect("d3");
        assert_eq!(first_midi_note(&next), first_midi_note(&frames[3].0));
    }

    #[test]
    fn stale_frames_are_dropped() {
        let mut input = InputPacketizer::new();
        let frames = emit_frames(6);

        for (tick, (frame, _)) in frames.iter().enumerate() {
            input.receive(frame, tick as u16);
        }
        while input.first_pkt(false).is_some() {}
        let last = input.last_seqno();

        // replaying an already-consumed frame does not rewind
        input.receive(&frames[0].0, 10);
        assert_eq!(input.last_seqno(), last);
        assert!(input.first_pkt(false).is_none());
    }

    #[test]
    fn sequence_advances_monotonically_mod_ring() {
        let mut input = InputPacketizer::new();
        let frames = emit_frames(SEQ_MAX + 6);

        let mut expected = 0usize;
        for (tick, (frame, _)) in frames.iter().enumerate() {
            input.receive(frame, tick as u16);
            while let Some(got) = input.first_pkt(false) {
                assert_eq!(got.sequence() as usize, expected);
                expected = (expected + 1) % SEQ_MAX;
                if expected % RED_MAX == RED_MAX - 1 {
                    expected = (expected + 1) % SEQ_MAX;
                }
            }
        }
        assert!(expected > 0);
    }

    #[test]
    fn recovery_then_next_triple_loss() {
        // pins the cascade behaviour: D0 lost and recovered via XOR,
        // then the next triple loses a data frame as well
        let mut input = InputPacketizer::new();
        let frames = emit_frames(6);

        input.receive(&frames[1].0, 1);
        input.receive(&frames[2].0, 2);

        let d0 = input.first_pkt(false).expect("recovered d0");
        assert_eq!(first_midi_note(&d0), first_midi_note(&frames[0].0));
        assert_eq!(input.jitter.packet_recover(), 1);

        let d1 = input.first_pkt(false).expect("d1");
        assert_eq!(first_midi_note(&d1), first_midi_note(&frames[1].0));

        // next triple: D3 lost, D4 + X5 arrive
        input.receive(&frames[4].0, 4);
        input.receive(&frames[5].0, 5);

        let d3 = input.first_pkt(false).expect("recovered d3");
        assert_eq!(first_midi_note(&d3), first_midi_note(&frames[3].0));
        assert_eq!(input.jitter.packet_recover(), 2);
    }
}
