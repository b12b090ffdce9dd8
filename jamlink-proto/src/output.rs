//! Outgoing framer with XOR forward error correction and the reliable
//! control sub-stream.
//!
//! Audio and MIDI sub-packets are appended straight into the current
//! frame and forgotten. Control packets go through a one-outstanding
//! stop-and-wait queue: the packet in flight is retransmitted every 64
//! ticks until the peer's ACK (piggybacked on any sub-packet) matches,
//! with a soft watchdog after 1000 ticks of no progress and a hard
//! timeout after 2000. Every third frame carries the XOR of the two
//! preceding data frames, truncated to the longer of the two.

use std::collections::VecDeque;

use crate::frame::Frame;
use crate::packet::PacketBuf;
use crate::{FRAME_BYTES, RED_MAX, SEQ_MAX};

/// Ticks between retransmissions of the packet in flight.
const RETRANSMIT_TICKS: u16 = 64;

/// Ticks of no ACK progress before the soft watchdog fires.
const WATCHDOG_TICKS: u16 = 1000;

/// Ticks of no ACK progress before the connection is considered dead.
const TIMEOUT_TICKS: u16 = 2000;

/// Idle sentinel; the counter parks here so neither threshold re-fires.
const PEND_IDLE: u16 = 65535;

/// Signal raised by [`OutputPacketizer::emit`]. Policy belongs to the
/// caller: a watchdog usually queues a keep-alive ping, a timeout tears
/// the session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    None,
    Watchdog,
    Timeout,
}

pub struct OutputPacketizer {
    current: Frame,
    mask: Frame,
    queue: VecDeque<PacketBuf>,
    pending: Option<PacketBuf>,
    start_time: u16,
    ping_time: u16,
    pend_count: u16,
    pend_seqno: u8,
    peer_seqno: u8,
    seqno: u8,
    send_ack: bool,
    offset: usize,
    d_len: usize,
}

impl Default for OutputPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputPacketizer {
    pub fn new() -> Self {
        Self {
            current: Frame::new(),
            mask: Frame::new(),
            queue: VecDeque::new(),
            pending: None,
            start_time: 0,
            ping_time: 0,
            pend_count: PEND_IDLE,
            pend_seqno: 0,
            peer_seqno: 0,
            seqno: 0,
            send_ack: false,
            offset: 0,
            d_len: 0,
        }
    }

    pub fn init(&mut self) {
        *self = Self::new();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Sequence number of the frame `emit` will produce next.
    pub fn seqno(&self) -> u8 {
        self.seqno
    }

    /// Local sequence the next queued control packet will be stamped with.
    pub fn pend_seqno(&self) -> u8 {
        self.pend_seqno
    }

    /// Next expected control sequence from the peer.
    pub fn peer_seqno(&self) -> u8 {
        self.peer_seqno
    }

    /// Round-trip time of the last acknowledged control packet, in ticks.
    pub fn ping_time(&self) -> u16 {
        self.ping_time
    }

    /// Look for a queued control packet of the given type.
    pub fn find(&self, kind: u8) -> Option<&PacketBuf> {
        self.queue.iter().find(|p| p.kind() == kind)
    }

    /// Queue a control packet for reliable delivery.
    pub fn queue_pkt(&mut self, pkt: PacketBuf) {
        self.queue.push_back(pkt);
    }

    /// Queue a control packet, replacing a queued packet of the same
    /// type instead of adding a duplicate.
    pub fn queue_or_replace(&mut self, pkt: PacketBuf) {
        if let Some(slot) = self.queue.iter_mut().find(|p| p.kind() == pkt.kind()) {
            *slot = pkt;
        } else {
            self.queue.push_back(pkt);
        }
    }

    /// Append an unsequenced sub-packet (audio, MIDI) to the current
    /// frame. Returns false when the frame is full.
    pub fn append_pkt(&mut self, pkt: &PacketBuf) -> bool {
        let remainder = FRAME_BYTES - 1 - self.offset;
        let len = pkt.bytes();
        if len <= remainder {
            let body = self.current.body_mut();
            body[self.offset..self.offset + len].copy_from_slice(pkt.as_bytes());
            self.offset += len;
            true
        } else {
            false
        }
    }

    fn append_ack(&mut self) -> bool {
        let remainder = FRAME_BYTES - 1 - self.offset;
        if 4 <= remainder {
            let peer_seqno = self.peer_seqno;
            let body = self.current.body_mut();
            body[self.offset] = 1;
            body[self.offset + 1] = crate::packet::kind::ACK;
            body[self.offset + 2] = 0;
            body[self.offset + 3] = peer_seqno;
            self.offset += 4;
            true
        } else {
            false
        }
    }

    /// Request an ACK for `peer_seqno` in the next data frame.
    pub fn set_send_ack(&mut self) {
        self.send_ack = true;
    }

    /// Advance the expected peer sequence after delivering a control
    /// packet to the application.
    pub fn advance_peer_seqno(&mut self) {
        self.peer_seqno = self.peer_seqno.wrapping_add(1);
    }

    /// The peer acknowledged the packet in flight: drop it and record
    /// the round-trip time.
    pub fn advance(&mut self, ticks: u16) {
        if self.pending.is_none() {
            return;
        }
        self.pending = None;
        self.ping_time = ticks.wrapping_sub(self.start_time);
    }

    pub fn is_xor_frame(&self) -> bool {
        (self.seqno as usize % RED_MAX) == RED_MAX - 1
    }

    /// Finalize and return the next frame to put on the wire, with the
    /// number of meaningful bytes and any watchdog signal. Must be
    /// called exactly once per tick.
    pub fn emit(&mut self, ticks: u16) -> (Frame, usize, ControlSignal) {
        let mut signal = ControlSignal::None;
        let frame;
        let bytes;

        if self.is_xor_frame() {
            self.mask.set_sequence(self.seqno);
            frame = self.mask.clone();
            bytes = self.d_len + 1;
            self.mask.clear();
            self.d_len = 0;
        } else {
            if self.pending.is_none() {
                if let Some(mut pkt) = self.queue.pop_front() {
                    pkt.set_seq_local(self.pend_seqno);
                    pkt.set_seq_peer(self.peer_seqno);
                    self.start_time = ticks;
                    self.pend_seqno = self.pend_seqno.wrapping_add(1);
                    if self.append_pkt(&pkt) {
                        self.send_ack = false;
                    }
                    self.pend_count = 1;
                    self.pending = Some(pkt);
                } else if self.pend_count != PEND_IDLE {
                    self.pend_count += 1;
                }
            } else if self.pend_count % RETRANSMIT_TICKS == 0 {
                if let Some(mut pkt) = self.pending.take() {
                    pkt.set_seq_peer(self.peer_seqno);
                    if self.append_pkt(&pkt) {
                        self.send_ack = false;
                    }
                    self.pending = Some(pkt);
                }
                self.pend_count += 1;
            } else if self.pend_count != PEND_IDLE {
                self.pend_count += 1;
            }

            if self.pend_count == WATCHDOG_TICKS {
                signal = ControlSignal::Watchdog;
            } else if self.pend_count == TIMEOUT_TICKS {
                signal = ControlSignal::Timeout;
            }

            if self.send_ack && self.append_ack() {
                self.send_ack = false;
            }

            self.current.set_sequence(self.seqno);
            frame = self.current.clone();
            bytes = self.offset + 1;
            self.mask.xor_assign(&self.current);
            self.current.clear();
            if self.d_len < self.offset {
                self.d_len = self.offset;
            }
            self.offset = 0;
        }

        self.seqno = ((self.seqno as usize + 1) % SEQ_MAX) as u8;
        (frame, bytes, signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{kind, PacketBuf, Ping};

    fn ping_pkt(time_ms: u16) -> PacketBuf {
        let mut pkt = PacketBuf::new();
        pkt.put_ping(
            kind::PING_REQUEST,
            Ping {
                packets: 0,
                time_ms,
                passwd: 0,
                features: 0,
            },
        );
        pkt
    }

    #[test]
    fn xor_frame_every_third() {
        let mut out = OutputPacketizer::new();
        for seq in 0..SEQ_MAX as u16 {
            assert_eq!(out.is_xor_frame(), seq % 3 == 2);
            let (frame, _, _) = out.emit(seq);
            assert_eq!(frame.sequence() as u16, seq % SEQ_MAX as u16);
        }
        // sequence wraps to zero after a full cycle
        assert_eq!(out.seqno(), 0);
    }

    #[test]
    fn xor_frame_reconstructs_lost_data_frame() {
        let mut out = OutputPacketizer::new();

        let mut a = PacketBuf::new();
        a.put_silence(48);
        out.append_pkt(&a);
        let (d0, _, _) = out.emit(0);

        let mut b = PacketBuf::new();
        b.put_midi(&[0x90, 0x3c, 0x40]);
        out.append_pkt(&b);
        let (d1, _, _) = out.emit(1);

        let (x, _, _) = out.emit(2);

        // xor frame combined with d0 reproduces d1's body
        let mut rec = x.clone();
        rec.xor_assign(&d0);
        assert_eq!(&rec.as_bytes()[1..], &d1.as_bytes()[1..]);
    }

    #[test]
    fn control_packet_sent_once_and_retransmitted() {
        let mut out = OutputPacketizer::new();
        out.queue_pkt(ping_pkt(99));

        let mut transmissions = 0;
        for tick in 0..200u16 {
            let (frame, _, _) = out.emit(tick);
            if frame
                .packets()
                .any(|p| p.kind() == kind::PING_REQUEST)
            {
                transmissions += 1;
            }
        }
        // initial transmission plus retransmits every 64 ticks; XOR
        // frames never carry new control data directly
        assert!(transmissions >= 2);
        assert_eq!(out.pend_seqno(), 1);
    }

    #[test]
    fn ack_clears_pending_and_records_ping_time() {
        let mut out = OutputPacketizer::new();
        out.queue_pkt(ping_pkt(5));
        let _ = out.emit(10);
        assert_eq!(out.pend_seqno(), 1);

        out.advance(14);
        assert_eq!(out.ping_time(), 4);

        // advancing again without a pending packet changes nothing
        out.advance(100);
        assert_eq!(out.ping_time(), 4);
    }

    #[test]
    fn watchdog_then_timeout() {
        let mut out = OutputPacketizer::new();
        out.queue_pkt(ping_pkt(1));

        let mut watchdog_at = None;
        let mut timeout_at = None;
        // the pending counter only advances on data frames, so the
        // thresholds land at roughly 1.5x their tick value in wall time
        for tick in 0..3200u16 {
            let (_, _, signal) = out.emit(tick);
            match signal {
                ControlSignal::Watchdog => watchdog_at = Some(tick),
                ControlSignal::Timeout => timeout_at = Some(tick),
                ControlSignal::None => {}
            }
        }
        // the counter only advances on data frames; thresholds land a
        // little late in wall ticks but fire exactly once each
        assert!(watchdog_at.is_some());
        assert!(timeout_at.is_some());
        assert!(watchdog_at.unwrap() < timeout_at.unwrap());
    }

    #[test]
    fn idle_counter_parks_without_signals() {
        let mut out = OutputPacketizer::new();
        for tick in 0..3000u16 {
            let (_, _, signal) = out.emit(tick);
            assert_eq!(signal, ControlSignal::None);
        }
    }

    #[test]
    fn ack_is_piggybacked() {
        let mut out = OutputPacketizer::new();
        out.advance_peer_seqno();
        out.set_send_ack();
        let (frame, _, _) = out.emit(0);
        let ack = frame
            .packets()
            .find(|p| p.kind() == kind::ACK)
            .expect("ack sub-packet");
        assert_eq!(ack.seq_peer(), 1);
    }

    #[test]
    fn frame_length_tracks_content() {
        let mut out = OutputPacketizer::new();
        let mut pkt = PacketBuf::new();
        pkt.put_silence(72);
        out.append_pkt(&pkt);
        let (_, bytes, _) = out.emit(0);
        assert_eq!(bytes, 1 + pkt.bytes());
    }
}
