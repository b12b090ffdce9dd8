//! Sub-packet codec.
//!
//! Every sub-packet sits on a 4-byte grid: `length` (in 4-byte units),
//! `type`, `seq_local`, `seq_peer`, then `4 * (length - 1)` payload bytes.
//! A zero length terminates a frame. Audio payloads are µ-law companded;
//! control payloads are little-endian scalar fields. Decoders return
//! `Option` and reject short packets without touching any state.

use crate::mulaw::{self, MUL_16, MUL_24, MUL_32, MUL_8};
use crate::mulaw::{SCALE_16, SCALE_24, SCALE_32, SCALE_8};
use crate::{MAX_PKT, NOM_SAMPLES};

/// Wire discriminants for the `type` byte.
pub mod kind {
    pub const END: u8 = 0;
    pub const AUDIO_8_BIT_1CH: u8 = 1;
    pub const AUDIO_8_BIT_2CH: u8 = 2;
    pub const AUDIO_16_BIT_1CH: u8 = 3;
    pub const AUDIO_16_BIT_2CH: u8 = 4;
    pub const AUDIO_24_BIT_1CH: u8 = 5;
    pub const AUDIO_24_BIT_2CH: u8 = 6;
    pub const AUDIO_32_BIT_1CH: u8 = 7;
    pub const AUDIO_32_BIT_2CH: u8 = 8;
    /// Types up to here are reserved for future audio encodings and are
    /// accepted but ignored.
    pub const AUDIO_MAX: u8 = 60;
    pub const MIDI_PACKET: u8 = 61;
    pub const AUDIO_SILENCE: u8 = 62;
    pub const ACK: u8 = 63;
    pub const CONFIGURE_REQUEST: u8 = 64;
    pub const PING_REQUEST: u8 = 65;
    pub const PING_REPLY: u8 = 66;
    pub const ICON_REQUEST: u8 = 67;
    pub const NAME_REQUEST: u8 = 68;
    pub const LYRICS_REQUEST: u8 = 69;
    pub const LYRICS_REPLY: u8 = 70;
    pub const CHAT_REQUEST: u8 = 71;
    pub const CHAT_REPLY: u8 = 72;
    pub const FADER_GAIN_REQUEST: u8 = 73;
    pub const FADER_GAIN_REPLY: u8 = 74;
    pub const FADER_PAN_REQUEST: u8 = 75;
    pub const FADER_PAN_REPLY: u8 = 76;
    pub const FADER_BITS_REQUEST: u8 = 77;
    pub const FADER_BITS_REPLY: u8 = 78; /* unused */
    pub const FADER_ICON_REPLY: u8 = 79;
    pub const FADER_NAME_REPLY: u8 = 80;
    pub const FADER_LEVEL_REPLY: u8 = 81;
    pub const FADER_EQ_REQUEST: u8 = 82;
    pub const FADER_EQ_REPLY: u8 = 83;
    pub const FADER_DISCONNECT_REPLY: u8 = 84;
    pub const LOCAL_GAIN_REPLY: u8 = 85;
    pub const LOCAL_PAN_REPLY: u8 = 86;
    pub const LOCAL_EQ_REPLY: u8 = 87;
}

/// Decoded ping payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub packets: u16,
    pub time_ms: u16,
    pub passwd: u64,
    pub features: u32,
}

/// Borrowed, length-validated view of one sub-packet inside a frame.
#[derive(Clone, Copy)]
pub struct PacketRef<'a> {
    raw: &'a [u8],
}

impl<'a> PacketRef<'a> {
    /// Wrap a slice spanning exactly the packet (`4 * length` bytes).
    pub(crate) fn new(raw: &'a [u8]) -> Self {
        debug_assert!(raw.len() >= 4 && raw.len() % 4 == 0);
        Self { raw }
    }

    pub fn len_words(&self) -> usize {
        self.raw[0] as usize
    }

    pub fn kind(&self) -> u8 {
        self.raw[1]
    }

    pub fn seq_local(&self) -> u8 {
        self.raw[2]
    }

    pub fn seq_peer(&self) -> u8 {
        self.raw[3]
    }

    fn payload(&self) -> &'a [u8] {
        &self.raw[4..]
    }

    fn get_s8(&self, offset: usize) -> i8 {
        self.raw[4 + offset] as i8
    }

    fn get_s16(&self, offset: usize) -> i16 {
        i16::from_le_bytes([self.raw[4 + offset], self.raw[4 + offset + 1]])
    }

    fn get_s24(&self, offset: usize) -> i32 {
        let mut temp = (self.raw[4 + offset] as i32)
            | ((self.raw[4 + offset + 1] as i32) << 8)
            | ((self.raw[4 + offset + 2] as i32) << 16);
        if temp & (1 << 23) != 0 {
            temp |= -(1 << 23);
        }
        temp
    }

    fn get_s32(&self, offset: usize) -> i32 {
        i32::from_le_bytes([
            self.raw[4 + offset],
            self.raw[4 + offset + 1],
            self.raw[4 + offset + 2],
            self.raw[4 + offset + 3],
        ])
    }

    pub fn get_8bit_1ch(&self, left: &mut [f32]) -> usize {
        let samples = (self.len_words() - 1) * 4;
        for x in 0..samples {
            left[x] = mulaw::decode(self.get_s8(x) as i32, SCALE_8);
        }
        samples
    }

    pub fn get_16bit_1ch(&self, left: &mut [f32]) -> usize {
        let samples = (self.len_words() - 1) * 2;
        for x in 0..samples {
            left[x] = mulaw::decode(self.get_s16(2 * x) as i32, SCALE_16);
        }
        samples
    }

    pub fn get_24bit_1ch(&self, left: &mut [f32]) -> usize {
        let samples = ((self.len_words() - 1) * 4) / 3;
        for x in 0..samples {
            left[x] = mulaw::decode(self.get_s24(3 * x), SCALE_24);
        }
        samples
    }

    pub fn get_32bit_1ch(&self, left: &mut [f32]) -> usize {
        let samples = self.len_words() - 1;
        for x in 0..samples {
            left[x] = mulaw::decode(self.get_s32(4 * x), SCALE_32);
        }
        samples
    }

    pub fn get_8bit_2ch(&self, left: &mut [f32], right: &mut [f32]) -> usize {
        let samples = (self.len_words() - 1) * 2;
        for x in 0..samples {
            left[x] = mulaw::decode(self.get_s8(x * 2) as i32, SCALE_8);
            right[x] = mulaw::decode(self.get_s8(x * 2 + 1) as i32, SCALE_8);
        }
        samples
    }

    pub fn get_16bit_2ch(&self, left: &mut [f32], right: &mut [f32]) -> usize {
        let samples = self.len_words() - 1;
        for x in 0..samples {
            left[x] = mulaw::decode(self.get_s16(x * 4) as i32, SCALE_16);
            right[x] = mulaw::decode(self.get_s16(x * 4 + 2) as i32, SCALE_16);
        }
        samples
    }

    pub fn get_24bit_2ch(&self, left: &mut [f32], right: &mut [f32]) -> usize {
        let samples = ((self.len_words() - 1) * 4) / 6;
        for x in 0..samples {
            left[x] = mulaw::decode(self.get_s24(x * 6), SCALE_24);
            right[x] = mulaw::decode(self.get_s24(x * 6 + 3), SCALE_24);
        }
        samples
    }

    pub fn get_32bit_2ch(&self, left: &mut [f32], right: &mut [f32]) -> usize {
        let samples = (self.len_words() - 1) / 2;
        for x in 0..samples {
            left[x] = mulaw::decode(self.get_s32(x * 8), SCALE_32);
            right[x] = mulaw::decode(self.get_s32(x * 8 + 4), SCALE_32);
        }
        samples
    }

    /// Silence sample count. Rides in the `seq_local` byte; the packet
    /// carries no payload words.
    pub fn get_silence(&self) -> usize {
        self.seq_local() as usize
    }

    /// Copy MIDI bytes out. The pad count lives in the low bits of
    /// `seq_local` so the exact byte count survives the 4-byte grid.
    pub fn get_midi(&self, dst: &mut [u8]) -> Option<usize> {
        if self.len_words() < 2 {
            return None;
        }
        let bytes = (self.len_words() - 1) * 4 - (self.seq_local() & 3) as usize;
        if bytes > dst.len() {
            return None;
        }
        dst[..bytes].copy_from_slice(&self.payload()[..bytes]);
        Some(bytes)
    }

    /// Decode a run of µ-law 16-bit floats with a mix selector and index
    /// base. Returns the number of values written into `values`.
    pub fn get_fader_value(&self, values: &mut [f32]) -> Option<(u8, u8, usize)> {
        if self.len_words() < 2 {
            return None;
        }
        let mix = self.get_s8(0) as u8;
        let index = self.get_s8(1) as u8;
        let mut num = 2 * (self.len_words() - 2);
        if self.get_s8(2) & 1 != 0 {
            if num == 0 {
                return None;
            }
            num -= 1;
        }
        if num > values.len() {
            return None;
        }
        for x in 0..num {
            values[x] = mulaw::decode(self.get_s16(4 + 2 * x) as i32, SCALE_16);
        }
        Some((mix, index, num))
    }

    /// Decode an opaque byte blob with a mix selector and index base.
    pub fn get_fader_data(&self) -> Option<(u8, u8, &'a [u8])> {
        if self.len_words() < 2 {
            return None;
        }
        let mix = self.get_s8(0) as u8;
        let index = self.get_s8(1) as u8;
        let mut len = (self.len_words() - 2) * 4;
        let flags = self.get_s8(2);
        if flags & 1 != 0 {
            if len == 0 {
                return None;
            }
            len -= 1;
        }
        if flags & 2 != 0 {
            if len < 2 {
                return None;
            }
            len -= 2;
        }
        Some((mix, index, &self.payload()[4..4 + len]))
    }

    /// Raw bytes including grid padding; callers trim trailing pad.
    pub fn get_raw_data(&self) -> Option<&'a [u8]> {
        if self.len_words() < 1 {
            return None;
        }
        let len = (self.len_words() - 1) * 4;
        Some(&self.payload()[..len])
    }

    pub fn get_configure(&self) -> Option<u8> {
        if self.len_words() < 2 {
            return None;
        }
        Some(self.get_s8(0) as u8)
    }

    pub fn get_ping(&self) -> Option<Ping> {
        if self.len_words() < 4 {
            return None;
        }
        let passwd = (self.get_s32(4) as u32 as u64) | ((self.get_s32(8) as u32 as u64) << 32);
        let features = if self.len_words() >= 5 {
            self.get_s32(12) as u32
        } else {
            0
        };
        Some(Ping {
            packets: self.get_s16(0) as u16,
            time_ms: self.get_s16(2) as u16,
            passwd,
            features,
        })
    }
}

/// Owned sub-packet under construction. Builders fill the header and
/// payload; the packetizer copies `bytes()` into the outgoing frame.
#[derive(Clone)]
pub struct PacketBuf {
    raw: [u8; MAX_PKT],
}

impl Default for PacketBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuf {
    pub fn new() -> Self {
        Self { raw: [0u8; MAX_PKT] }
    }

    pub fn len_words(&self) -> usize {
        self.raw[0] as usize
    }

    pub fn kind(&self) -> u8 {
        self.raw[1]
    }

    pub fn set_kind(&mut self, kind: u8) {
        self.raw[1] = kind;
    }

    pub fn set_seq_local(&mut self, seqno: u8) {
        self.raw[2] = seqno;
    }

    pub fn set_seq_peer(&mut self, seqno: u8) {
        self.raw[3] = seqno;
    }

    /// Total wire size in bytes.
    pub fn bytes(&self) -> usize {
        self.len_words() * 4
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw[..self.bytes()]
    }

    /// Read-only view with the decoder methods.
    pub fn as_ref(&self) -> PacketRef<'_> {
        PacketRef::new(&self.raw[..self.bytes().max(4)])
    }

    fn set_header(&mut self, len_words: usize, kind: u8) {
        debug_assert!(len_words >= 1 && len_words <= 255);
        self.raw[0] = len_words as u8;
        self.raw[1] = kind;
        self.raw[2] = 0;
        self.raw[3] = 0;
    }

    fn put_s8(&mut self, offset: usize, value: i8) {
        self.raw[4 + offset] = value as u8;
    }

    fn put_s16(&mut self, offset: usize, value: i16) {
        self.raw[4 + offset..4 + offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_s24(&mut self, offset: usize, value: i32) {
        self.raw[4 + offset] = value as u8;
        self.raw[4 + offset + 1] = (value >> 8) as u8;
        self.raw[4 + offset + 2] = (value >> 16) as u8;
    }

    fn put_s32(&mut self, offset: usize, value: i32) {
        self.raw[4 + offset..4 + offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_8bit_1ch(&mut self, left: &[f32]) {
        debug_assert!(left.len() % 4 == 0);
        self.set_header(1 + left.len() / 4, kind::AUDIO_8_BIT_1CH);
        for (x, &v) in left.iter().enumerate() {
            self.put_s8(x, mulaw::encode(v, MUL_8) as i8);
        }
    }

    pub fn put_16bit_1ch(&mut self, left: &[f32]) {
        debug_assert!(left.len() % 2 == 0);
        self.set_header(1 + left.len() / 2, kind::AUDIO_16_BIT_1CH);
        for (x, &v) in left.iter().enumerate() {
            self.put_s16(2 * x, mulaw::encode(v, MUL_16) as i16);
        }
    }

    pub fn put_24bit_1ch(&mut self, left: &[f32]) {
        self.set_header(1 + (left.len() * 3 + 3) / 4, kind::AUDIO_24_BIT_1CH);
        for (x, &v) in left.iter().enumerate() {
            self.put_s24(3 * x, mulaw::encode(v, MUL_24));
        }
    }

    pub fn put_32bit_1ch(&mut self, left: &[f32]) {
        self.set_header(1 + left.len(), kind::AUDIO_32_BIT_1CH);
        for (x, &v) in left.iter().enumerate() {
            self.put_s32(4 * x, mulaw::encode(v, MUL_32));
        }
    }

    pub fn put_8bit_2ch(&mut self, left: &[f32], right: &[f32]) {
        debug_assert!(left.len() % 2 == 0 && left.len() == right.len());
        self.set_header(1 + left.len() / 2, kind::AUDIO_8_BIT_2CH);
        for x in 0..left.len() {
            self.put_s8(x * 2, mulaw::encode(left[x], MUL_8) as i8);
            self.put_s8(x * 2 + 1, mulaw::encode(right[x], MUL_8) as i8);
        }
    }

    pub fn put_16bit_2ch(&mut self, left: &[f32], right: &[f32]) {
        debug_assert!(left.len() == right.len());
        self.set_header(1 + left.len(), kind::AUDIO_16_BIT_2CH);
        for x in 0..left.len() {
            self.put_s16(x * 4, mulaw::encode(left[x], MUL_16) as i16);
            self.put_s16(x * 4 + 2, mulaw::encode(right[x], MUL_16) as i16);
        }
    }

    pub fn put_24bit_2ch(&mut self, left: &[f32], right: &[f32]) {
        debug_assert!(left.len() == right.len());
        self.set_header(1 + (left.len() * 6 + 3) / 4, kind::AUDIO_24_BIT_2CH);
        for x in 0..left.len() {
            self.put_s24(x * 6, mulaw::encode(left[x], MUL_24));
            self.put_s24(x * 6 + 3, mulaw::encode(right[x], MUL_24));
        }
    }

    pub fn put_32bit_2ch(&mut self, left: &[f32], right: &[f32]) {
        debug_assert!(left.len() == right.len());
        self.set_header(1 + left.len() * 2, kind::AUDIO_32_BIT_2CH);
        for x in 0..left.len() {
            self.put_s32(x * 8, mulaw::encode(left[x], MUL_32));
            self.put_s32(x * 8 + 4, mulaw::encode(right[x], MUL_32));
        }
    }

    pub fn put_silence(&mut self, samples: usize) {
        self.raw[0] = 1;
        self.raw[1] = kind::AUDIO_SILENCE;
        self.raw[2] = samples as u8;
        self.raw[3] = 0;
    }

    pub fn put_midi(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= MAX_PKT - 4);
        self.set_header(1 + (data.len() + 3) / 4, kind::MIDI_PACKET);
        self.raw[2] = (data.len().wrapping_neg() & 3) as u8;
        self.raw[4..4 + data.len()].copy_from_slice(data);
        let mut pad = data.len();
        while pad % 4 != 0 {
            self.raw[4 + pad] = 0;
            pad += 1;
        }
    }

    pub fn put_fader_value(&mut self, kind: u8, mix: u8, index: u8, values: &[f32]) {
        let tot = 2 + (values.len() + 1) / 2;
        debug_assert!(tot <= 255);
        self.set_header(tot, kind);
        self.put_s8(0, mix as i8);
        self.put_s8(1, index as i8);
        self.put_s8(2, (values.len() & 1) as i8);
        self.put_s8(3, 0);
        for (x, &v) in values.iter().enumerate() {
            self.put_s16(4 + 2 * x, mulaw::encode(v, MUL_16) as i16);
        }
        if values.len() % 2 != 0 {
            self.put_s16(4 + 2 * values.len(), 0);
        }
    }

    pub fn put_fader_data(&mut self, kind: u8, mix: u8, index: u8, data: &[u8]) {
        let tot = 2 + (data.len() + 3) / 4;
        debug_assert!(tot <= 255);
        self.set_header(tot, kind);
        self.put_s8(0, mix as i8);
        self.put_s8(1, index as i8);
        self.put_s8(2, (data.len().wrapping_neg() & 3) as i8);
        self.put_s8(3, 0);
        self.raw[8..8 + data.len()].copy_from_slice(data);
        let mut pad = data.len();
        while pad % 4 != 0 {
            self.raw[8 + pad] = 0;
            pad += 1;
        }
    }

    pub fn put_raw_data(&mut self, kind: u8, data: &[u8], pad: u8) {
        let tot = 1 + (data.len() + 3) / 4;
        debug_assert!(tot <= 255);
        self.set_header(tot, kind);
        self.raw[4..4 + data.len()].copy_from_slice(data);
        let mut off = data.len();
        while off % 4 != 0 {
            self.raw[4 + off] = pad;
            off += 1;
        }
    }

    pub fn put_configure(&mut self, kind: u8, out_format: u8) {
        self.set_header(2, kind);
        self.put_s8(0, out_format as i8);
        self.put_s8(1, 0);
        self.put_s8(2, 0);
        self.put_s8(3, 0);
    }

    pub fn put_ping(&mut self, kind: u8, ping: Ping) {
        self.set_header(5, kind);
        self.put_s16(0, ping.packets as i16);
        self.put_s16(2, ping.time_ms as i16);
        self.put_s32(4, ping.passwd as u32 as i32);
        self.put_s32(8, (ping.passwd >> 32) as u32 as i32);
        self.put_s32(12, ping.features as i32);
    }

    /// Silence payload used when the jitter buffer synthesizes a frame.
    pub fn silence_nominal() -> Self {
        let mut pkt = Self::new();
        pkt.put_silence(NOM_SAMPLES);
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_round_trip_16_bit_2ch() {
        let left = [-1.0f32, -0.5, 0.0, 0.5, 1.0, 0.25];
        let right = [0.1f32, -0.1, 0.9, -0.9, 0.0, -0.25];
        let mut pkt = PacketBuf::new();
        pkt.put_16bit_2ch(&left, &right);

        let mut l = [0.0f32; 8];
        let mut r = [0.0f32; 8];
        let num = pkt.as_ref().get_16bit_2ch(&mut l, &mut r);
        assert_eq!(num, 6);
        for x in 0..num {
            assert!((l[x] - left[x]).abs() <= 1.0 / 32767.0);
            assert!((r[x] - right[x]).abs() <= 1.0 / 32767.0);
        }
    }

    #[test]
    fn audio_length_grid() {
        let samples = [0.0f32; 48];
        let mut pkt = PacketBuf::new();

        pkt.put_8bit_1ch(&samples);
        assert_eq!(pkt.len_words(), 1 + 48 / 4);

        pkt.put_24bit_2ch(&samples, &samples);
        assert_eq!(pkt.len_words(), 1 + (48 * 6 + 3) / 4);

        pkt.put_32bit_2ch(&samples, &samples);
        assert_eq!(pkt.len_words(), 1 + 96);
    }

    #[test]
    fn midi_exact_byte_count() {
        for len in 1..=9usize {
            let data: Vec<u8> = (0..len as u8).collect();
            let mut pkt = PacketBuf::new();
            pkt.put_midi(&data);

            let mut out = [0u8; 16];
            let num = pkt.as_ref().get_midi(&mut out).unwrap();
            assert_eq!(num, len);
            assert_eq!(&out[..num], &data[..]);
        }
    }

    #[test]
    fn midi_rejects_short_destination() {
        let mut pkt = PacketBuf::new();
        pkt.put_midi(&[1, 2, 3, 4, 5, 6]);
        let mut out = [0u8; 4];
        assert!(pkt.as_ref().get_midi(&mut out).is_none());
    }

    #[test]
    fn ping_round_trip() {
        let ping = Ping {
            packets: 7,
            time_ms: 1234,
            passwd: 0xdead_beef_cafe_f00d,
            features: crate::FEATURE_MULTI_PORT,
        };
        let mut pkt = PacketBuf::new();
        pkt.put_ping(kind::PING_REQUEST, ping);
        assert_eq!(pkt.len_words(), 5);
        assert_eq!(pkt.as_ref().get_ping(), Some(ping));
    }

    #[test]
    fn fader_value_odd_run() {
        let values = [0.5f32, -0.5, 0.25];
        let mut pkt = PacketBuf::new();
        pkt.put_fader_value(kind::FADER_GAIN_REQUEST, 0, 3, &values);

        let mut out = [0.0f32; 8];
        let (mix, index, num) = pkt.as_ref().get_fader_value(&mut out).unwrap();
        assert_eq!((mix, index, num), (0, 3, 3));
        for x in 0..num {
            assert!((out[x] - values[x]).abs() <= 1.0 / 32767.0);
        }
    }

    #[test]
    fn fader_data_pad_recovery() {
        for len in 0..=8usize {
            let data: Vec<u8> = (0..len as u8).map(|v| v + 1).collect();
            let mut pkt = PacketBuf::new();
            pkt.put_fader_data(kind::FADER_EQ_REQUEST, 0, 9, &data);

            let (mix, index, blob) = pkt.as_ref().get_fader_data().unwrap();
            assert_eq!((mix, index), (0, 9));
            assert_eq!(blob, &data[..]);
        }
    }

    #[test]
    fn short_packets_are_rejected() {
        let mut pkt = PacketBuf::new();
        pkt.put_silence(72);
        assert!(pkt.as_ref().get_ping().is_none());
        assert!(pkt.as_ref().get_configure().is_none());
        assert!(pkt.as_ref().get_fader_data().is_none());
        assert_eq!(pkt.as_ref().get_silence(), 72);
    }

    #[test]
    fn configure_round_trip() {
        let mut pkt = PacketBuf::new();
        pkt.put_configure(kind::CONFIGURE_REQUEST, kind::AUDIO_16_BIT_2CH);
        assert_eq!(pkt.as_ref().get_configure(), Some(kind::AUDIO_16_BIT_2CH));
    }
}
