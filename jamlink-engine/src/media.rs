//! Media-plane helpers shared by the server and client peers: the
//! unsequenced sub-packet sink, the output conditioning chain and the
//! per-tick frame transmit.

use jamlink_dsp::buffer::{AudioBuffer, AudioLevel};
use jamlink_dsp::compressor::stereo_compressor;
use jamlink_dsp::midi::MidiBuffer;
use jamlink_proto::output::{ControlSignal, OutputPacketizer};
use jamlink_proto::packet::{kind, PacketBuf, PacketRef};
use jamlink_proto::{DEF_SAMPLES, MAX_PKT, NOM_SAMPLES, PORTS_MAX, SAMPLE_RATE};

use crate::socket::SocketAddress;

/// Mixer gain index applied as `value * gain / 256`.
#[inline]
pub fn float_gain(value: f32, gain: i32) -> f32 {
    (value * gain as f32) * (1.0 / 256.0)
}

/// Map the signed 5-bit gain index of a mixer byte onto a fixed-point
/// multiplier: `256^((g + 16) / 16)`, so index 0 is unity (256).
pub fn gain_from_bits(value: u8) -> i32 {
    let mut temp = ((value >> 3) & 31) as i32;
    // sign extend the 5-bit field
    if temp >= 16 {
        temp -= 32;
    }
    256.0f32.powf((temp + 16) as f32 / 16.0) as i32
}

/// Handle one unsequenced sub-packet (audio, silence, MIDI, ACK).
/// Returns false when the packet belongs to the reliable control stream
/// and must go through sequence processing instead.
pub fn receive_unsequenced(
    pkt: &PacketRef<'_>,
    in_audio: &mut [AudioBuffer; 2],
    in_level: &mut [AudioLevel; 2],
    in_midi: &mut MidiBuffer,
    output_pkt: &mut OutputPacketizer,
    ticks: u16,
) -> bool {
    let mut temp = [0.0f32; MAX_PKT];

    let both = |l: &[f32], r: &[f32], in_audio: &mut [AudioBuffer; 2], in_level: &mut [AudioLevel; 2]| {
        in_audio[0].add_samples(l);
        in_audio[1].add_samples(r);
        in_level[0].add_samples(l);
        in_level[1].add_samples(r);
    };

    match pkt.kind() {
        kind::AUDIO_8_BIT_1CH => {
            let num = pkt.get_8bit_1ch(&mut temp);
            let (l, _) = temp.split_at(num);
            both(l, l, in_audio, in_level);
            true
        }
        kind::AUDIO_16_BIT_1CH => {
            let num = pkt.get_16bit_1ch(&mut temp);
            let (l, _) = temp.split_at(num);
            both(l, l, in_audio, in_level);
            true
        }
        kind::AUDIO_24_BIT_1CH => {
            let num = pkt.get_24bit_1ch(&mut temp);
            let (l, _) = temp.split_at(num);
            both(l, l, in_audio, in_level);
            true
        }
        kind::AUDIO_32_BIT_1CH => {
            let num = pkt.get_32bit_1ch(&mut temp);
            let (l, _) = temp.split_at(num);
            both(l, l, in_audio, in_level);
            true
        }
        kind::AUDIO_8_BIT_2CH => {
            let (l, r) = temp.split_at_mut(MAX_PKT / 2);
            let num = pkt.get_8bit_2ch(l, r);
            both(&l[..num], &r[..num], in_audio, in_level);
            true
        }
        kind::AUDIO_16_BIT_2CH => {
            let (l, r) = temp.split_at_mut(MAX_PKT / 2);
            let num = pkt.get_16bit_2ch(l, r);
            both(&l[..num], &r[..num], in_audio, in_level);
            true
        }
        kind::AUDIO_24_BIT_2CH => {
            let (l, r) = temp.split_at_mut(MAX_PKT / 2);
            let num = pkt.get_24bit_2ch(l, r);
            both(&l[..num], &r[..num], in_audio, in_level);
            true
        }
        kind::AUDIO_32_BIT_2CH => {
            let (l, r) = temp.split_at_mut(MAX_PKT / 2);
            let num = pkt.get_32bit_2ch(l, r);
            both(&l[..num], &r[..num], in_audio, in_level);
            true
        }
        k if (kind::AUDIO_32_BIT_2CH + 1..=kind::AUDIO_MAX).contains(&k) => {
            // reserved audio encodings: accepted and ignored
            true
        }
        kind::MIDI_PACKET => {
            let mut midi = [0u8; MAX_PKT];
            if let Some(num) = pkt.get_midi(&mut midi) {
                in_midi.add_data(&midi[..num]);
            }
            true
        }
        kind::AUDIO_SILENCE => {
            let num = pkt.get_silence();
            in_audio[0].add_silence(num);
            in_audio[1].add_silence(num);
            true
        }
        kind::ACK => {
            // check if the other side received our control packet
            if pkt.seq_peer() == output_pkt.pend_seqno() {
                output_pkt.advance(ticks);
            }
            true
        }
        _ => false,
    }
}

/// Condition one tick of outgoing audio: mono downmix when the peer
/// asked for a single channel, final limiter, then staging into the
/// output rings the frame transmit drains from.
pub fn process_output_audio(
    output_fmt: u8,
    out_peak: &mut f32,
    left: &mut [f32; DEF_SAMPLES],
    right: &mut [f32; DEF_SAMPLES],
    out_buffer: &mut [AudioBuffer; 2],
) {
    match output_fmt {
        kind::AUDIO_8_BIT_1CH
        | kind::AUDIO_16_BIT_1CH
        | kind::AUDIO_24_BIT_1CH
        | kind::AUDIO_32_BIT_1CH => {
            for x in 0..DEF_SAMPLES {
                let mono = (left[x] + right[x]) / 2.0;
                left[x] = mono;
                right[x] = mono;
            }
        }
        _ => {}
    }

    for x in 0..DEF_SAMPLES {
        stereo_compressor(SAMPLE_RATE as f32, out_peak, &mut left[x], &mut right[x]);
    }

    out_buffer[0].add_samples(left.as_slice());
    out_buffer[1].add_samples(right.as_slice());
}

/// Serialize one frame and put it on the wire: append pending MIDI, pull
/// the nominal audio window from the staging rings on data frames,
/// encode in the negotiated format and send - striped across ports once
/// the multi-port delay has elapsed.
#[allow(clippy::too_many_arguments)]
pub fn send_packet_frame(
    output_pkt: &mut OutputPacketizer,
    output_fmt: u8,
    out_buffer: &mut [AudioBuffer; 2],
    midi: &[u8],
    multi_port: bool,
    multi_wait: &mut u16,
    addresses: &[SocketAddress; PORTS_MAX],
    ticks: u16,
) -> ControlSignal {
    let mut entry = PacketBuf::new();

    if !midi.is_empty() {
        entry.put_midi(midi);
        output_pkt.append_pkt(&entry);
    }

    if !output_pkt.is_xor_frame() {
        let mut temp = [[0.0f32; NOM_SAMPLES]; 2];
        out_buffer[0].rem_samples(&mut temp[0]);
        out_buffer[1].rem_samples(&mut temp[1]);

        match output_fmt {
            kind::AUDIO_8_BIT_1CH => entry.put_8bit_1ch(&temp[0]),
            kind::AUDIO_16_BIT_1CH => entry.put_16bit_1ch(&temp[0]),
            kind::AUDIO_24_BIT_1CH => entry.put_24bit_1ch(&temp[0]),
            kind::AUDIO_32_BIT_1CH => entry.put_32bit_1ch(&temp[0]),
            kind::AUDIO_8_BIT_2CH => entry.put_8bit_2ch(&temp[0], &temp[1]),
            kind::AUDIO_16_BIT_2CH => entry.put_16bit_2ch(&temp[0], &temp[1]),
            kind::AUDIO_24_BIT_2CH => entry.put_24bit_2ch(&temp[0], &temp[1]),
            kind::AUDIO_32_BIT_2CH => entry.put_32bit_2ch(&temp[0], &temp[1]),
            _ => entry.put_silence(NOM_SAMPLES),
        }
        output_pkt.append_pkt(&entry);
    }

    let stripe = output_pkt.seqno() as usize % PORTS_MAX;
    let use_stripe = multi_port
        && if *multi_wait == 0 {
            true
        } else {
            *multi_wait -= 1;
            false
        };

    let (frame, bytes, signal) = output_pkt.emit(ticks);
    let target = if use_stripe {
        &addresses[stripe]
    } else {
        &addresses[0]
    };
    target.send_frame(&frame.as_bytes()[..bytes]);
    signal
}

#[cfg(test)]
mod tests {
    use super::*;
    use jamlink_proto::frame::Frame;

    #[test]
    fn gain_index_zero_is_unity() {
        assert_eq!(gain_from_bits(0), 256);
    }

    #[test]
    fn gain_index_extremes() {
        // +15 -> 256^(31/16), -16 -> 256^0 = 1
        assert!(gain_from_bits(crate::bit_gain_set(15)) > 40_000);
        assert_eq!(gain_from_bits(crate::bit_gain_set(-16)), 1);
    }

    #[test]
    fn float_gain_is_fixed_point() {
        assert_eq!(float_gain(1.0, 256), 1.0);
        assert_eq!(float_gain(0.5, 512), 1.0);
    }

    #[test]
    fn unsequenced_audio_lands_in_the_rings() {
        let mut in_audio = [AudioBuffer::new(), AudioBuffer::new()];
        let mut in_level = [AudioLevel::new(), AudioLevel::new()];
        let mut in_midi = MidiBuffer::new();
        let mut out = OutputPacketizer::new();

        let samples = [0.5f32; NOM_SAMPLES];
        let mut pkt = PacketBuf::new();
        pkt.put_16bit_2ch(&samples, &samples);

        let mut frame = Frame::new();
        assert!(frame.push_packet(&pkt));
        let parsed = frame.packets().next().unwrap();
        assert!(receive_unsequenced(
            &parsed,
            &mut in_audio,
            &mut in_level,
            &mut in_midi,
            &mut out,
            0
        ));
        assert_eq!(in_audio[0].total(), NOM_SAMPLES);
        assert_eq!(in_audio[1].total(), NOM_SAMPLES);
    }

    #[test]
    fn control_packets_are_not_consumed() {
        let mut in_audio = [AudioBuffer::new(), AudioBuffer::new()];
        let mut in_level = [AudioLevel::new(), AudioLevel::new()];
        let mut in_midi = MidiBuffer::new();
        let mut out = OutputPacketizer::new();

        let mut pkt = PacketBuf::new();
        pkt.put_configure(kind::CONFIGURE_REQUEST, kind::AUDIO_16_BIT_2CH);
        let mut frame = Frame::new();
        assert!(frame.push_packet(&pkt));
        let parsed = frame.packets().next().unwrap();

        assert!(!receive_unsequenced(
            &parsed,
            &mut in_audio,
            &mut in_level,
            &mut in_midi,
            &mut out,
            0
        ));
    }

    #[test]
    fn mono_format_downmixes() {
        let mut out_peak = 0.0f32;
        let mut left = [0.8f32; DEF_SAMPLES];
        let mut right = [0.0f32; DEF_SAMPLES];
        let mut rings = [AudioBuffer::new(), AudioBuffer::new()];

        process_output_audio(
            kind::AUDIO_16_BIT_1CH,
            &mut out_peak,
            &mut left,
            &mut right,
            &mut rings,
        );
        assert!((left[0] - 0.4).abs() < 1e-6);
        assert_eq!(left[0], right[0]);
        assert_eq!(rings[0].total(), DEF_SAMPLES);
    }
}
