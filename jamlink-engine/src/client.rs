//! The client side of the media plane.
//!
//! One peer record shared between the audio-device callback and the
//! 1 ms timer thread. The callback runs the input chain (equalizer,
//! pan, gain, limiter), stages audio for the wire and pulls the remote
//! mix plus local monitoring out; the timer drains the jitter buffer,
//! dispatches control replies as typed events and emits one frame.

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use jamlink_dsp::buffer::{AudioBuffer, AudioLevel};
use jamlink_dsp::compressor::stereo_compressor;
use jamlink_dsp::equalizer::Equalizer;
use jamlink_dsp::midi::{MidiBuffer, MidiProcessor};
use jamlink_dsp::pan::{mix_monitor, pan_stereo};
use jamlink_proto::frame::Frame;
use jamlink_proto::input::InputPacketizer;
use jamlink_proto::output::{ControlSignal, OutputPacketizer};
use jamlink_proto::packet::{kind, PacketBuf, PacketRef, Ping};
use jamlink_proto::{
    DEF_SAMPLES, FEATURE_MULTI_PORT, PEERS_MAX, PORTS_MAX, SAMPLE_RATE,
};

use crate::events::ClientEvent;
use crate::media::{process_output_audio, receive_unsequenced, send_packet_frame};
use crate::runtime::Runtime;
use crate::server::MULTI_PORT_DELAY_TICKS;
use crate::socket::{self, SocketAddress, SocketError, Transport};
use crate::{BIT_INVERT, BIT_MUTE, BIT_SOLO};

/// Largest audio-device callback size the engine accepts.
pub const MAX_BUFFER_SAMPLES: usize = 512;

/// One-shot sampled notification sounds mixed into the local output.
#[derive(Default)]
pub struct AudioEffects {
    slots: [EffectSlot; 2],
}

#[derive(Default)]
struct EffectSlot {
    data: Vec<f32>,
    off: usize,
    gain: f32,
}

#[derive(Clone, Copy)]
pub enum Effect {
    NewUser = 0,
    NewMessage = 1,
}

impl AudioEffects {
    /// Install the sample data for one effect (mono, 48 kHz floats).
    pub fn load(&mut self, effect: Effect, data: Vec<f32>) {
        let slot = &mut self.slots[effect as usize];
        slot.off = data.len();
        slot.data = data;
    }

    /// Start an effect unless it is already playing.
    pub fn play(&mut self, effect: Effect, gain: f32) {
        let slot = &mut self.slots[effect as usize];
        if slot.off == slot.data.len() && gain > 0.0 {
            slot.off = 0;
            slot.gain = gain;
        }
    }

    pub fn is_active(&self) -> bool {
        self.slots.iter().any(|s| s.off < s.data.len())
    }

    /// Next mixed effect sample.
    pub fn get_sample(&mut self) -> f32 {
        let mut sample = 0.0;
        for slot in &mut self.slots {
            if slot.off < slot.data.len() {
                sample += slot.data[slot.off] * slot.gain;
                slot.off += 1;
            }
        }
        sample
    }
}

pub struct ClientPeer {
    pub address: [SocketAddress; PORTS_MAX],
    pub input_pkt: InputPacketizer,
    pub output_pkt: OutputPacketizer,
    /// Remote mix received from the server.
    pub in_audio: [AudioBuffer; 2],
    /// Local capture awaiting the wire.
    pub out_audio: [AudioBuffer; 2],
    /// Conditioned staging the packetizer drains.
    pub out_buffer: [AudioBuffer; 2],
    pub in_level: [AudioLevel; 2],
    pub out_level: [AudioLevel; 2],
    pub in_midi: MidiBuffer,
    pub out_midi: MidiBuffer,
    midi_proc: MidiProcessor,
    midi_data: [u8; 16],
    midi_len: usize,
    pub eq: Equalizer,
    pub local_eq: Equalizer,
    /// Monitor gain pair: dry level and wet balance.
    pub mon_gain: [f32; 2],
    pub mon_pan: f32,
    pub in_gain: f32,
    pub in_pan: f32,
    pub in_peak: f32,
    pub out_peak: f32,
    pub local_peak: f32,
    pub bits: u8,
    pub output_fmt: u8,
    pub multi_port: bool,
    pub multi_wait: u16,
    pub effects: AudioEffects,
    pub self_index: Option<u8>,
}

impl Default for ClientPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientPeer {
    pub fn new() -> Self {
        Self {
            address: std::array::from_fn(|_| SocketAddress::invalid()),
            input_pkt: InputPacketizer::new(),
            output_pkt: OutputPacketizer::new(),
            in_audio: [AudioBuffer::new(), AudioBuffer::new()],
            out_audio: [AudioBuffer::new(), AudioBuffer::new()],
            out_buffer: [AudioBuffer::new(), AudioBuffer::new()],
            in_level: [AudioLevel::new(), AudioLevel::new()],
            out_level: [AudioLevel::new(), AudioLevel::new()],
            in_midi: MidiBuffer::new(),
            out_midi: MidiBuffer::new(),
            midi_proc: MidiProcessor::new(),
            midi_data: [0; 16],
            midi_len: 0,
            eq: Equalizer::new(),
            local_eq: Equalizer::new(),
            mon_gain: [0.0, 1.0],
            mon_pan: 0.0,
            in_gain: 1.0,
            in_pan: 0.0,
            in_peak: 0.0,
            out_peak: 0.0,
            local_peak: 0.0,
            bits: 0,
            output_fmt: kind::AUDIO_SILENCE,
            multi_port: false,
            multi_wait: 0,
            effects: AudioEffects::default(),
            self_index: None,
        }
    }

    /// Tear the session state down; the peer stops ticking until the
    /// next connect.
    pub fn init(&mut self) {
        for address in &mut self.address {
            address.clear();
        }
        self.input_pkt.init();
        self.output_pkt.init();
        for buffer in self
            .in_audio
            .iter_mut()
            .chain(self.out_audio.iter_mut())
            .chain(self.out_buffer.iter_mut())
        {
            buffer.clear();
        }
        for level in self.in_level.iter_mut().chain(self.out_level.iter_mut()) {
            level.clear();
        }
        self.in_midi.clear();
        self.out_midi.clear();
        self.midi_proc.clear();
        self.midi_data = [0; 16];
        self.midi_len = 0;
        self.eq.cleanup();
        self.in_gain = 1.0;
        self.in_pan = 0.0;
        self.in_peak = 0.0;
        self.out_peak = 0.0;
        self.output_fmt = kind::AUDIO_SILENCE;
        self.multi_port = false;
        self.multi_wait = 0;
        self.bits = 0;
        self.self_index = None;
    }
}

/// Connection parameters for [`Client::connect`].
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub passwd: u64,
    pub name: String,
    pub icon: Vec<u8>,
    /// Format the server should send to us.
    pub downlink_fmt: u8,
    /// Format we encode towards the server.
    pub uplink_fmt: u8,
    pub features: u32,
}

pub struct Client {
    pub peer: Mutex<ClientPeer>,
    events: Sender<ClientEvent>,
    transports: Mutex<[Transport; 2]>,
}

impl Client {
    pub fn new(events: Sender<ClientEvent>) -> Self {
        Self {
            peer: Mutex::new(ClientPeer::new()),
            events,
            transports: Mutex::new([Transport::None, Transport::None]),
        }
    }

    /// Attach the local transport for one address family.
    pub fn install_transport(&self, ipv6: bool, transport: Transport) {
        self.transports.lock()[ipv6 as usize] = transport;
    }

    /// Open a session: resolve the server, point all port stripes at
    /// it and queue the opening control burst (zero-sequence ping with
    /// the shared secret, then configure, name and icon).
    pub fn connect(&self, rt: &Runtime, cfg: &ConnectConfig) -> Result<(), SocketError> {
        let addr = socket::resolve(&cfg.host, cfg.port)?;
        let transport = self.transports.lock()[addr.is_ipv6() as usize].clone();

        let features = if rt.config.no_multi_port {
            cfg.features & !FEATURE_MULTI_PORT
        } else {
            cfg.features
        };

        let mut peer = self.peer.lock();
        peer.init();

        for (i, slot) in peer.address.iter_mut().enumerate() {
            let mut stripe = addr;
            stripe.set_port(cfg.port.wrapping_add(i as u16));
            *slot = SocketAddress::new(stripe, transport.clone());
        }
        peer.output_fmt = cfg.uplink_fmt;
        peer.multi_wait = MULTI_PORT_DELAY_TICKS;

        // the session opens on the very first reliable packet
        let mut pkt = PacketBuf::new();
        pkt.put_ping(
            kind::PING_REQUEST,
            Ping {
                packets: 0,
                time_ms: rt.ticks(),
                passwd: cfg.passwd,
                features,
            },
        );
        peer.output_pkt.queue_pkt(pkt);

        let mut pkt = PacketBuf::new();
        pkt.put_configure(kind::CONFIGURE_REQUEST, cfg.downlink_fmt);
        peer.output_pkt.queue_pkt(pkt);

        let name = cfg.name.as_bytes();
        let mut pkt = PacketBuf::new();
        pkt.put_raw_data(kind::NAME_REQUEST, &name[..name.len().min(32)], 0);
        peer.output_pkt.queue_pkt(pkt);

        if !cfg.icon.is_empty() {
            let mut pkt = PacketBuf::new();
            pkt.put_raw_data(kind::ICON_REQUEST, &cfg.icon[..cfg.icon.len().min(1000)], 0);
            peer.output_pkt.queue_pkt(pkt);
        }

        log::debug!("connecting to {}", addr);
        Ok(())
    }

    /// Drop the session; the server notices through its control
    /// timeout.
    pub fn disconnect(&self) {
        self.peer.lock().init();
    }

    pub fn is_connected(&self) -> bool {
        self.peer.lock().address[0].valid()
    }

    /// Round-trip time of the last acknowledged control packet.
    pub fn ping_time(&self) -> u16 {
        self.peer.lock().output_pkt.ping_time()
    }

    /// Frame delivery from the receive path. Only traffic from one of
    /// the server's port stripes is accepted.
    pub fn receive(&self, rt: &Runtime, src: &SocketAddress, frame: &Frame) {
        let ticks = rt.ticks();
        let mut peer = self.peer.lock();
        if !peer.address[0].valid() {
            return;
        }
        if peer.address.iter().any(|a| a == src) {
            peer.input_pkt.receive(frame, ticks);
        }
    }

    /// The audio-device callback: `left`/`right` carry the captured
    /// input and return the rendered output. Any length from 32 to 512
    /// frames is accepted.
    pub fn sound_process(&self, left: &mut [f32], right: &mut [f32]) {
        let samples = left.len().min(right.len()).min(MAX_BUFFER_SAMPLES);
        let left = &mut left[..samples];
        let right = &mut right[..samples];

        let mut peer = self.peer.lock();
        let p = &mut *peer;

        if !p.address[0].valid() {
            // offline: only the notification effects are audible
            if p.effects.is_active() {
                for x in 0..samples {
                    let temp = p.effects.get_sample();
                    left[x] = temp;
                    right[x] = temp;
                }
                for x in 0..samples {
                    stereo_compressor(
                        SAMPLE_RATE as f32,
                        &mut p.local_peak,
                        &mut left[x],
                        &mut right[x],
                    );
                }
            } else {
                left.fill(0.0);
                right.fill(0.0);
            }
            return;
        }

        p.out_level[0].add_samples(left);
        p.out_level[1].add_samples(right);

        let mut temp_l = [0.0f32; MAX_BUFFER_SAMPLES];
        let mut temp_r = [0.0f32; MAX_BUFFER_SAMPLES];
        temp_l[..samples].copy_from_slice(left);
        temp_r[..samples].copy_from_slice(right);

        if p.bits & BIT_MUTE != 0 {
            left.fill(0.0);
            right.fill(0.0);
        }

        p.eq.process_stereo(left, right);
        pan_stereo(p.in_pan, left, right);

        if p.in_gain < 1.0 {
            for x in 0..samples {
                left[x] *= p.in_gain;
                right[x] *= p.in_gain;
            }
        }

        for x in 0..samples {
            stereo_compressor(SAMPLE_RATE as f32, &mut p.in_peak, &mut left[x], &mut right[x]);
        }

        p.out_audio[0].add_samples(left);
        p.out_audio[1].add_samples(right);

        p.in_audio[0].rem_samples(left);
        p.in_audio[1].rem_samples(right);

        if p.bits & BIT_SOLO != 0 {
            left.fill(0.0);
            right.fill(0.0);
        }

        p.local_eq.process_stereo(&mut temp_l[..samples], &mut temp_r[..samples]);

        let mg = [
            if p.bits & BIT_INVERT != 0 {
                -p.mon_gain[0]
            } else {
                p.mon_gain[0]
            },
            p.mon_gain[1],
        ];
        if mg[0] != 0.0 {
            mix_monitor(
                p.mon_pan,
                mg,
                &temp_l[..samples],
                &temp_r[..samples],
                left,
                right,
            );
        }

        if p.effects.is_active() {
            for x in 0..samples {
                let temp = p.effects.get_sample();
                left[x] += temp;
                right[x] += temp;
            }
        }

        for x in 0..samples {
            stereo_compressor(
                SAMPLE_RATE as f32,
                &mut p.local_peak,
                &mut left[x],
                &mut right[x],
            );
        }
    }

    /// The 1 ms tick: drain the network, dispatch events, emit one
    /// frame and steer the timer from the capture ring's water class.
    pub fn tick(&self, rt: &Runtime) {
        let ticks = rt.ticks();
        let mut events: Vec<ClientEvent> = Vec::new();
        let mut timed_out = false;

        {
            let mut peer = self.peer.lock();
            if !peer.address[0].valid() {
                return;
            }

            loop {
                let low_water = peer.in_audio[0].low_water_class() == 0;
                let Some(frame) = peer.input_pkt.first_pkt(low_water) else {
                    break;
                };
                for pkt in frame.packets() {
                    let consumed = {
                        let p = &mut *peer;
                        receive_unsequenced(
                            &pkt,
                            &mut p.in_audio,
                            &mut p.in_level,
                            &mut p.in_midi,
                            &mut p.output_pkt,
                            ticks,
                        )
                    };
                    if consumed {
                        continue;
                    }
                    if pkt.seq_peer() == peer.output_pkt.pend_seqno() {
                        peer.output_pkt.advance(ticks);
                    }
                    if pkt.seq_local() != peer.output_pkt.peer_seqno() {
                        continue;
                    }
                    peer.output_pkt.advance_peer_seqno();
                    peer.output_pkt.set_send_ack();

                    Self::handle_control(&mut peer, &pkt, &mut events);
                }
            }

            if peer.output_pkt.is_empty() {
                let mut pkt = PacketBuf::new();
                pkt.put_ping(
                    kind::PING_REQUEST,
                    Ping {
                        packets: 0,
                        time_ms: ticks,
                        passwd: 0,
                        features: 0,
                    },
                );
                peer.output_pkt.queue_pkt(pkt);
            }

            // MIDI goes out on alternate ticks
            if peer.midi_len == 0 {
                let mut temp = [0u8; 16];
                let p = &mut *peer;
                let num = p.out_midi.rem_data(&mut temp);
                p.midi_data = temp;
                p.midi_len = num;
            } else {
                peer.midi_len = 0;
            }

            let mut audio = [[0.0f32; DEF_SAMPLES]; 2];
            {
                let p = &mut *peer;
                p.out_audio[0].rem_samples(&mut audio[0]);
                p.out_audio[1].rem_samples(&mut audio[1]);
            }

            rt.timer_adjust.store(
                match peer.out_audio[0].low_water_class() {
                    0 => 1,  // go slower
                    1 => 0,  // normal
                    _ => -1, // go faster
                },
                std::sync::atomic::Ordering::Relaxed,
            );

            let signal = {
                let p = &mut *peer;
                let (audio0, audio1) = audio.split_at_mut(1);
                process_output_audio(
                    p.output_fmt,
                    &mut p.out_peak,
                    &mut audio0[0],
                    &mut audio1[0],
                    &mut p.out_buffer,
                );
                let midi_data = p.midi_data;
                let midi_len = p.midi_len;
                send_packet_frame(
                    &mut p.output_pkt,
                    p.output_fmt,
                    &mut p.out_buffer,
                    &midi_data[..midi_len],
                    p.multi_port,
                    &mut p.multi_wait,
                    &p.address,
                    ticks,
                )
            };

            match signal {
                ControlSignal::Watchdog => {
                    if peer.address[0].valid() && peer.output_pkt.is_empty() {
                        let mut pkt = PacketBuf::new();
                        pkt.put_ping(
                            kind::PING_REQUEST,
                            Ping {
                                packets: 0,
                                time_ms: ticks,
                                passwd: 0,
                                features: 0,
                            },
                        );
                        peer.output_pkt.queue_pkt(pkt);
                    }
                }
                ControlSignal::Timeout => {
                    peer.init();
                    timed_out = true;
                }
                ControlSignal::None => {}
            }

            if !timed_out && ticks & 0x3fff == 0 {
                peer.out_audio[0].schedule_adjust();
                peer.out_audio[1].schedule_adjust();
                peer.in_audio[0].schedule_adjust();
                peer.in_audio[1].schedule_adjust();
            }
        }

        if timed_out {
            log::debug!("control stream timed out, session closed");
            events.push(ClientEvent::ControlTimeout);
        }
        for event in events {
            let _ = self.events.send(event);
        }
    }

    fn handle_control(peer: &mut ClientPeer, pkt: &PacketRef<'_>, events: &mut Vec<ClientEvent>) {
        match pkt.kind() {
            kind::PING_REQUEST => {
                if let Some(ping) = pkt.get_ping() {
                    if peer.output_pkt.find(kind::PING_REPLY).is_none() {
                        let mut reply = PacketBuf::new();
                        reply.put_ping(
                            kind::PING_REPLY,
                            Ping {
                                packets: 0,
                                time_ms: ping.time_ms,
                                passwd: 0,
                                features: ping.features & FEATURE_MULTI_PORT,
                            },
                        );
                        peer.output_pkt.queue_pkt(reply);
                    }
                }
            }
            kind::PING_REPLY => {
                if let Some(ping) = pkt.get_ping() {
                    if ping.features & FEATURE_MULTI_PORT != 0 {
                        peer.multi_port = true;
                    }
                }
            }
            kind::LYRICS_REPLY => {
                if let Some(data) = pkt.get_raw_data() {
                    events.push(ClientEvent::Lyrics(text_of(data)));
                }
            }
            kind::CHAT_REPLY => {
                if let Some(data) = pkt.get_raw_data() {
                    events.push(ClientEvent::Chat(text_of(data)));
                }
            }
            kind::FADER_ICON_REPLY => {
                if let Some((mix, index, data)) = pkt.get_fader_data() {
                    if mix != 0 {
                        return;
                    }
                    if peer.self_index.is_none() {
                        peer.self_index = Some(index);
                        events.push(ClientEvent::FaderSelf { index });
                    }
                    events.push(ClientEvent::FaderIcon {
                        index,
                        icon: data.to_vec(),
                    });
                }
            }
            kind::FADER_NAME_REPLY => {
                if let Some((mix, index, data)) = pkt.get_fader_data() {
                    if mix != 0 {
                        return;
                    }
                    if peer.self_index.is_none() {
                        peer.self_index = Some(index);
                        events.push(ClientEvent::FaderSelf { index });
                    }
                    events.push(ClientEvent::FaderName {
                        index,
                        name: text_of(data),
                    });
                }
            }
            kind::FADER_GAIN_REPLY | kind::FADER_PAN_REPLY => {
                let mut values = [0.0f32; 512];
                if let Some((mix, index, num)) = pkt.get_fader_value(&mut values) {
                    if mix != 0 || num == 0 || index as usize + num > PEERS_MAX {
                        return;
                    }
                    for (i, &value) in values[..num].iter().enumerate() {
                        let index = index + i as u8;
                        events.push(if pkt.kind() == kind::FADER_GAIN_REPLY {
                            ClientEvent::FaderGain { index, gain: value }
                        } else {
                            ClientEvent::FaderPan { index, pan: value }
                        });
                    }
                }
            }
            kind::FADER_LEVEL_REPLY => {
                let mut values = [0.0f32; 512];
                if let Some((mix, index, num)) = pkt.get_fader_value(&mut values) {
                    if mix != 0 || num == 0 || num % 2 != 0 {
                        return;
                    }
                    if index as usize + num / 2 > PEERS_MAX {
                        return;
                    }
                    for i in 0..(num / 2) {
                        events.push(ClientEvent::FaderLevel {
                            index: index + i as u8,
                            left: values[2 * i],
                            right: values[2 * i + 1],
                        });
                    }
                }
            }
            kind::LOCAL_GAIN_REPLY => {
                let mut values = [0.0f32; 512];
                if let Some((mix, index, num)) = pkt.get_fader_value(&mut values) {
                    if mix == 0 && index == 0 && num == 1 {
                        peer.in_gain = values[0];
                    }
                }
            }
            kind::LOCAL_PAN_REPLY => {
                let mut values = [0.0f32; 512];
                if let Some((mix, index, num)) = pkt.get_fader_value(&mut values) {
                    if mix == 0 && index == 0 && num == 1 {
                        peer.in_pan = values[0];
                    }
                }
            }
            kind::FADER_EQ_REPLY => {
                if let Some((mix, index, data)) = pkt.get_fader_data() {
                    if mix != 0 {
                        return;
                    }
                    events.push(ClientEvent::FaderEq {
                        index,
                        spec: text_of(data),
                    });
                }
            }
            kind::LOCAL_EQ_REPLY => {
                if let Some((mix, index, data)) = pkt.get_fader_data() {
                    if mix != 0 || index != 0 {
                        return;
                    }
                    let spec = text_of(data);
                    if peer.eq.init(&spec).is_err() {
                        log::debug!("rejected equalizer spec from server");
                    }
                }
            }
            kind::FADER_DISCONNECT_REPLY => {
                if let Some((mix, index, _)) = pkt.get_fader_data() {
                    if mix != 0 {
                        return;
                    }
                    events.push(ClientEvent::FaderDisconnect { index });
                }
            }
            _ => {}
        }
    }

    /// Queue a chat line for reliable delivery.
    pub fn send_chat(&self, text: &str) {
        self.queue_raw(kind::CHAT_REQUEST, text.as_bytes());
    }

    pub fn send_lyrics(&self, text: &str) {
        self.queue_raw(kind::LYRICS_REQUEST, text.as_bytes());
    }

    fn queue_raw(&self, req: u8, data: &[u8]) {
        // one sub-packet carries at most 254 payload words
        let data = &data[..data.len().min(1000)];
        let mut peer = self.peer.lock();
        if !peer.address[0].valid() {
            return;
        }
        let mut pkt = PacketBuf::new();
        pkt.put_raw_data(req, data, 0);
        peer.output_pkt.queue_pkt(pkt);
    }

    /// Ask the server to change gains starting at `index`. Coalesces
    /// with an already queued request of the same type.
    pub fn set_fader_gain(&self, index: u8, gains: &[f32]) {
        self.queue_fader_value(kind::FADER_GAIN_REQUEST, index, gains);
    }

    pub fn set_fader_pan(&self, index: u8, pans: &[f32]) {
        self.queue_fader_value(kind::FADER_PAN_REQUEST, index, pans);
    }

    fn queue_fader_value(&self, req: u8, index: u8, values: &[f32]) {
        let mut peer = self.peer.lock();
        if !peer.address[0].valid() {
            return;
        }
        let mut pkt = PacketBuf::new();
        pkt.put_fader_value(req, 0, index, values);
        peer.output_pkt.queue_or_replace(pkt);
    }

    /// Update this client's mix vector on the server.
    pub fn set_fader_bits(&self, index: u8, bits: &[u8]) {
        let mut peer = self.peer.lock();
        if !peer.address[0].valid() {
            return;
        }
        let mut pkt = PacketBuf::new();
        pkt.put_fader_data(kind::FADER_BITS_REQUEST, 0, index, bits);
        peer.output_pkt.queue_or_replace(pkt);
    }

    pub fn set_fader_eq(&self, index: u8, spec: &str) {
        let data = spec.as_bytes();
        let data = &data[..data.len().min(1000)];
        let mut peer = self.peer.lock();
        if !peer.address[0].valid() {
            return;
        }
        let mut pkt = PacketBuf::new();
        pkt.put_fader_data(kind::FADER_EQ_REQUEST, 0, index, data);
        peer.output_pkt.queue_or_replace(pkt);
    }

    /// Change the downlink audio format mid-session.
    pub fn request_configure(&self, format: u8) {
        let mut peer = self.peer.lock();
        if !peer.address[0].valid() {
            return;
        }
        let mut pkt = PacketBuf::new();
        pkt.put_configure(kind::CONFIGURE_REQUEST, format);
        peer.output_pkt.queue_or_replace(pkt);
    }

    /// Local monitoring parameters: dry gain, wet balance and pan.
    pub fn set_monitor(&self, gain: f32, balance: f32, pan: f32) {
        let mut peer = self.peer.lock();
        peer.mon_gain = [gain, balance];
        peer.mon_pan = pan;
    }

    /// Local MUTE/SOLO/INVERT bits applied in the callback path.
    pub fn set_bits(&self, bits: u8) {
        self.peer.lock().bits = bits;
    }

    pub fn set_local_eq(&self, spec: &str) -> bool {
        self.peer.lock().local_eq.init(spec).is_ok()
    }

    /// Feed local MIDI towards the server.
    pub fn push_midi(&self, data: &[u8]) {
        self.peer.lock().out_midi.add_data(data);
    }

    /// Pull the next complete received MIDI command, if any.
    pub fn read_midi(&self, out: &mut [u8]) -> usize {
        let mut peer = self.peer.lock();
        let p = &mut *peer;
        p.midi_proc.process(&mut p.in_midi, out)
    }
}

fn text_of(data: &[u8]) -> String {
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0 {
        end -= 1;
    }
    String::from_utf8_lossy(&data[..end]).into_owned()
}
