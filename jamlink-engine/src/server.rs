//! The mixing server.
//!
//! Every participant owns a mutex-guarded peer record. A 1 ms tick runs
//! three phases over all peers - export (drain the network, pull one
//! tick of audio), mix (compose each peer's personalised mix from the
//! shared default mix) and import (condition, serialize, send) - fanned
//! out across the worker gate. Control messages are answered inline and
//! rebroadcast to the other participants; cross-peer work is deferred
//! until the handling peer's lock is dropped so no two peer locks are
//! ever held together.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use jamlink_dsp::buffer::{AudioBuffer, AudioLevel};
use jamlink_dsp::midi::{MidiBuffer, MIDI_BUFFER_MAX};
use jamlink_proto::frame::Frame;
use jamlink_proto::input::InputPacketizer;
use jamlink_proto::output::{ControlSignal, OutputPacketizer};
use jamlink_proto::packet::{kind, PacketBuf, PacketRef, Ping};
use jamlink_proto::{DEF_SAMPLES, FEATURE_MULTI_PORT, PEERS_MAX, PORTS_MAX};

use crate::executor::{Executor, Phase};
use crate::media::{
    float_gain, gain_from_bits, process_output_audio, receive_unsequenced, send_packet_frame,
};
use crate::runtime::Runtime;
use crate::socket::{SocketAddress, Transport};
use crate::{BIT_INVERT, BIT_MUTE, BIT_SOLO};

/// Ticks a fresh connection keeps sending on the base port before the
/// multi-port stripes engage.
pub const MULTI_PORT_DELAY_TICKS: u16 = 1000;

/// Byte limits accepted for participant metadata.
const ICON_BYTES_MAX: usize = 1000;
const NAME_BYTES_MAX: usize = 32;
const CHAT_BYTES_MAX: usize = 128 + 32 + 4;

/// Peers reported per level message.
const LEVELS_PER_MSG: usize = 32;

/// Sink for the combined default mix (diagnostic streaming boundary).
pub trait MixStream: Send {
    fn push(&mut self, left: &[f32], right: &[f32]);
}

/// One participant slot on the server.
pub struct ServerPeer {
    pub address: [SocketAddress; PORTS_MAX],
    pub input_pkt: InputPacketizer,
    pub output_pkt: OutputPacketizer,
    pub in_audio: [AudioBuffer; 2],
    pub out_buffer: [AudioBuffer; 2],
    pub in_level: [AudioLevel; 2],
    pub in_midi: MidiBuffer,
    /// One tick of decoded input, exported for mixing.
    pub tmp_audio: [[f32; DEF_SAMPLES]; 2],
    /// This peer's personalised mix for the current tick.
    pub out_audio: [[f32; DEF_SAMPLES]; 2],
    pub out_peak: f32,
    pub name: String,
    pub icon: Vec<u8>,
    /// Mixer byte per other participant, indexed by peer id.
    pub bits: [u8; PEERS_MAX],
    pub gain: f32,
    pub pan: f32,
    pub eq_data: Vec<u8>,
    pub output_fmt: u8,
    pub valid: bool,
    pub multi_port: bool,
    pub multi_wait: u16,
    pub allow_mixer_access: bool,
}

impl Default for ServerPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerPeer {
    pub fn new() -> Self {
        Self {
            address: std::array::from_fn(|_| SocketAddress::invalid()),
            input_pkt: InputPacketizer::new(),
            output_pkt: OutputPacketizer::new(),
            in_audio: [AudioBuffer::new(), AudioBuffer::new()],
            out_buffer: [AudioBuffer::new(), AudioBuffer::new()],
            in_level: [AudioLevel::new(), AudioLevel::new()],
            in_midi: MidiBuffer::new(),
            tmp_audio: [[0.0; DEF_SAMPLES]; 2],
            out_audio: [[0.0; DEF_SAMPLES]; 2],
            out_peak: 0.0,
            name: String::new(),
            icon: Vec::new(),
            bits: [0; PEERS_MAX],
            gain: 1.0,
            pan: 0.0,
            eq_data: Vec::new(),
            output_fmt: kind::AUDIO_SILENCE,
            valid: false,
            multi_port: false,
            multi_wait: 0,
            allow_mixer_access: false,
        }
    }

    /// Return the slot to its inert state.
    pub fn init(&mut self) {
        for address in &mut self.address {
            address.clear();
        }
        self.input_pkt.init();
        self.output_pkt.init();
        for buffer in &mut self.in_audio {
            buffer.clear();
        }
        for buffer in &mut self.out_buffer {
            buffer.clear();
        }
        for level in &mut self.in_level {
            level.clear();
        }
        self.in_midi.clear();
        self.tmp_audio = [[0.0; DEF_SAMPLES]; 2];
        self.out_audio = [[0.0; DEF_SAMPLES]; 2];
        self.out_peak = 0.0;
        self.name.clear();
        self.icon.clear();
        self.bits = [0; PEERS_MAX];
        self.gain = 1.0;
        self.pan = 0.0;
        self.eq_data.clear();
        self.output_fmt = kind::AUDIO_SILENCE;
        self.valid = false;
        self.multi_port = false;
        self.multi_wait = 0;
        self.allow_mixer_access = false;
    }
}

#[derive(Clone, Copy)]
struct DefaultMix {
    audio: [[f32; DEF_SAMPLES]; 2],
}

struct TickState {
    level_group: usize,
    midi_data: [u8; 16],
    midi_len: usize,
}

pub(crate) struct SocketTable {
    pub v4: Vec<Transport>,
    pub v6: Vec<Transport>,
}

/// Cross-peer work queued while a peer's lock is held, applied after it
/// is dropped.
enum Deferred {
    Broadcast { pkt: PacketBuf, single: bool },
    /// Catch a freshly announced client up on everyone else's metadata.
    MetaCatchUp { icons: bool },
    SetValues { kind: u8, index: u8, values: Vec<f32> },
    SetEq { index: u8, data: Vec<u8> },
}

pub struct Server {
    peers: Vec<Mutex<ServerPeer>>,
    pub(crate) executor: Executor,
    default_mix: Vec<Mutex<DefaultMix>>,
    default_midi: Vec<Mutex<MidiBuffer>>,
    adjust: [AtomicU32; 3],
    tick_state: Mutex<TickState>,
    socks: Mutex<SocketTable>,
    mix_stream: Mutex<Option<Box<dyn MixStream>>>,
}

impl Server {
    pub fn new(num_peers: usize, num_workers: usize) -> Self {
        let executor = Executor::new(num_workers);
        let workers = executor.num_workers();
        Self {
            peers: (0..num_peers).map(|_| Mutex::new(ServerPeer::new())).collect(),
            executor,
            default_mix: (0..workers)
                .map(|_| {
                    Mutex::new(DefaultMix {
                        audio: [[0.0; DEF_SAMPLES]; 2],
                    })
                })
                .collect(),
            default_midi: (0..workers).map(|_| Mutex::new(MidiBuffer::new())).collect(),
            adjust: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            tick_state: Mutex::new(TickState {
                level_group: 0,
                midi_data: [0; 16],
                midi_len: 0,
            }),
            socks: Mutex::new(SocketTable {
                v4: vec![Transport::None; PORTS_MAX],
                v6: vec![Transport::None; PORTS_MAX],
            }),
            mix_stream: Mutex::new(None),
        }
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, index: usize) -> &Mutex<ServerPeer> {
        &self.peers[index]
    }

    /// Attach the per-stripe transports for one address family.
    pub fn install_stripe_transports(&self, ipv6: bool, transports: Vec<Transport>) {
        debug_assert_eq!(transports.len(), PORTS_MAX);
        let mut socks = self.socks.lock();
        if ipv6 {
            socks.v6 = transports;
        } else {
            socks.v4 = transports;
        }
    }

    pub fn set_mix_stream(&self, stream: Option<Box<dyn MixStream>>) {
        *self.mix_stream.lock() = stream;
    }

    /// Dispatch one received frame: an established peer's traffic goes
    /// straight to its jitter buffer; anything else may only open a
    /// session through a zero-sequence ping with the right password.
    pub fn receive(&self, rt: &Runtime, src: &SocketAddress, frame: &Frame) {
        let ticks = rt.ticks();

        for x in (0..self.peers.len()).rev() {
            let mut peer = self.peers[x].lock();
            if peer.valid && peer.address[0] == *src {
                peer.input_pkt.receive(frame, ticks);
                return;
            }
        }

        let Some(ping) = frame
            .packets()
            .find(|p| p.kind() == kind::PING_REQUEST && p.seq_local() == 0 && p.seq_peer() == 0)
            .and_then(|p| p.get_ping())
        else {
            return;
        };

        // never answer a bad password, to avoid probing
        if rt.config.server_passwd != 0 && ping.passwd != rt.config.server_passwd {
            if rt.config.mixer_passwd == 0 || ping.passwd != rt.config.mixer_passwd {
                return;
            }
        }

        for x in (0..self.peers.len()).rev() {
            {
                let mut peer = self.peers[x].lock();
                if peer.valid {
                    continue;
                }

                peer.allow_mixer_access =
                    rt.config.mixer_passwd == 0 || rt.config.mixer_passwd == ping.passwd;
                peer.valid = true;

                let socks = self.socks.lock();
                let table = if src.is_ipv6() { &socks.v6 } else { &socks.v4 };
                for i in 0..PORTS_MAX {
                    let mut address = src.clone();
                    address.set_transport(table[i].clone());
                    peer.address[i] = address;
                }
                drop(socks);

                peer.gain = 1.0;
                peer.pan = 0.0;
                peer.eq_data.clear();
                peer.multi_wait = MULTI_PORT_DELAY_TICKS;
                peer.input_pkt.receive(frame, ticks);
                self.send_welcome(rt, &mut peer);
                log::debug!("peer {} connected from {:?}", x, src);
            }

            self.send_mixer_parameters(x);

            // nobody has an opinion about the newcomer yet
            for y in 0..self.peers.len() {
                if y != x {
                    self.peers[y].lock().bits[x] = 0;
                }
            }
            return;
        }
    }

    /// One 1 ms tick. Returns whether any participant is connected.
    pub fn tick(&self, rt: &Runtime) -> bool {
        for counter in &self.adjust {
            counter.store(0, Ordering::Relaxed);
        }
        for mix in &self.default_mix {
            mix.lock().audio = [[0.0; DEF_SAMPLES]; 2];
        }

        self.execute(rt, Phase::Export);

        // merge the per-worker mixes and MIDI into worker zero
        {
            let mut mix0 = self.default_mix[0].lock();
            for rem in 1..self.executor.num_workers() {
                {
                    let other = self.default_mix[rem].lock();
                    for z in 0..DEF_SAMPLES {
                        mix0.audio[0][z] += other.audio[0][z];
                        mix0.audio[1][z] += other.audio[1][z];
                    }
                }
                let mut temp = [0u8; MIDI_BUFFER_MAX];
                let num = self.default_midi[rem].lock().rem_data(&mut temp);
                if num != 0 {
                    self.default_midi[0].lock().add_data(&temp[..num]);
                }
            }

            if let Some(stream) = self.mix_stream.lock().as_mut() {
                stream.push(&mix0.audio[0], &mix0.audio[1]);
            }
        }

        self.send_levels(rt);

        self.execute(rt, Phase::Mix);

        // MIDI goes out on alternate ticks
        {
            let mut ts = self.tick_state.lock();
            if ts.midi_len == 0 {
                let mut temp = [0u8; 16];
                let num = self.default_midi[0].lock().rem_data(&mut temp);
                ts.midi_data = temp;
                ts.midi_len = num;
            } else {
                ts.midi_len = 0;
            }
        }

        self.execute(rt, Phase::Import);

        // steer the timer by majority vote
        let votes = [
            self.adjust[0].load(Ordering::Relaxed),
            self.adjust[1].load(Ordering::Relaxed),
            self.adjust[2].load(Ordering::Relaxed),
        ];
        let adjust = if votes[1] >= votes[0] && votes[1] >= votes[2] {
            0
        } else if votes[0] >= votes[1] && votes[0] >= votes[2] {
            1
        } else {
            -1
        };
        rt.timer_adjust.store(adjust, Ordering::Relaxed);

        // visit one peer's buffers per tick window (~16 s round trip)
        let y = (rt.ticks() & 0x3fff) as usize;
        if y < self.peers.len() {
            let mut peer = self.peers[y].lock();
            if peer.valid {
                peer.out_buffer[0].schedule_adjust();
                peer.out_buffer[1].schedule_adjust();
                peer.in_audio[0].schedule_adjust();
                peer.in_audio[1].schedule_adjust();
            }
        }

        self.peers.iter().any(|p| p.lock().valid)
    }

    fn execute(&self, rt: &Runtime, phase: Phase) {
        self.executor.dispatch(phase);
        let claimed = self.executor.claim(0);
        self.run_phase(rt, claimed, 0);
        self.executor.complete(0);
        self.executor.await_idle();
    }

    pub(crate) fn run_phase(&self, rt: &Runtime, phase: Phase, rem: usize) {
        let step = self.executor.num_workers();
        let mut x = rem;
        while x < self.peers.len() {
            match phase {
                Phase::Export => self.peer_export(rt, x, rem),
                Phase::Mix => self.peer_mix(rt, x),
                Phase::Import => self.peer_import(rt, x),
            }
            x += step;
        }
    }

    fn peer_export(&self, rt: &Runtime, x: usize, rem: usize) {
        let ticks = rt.ticks();
        let mut deferred: Vec<Deferred> = Vec::new();

        {
            let mut peer = self.peers[x].lock();
            if !peer.valid {
                peer.tmp_audio = [[0.0; DEF_SAMPLES]; 2];
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

                    self.handle_control(rt, x, &mut peer, &pkt, &mut deferred);
                }
            }

            // keep the reliable stream alive while idle
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

            {
                let p = &mut *peer;
                p.in_audio[0].rem_samples(&mut p.tmp_audio[0]);
                p.in_audio[1].rem_samples(&mut p.tmp_audio[1]);
            }
            self.adjust[peer.in_audio[0].low_water_class() as usize]
                .fetch_add(1, Ordering::Relaxed);

            {
                let mut mix = self.default_mix[rem].lock();
                for z in 0..DEF_SAMPLES {
                    mix.audio[0][z] += peer.tmp_audio[0][z];
                    mix.audio[1][z] += peer.tmp_audio[1][z];
                }
            }

            let mut temp = [0u8; MIDI_BUFFER_MAX];
            let num = peer.in_midi.rem_data(&mut temp);
            if num != 0 {
                self.default_midi[rem].lock().add_data(&temp[..num]);
            }
        }

        self.apply_deferred(x, deferred);
    }

    fn handle_control(
        &self,
        rt: &Runtime,
        x: usize,
        peer: &mut ServerPeer,
        pkt: &PacketRef<'_>,
        deferred: &mut Vec<Deferred>,
    ) {
        let num_peers = self.peers.len();

        match pkt.kind() {
            kind::CONFIGURE_REQUEST => {
                peer.output_fmt = pkt.get_configure().unwrap_or(kind::AUDIO_SILENCE);
            }
            kind::PING_REQUEST => {
                if let Some(ping) = pkt.get_ping() {
                    if peer.output_pkt.find(kind::PING_REPLY).is_none() {
                        let mut features = ping.features;
                        if rt.config.no_multi_port {
                            features &= !FEATURE_MULTI_PORT;
                        }
                        let mut reply = PacketBuf::new();
                        reply.put_ping(
                            kind::PING_REPLY,
                            Ping {
                                packets: 0,
                                time_ms: ping.time_ms,
                                passwd: 0,
                                features: features & FEATURE_MULTI_PORT,
                            },
                        );
                        peer.output_pkt.queue_pkt(reply);

                        if features & FEATURE_MULTI_PORT != 0 {
                            peer.multi_port = true;
                        }
                    }
                }
            }
            kind::ICON_REQUEST => {
                if let Some(data) = pkt.get_raw_data() {
                    let data = trim_padding(data);
                    peer.icon = data[..data.len().min(ICON_BYTES_MAX)].to_vec();

                    let mut reply = PacketBuf::new();
                    reply.put_fader_data(kind::FADER_ICON_REPLY, 0, x as u8, &peer.icon);
                    peer.output_pkt.queue_pkt(reply.clone());
                    deferred.push(Deferred::Broadcast {
                        pkt: reply,
                        single: false,
                    });
                    deferred.push(Deferred::MetaCatchUp { icons: true });
                }
            }
            kind::NAME_REQUEST => {
                if let Some(data) = pkt.get_raw_data() {
                    let data = trim_padding(data);
                    let data = &data[..data.len().min(NAME_BYTES_MAX)];
                    peer.name = String::from_utf8_lossy(data).into_owned();

                    let mut reply = PacketBuf::new();
                    reply.put_fader_data(kind::FADER_NAME_REPLY, 0, x as u8, data);
                    peer.output_pkt.queue_pkt(reply.clone());
                    deferred.push(Deferred::Broadcast {
                        pkt: reply,
                        single: false,
                    });
                    deferred.push(Deferred::MetaCatchUp { icons: false });
                }
            }
            kind::LYRICS_REQUEST => {
                if let Some(data) = pkt.get_raw_data() {
                    let mut reply = PacketBuf::new();
                    reply.put_raw_data(kind::LYRICS_REPLY, trim_padding(data), 0);
                    peer.output_pkt.queue_pkt(reply.clone());
                    deferred.push(Deferred::Broadcast {
                        pkt: reply,
                        single: false,
                    });
                }
            }
            kind::CHAT_REQUEST => {
                if let Some(data) = pkt.get_raw_data() {
                    let text = String::from_utf8_lossy(trim_padding(data)).into_owned();
                    let mut line = format!("[{}]: {}", peer.name, text);
                    truncate_utf8(&mut line, CHAT_BYTES_MAX);

                    let mut reply = PacketBuf::new();
                    reply.put_raw_data(kind::CHAT_REPLY, line.as_bytes(), 0);
                    peer.output_pkt.queue_pkt(reply.clone());
                    deferred.push(Deferred::Broadcast {
                        pkt: reply,
                        single: false,
                    });
                }
            }
            kind::FADER_GAIN_REQUEST | kind::FADER_PAN_REQUEST => {
                if !peer.allow_mixer_access {
                    return;
                }
                let mut values = [0.0f32; 512];
                if let Some((mix, index, num)) = pkt.get_fader_value(&mut values) {
                    if mix != 0 || num == 0 {
                        return;
                    }
                    if index as usize + num > num_peers {
                        return;
                    }
                    let is_gain = pkt.kind() == kind::FADER_GAIN_REQUEST;
                    let values = values[..num].to_vec();

                    let mut echo = PacketBuf::new();
                    echo.put_fader_value(
                        if is_gain {
                            kind::FADER_GAIN_REPLY
                        } else {
                            kind::FADER_PAN_REPLY
                        },
                        mix,
                        index,
                        &values,
                    );
                    deferred.push(Deferred::Broadcast {
                        pkt: echo,
                        single: false,
                    });
                    deferred.push(Deferred::SetValues {
                        kind: pkt.kind(),
                        index,
                        values,
                    });
                }
            }
            kind::FADER_EQ_REQUEST => {
                if !peer.allow_mixer_access {
                    return;
                }
                if let Some((mix, index, data)) = pkt.get_fader_data() {
                    if mix != 0 || index as usize >= num_peers {
                        return;
                    }
                    let mut echo = PacketBuf::new();
                    echo.put_fader_data(kind::FADER_EQ_REPLY, mix, index, data);
                    deferred.push(Deferred::Broadcast {
                        pkt: echo,
                        single: false,
                    });
                    deferred.push(Deferred::SetEq {
                        index,
                        data: data.to_vec(),
                    });
                }
            }
            kind::FADER_BITS_REQUEST => {
                if let Some((mix, index, data)) = pkt.get_fader_data() {
                    if mix != 0 || data.is_empty() {
                        return;
                    }
                    if index as usize + data.len() > num_peers {
                        return;
                    }
                    peer.bits[index as usize..index as usize + data.len()].copy_from_slice(data);
                }
            }
            _ => {}
        }
    }

    fn apply_deferred(&self, x: usize, deferred: Vec<Deferred>) {
        for action in deferred {
            match action {
                Deferred::Broadcast { pkt, single } => self.broadcast(&pkt, Some(x), single),
                Deferred::MetaCatchUp { icons } => {
                    let mut replies = Vec::new();
                    for y in 0..self.peers.len() {
                        if y == x {
                            continue;
                        }
                        let other = self.peers[y].lock();
                        if !other.valid {
                            continue;
                        }
                        let bytes = if icons {
                            other.icon.clone()
                        } else {
                            other.name.as_bytes().to_vec()
                        };
                        let mut pkt = PacketBuf::new();
                        pkt.put_fader_data(
                            if icons {
                                kind::FADER_ICON_REPLY
                            } else {
                                kind::FADER_NAME_REPLY
                            },
                            0,
                            y as u8,
                            &bytes,
                        );
                        replies.push(pkt);
                    }
                    let mut peer = self.peers[x].lock();
                    for pkt in replies {
                        peer.output_pkt.queue_pkt(pkt);
                    }
                }
                Deferred::SetValues {
                    kind: req,
                    index,
                    values,
                } => {
                    for (i, &value) in values.iter().enumerate() {
                        let target = index as usize + i;
                        let mut peer = self.peers[target].lock();

                        let mut local = PacketBuf::new();
                        if req == kind::FADER_GAIN_REQUEST {
                            local.put_fader_value(kind::LOCAL_GAIN_REPLY, 0, 0, &[value]);
                            peer.gain = value;
                        } else {
                            local.put_fader_value(kind::LOCAL_PAN_REPLY, 0, 0, &[value]);
                            peer.pan = value;
                        }
                        peer.output_pkt.queue_pkt(local);
                    }
                }
                Deferred::SetEq { index, data } => {
                    let mut peer = self.peers[index as usize].lock();
                    let mut local = PacketBuf::new();
                    local.put_fader_data(kind::LOCAL_EQ_REPLY, 0, 0, &data);
                    peer.output_pkt.queue_pkt(local);
                    peer.eq_data = data;
                }
            }
        }
    }

    fn peer_mix(&self, rt: &Runtime, x: usize) {
        let num_peers = self.peers.len();

        let (valid, bits) = {
            let peer = self.peers[x].lock();
            (peer.valid, peer.bits)
        };
        if !valid || rt.config.mute_peer_audio {
            self.peers[x].lock().out_audio = [[0.0; DEF_SAMPLES]; 2];
            return;
        }

        let solo = bits[..num_peers].iter().any(|b| b & BIT_SOLO != 0);

        let mut out = if solo {
            [[0.0; DEF_SAMPLES]; 2]
        } else {
            self.default_mix[0].lock().audio
        };

        for y in 0..num_peers {
            if solo {
                if bits[y] & BIT_SOLO == 0 {
                    continue;
                }
            } else if bits[y] == 0 {
                continue;
            }

            let tmp = {
                let other = self.peers[y].lock();
                if !other.valid {
                    continue;
                }
                other.tmp_audio
            };

            if solo {
                let gain = gain_from_bits(bits[y]);
                if bits[y] & BIT_INVERT != 0 {
                    for z in 0..DEF_SAMPLES {
                        out[0][z] -= float_gain(tmp[0][z], gain);
                        out[1][z] -= float_gain(tmp[1][z], gain);
                    }
                } else {
                    for z in 0..DEF_SAMPLES {
                        out[0][z] += float_gain(tmp[0][z], gain);
                        out[1][z] += float_gain(tmp[1][z], gain);
                    }
                }
            } else if bits[y] & BIT_MUTE != 0 {
                // silence this contribution out of the default mix
                for z in 0..DEF_SAMPLES {
                    out[0][z] -= tmp[0][z];
                    out[1][z] -= tmp[1][z];
                }
            } else if bits[y] & BIT_INVERT != 0 {
                let gain = gain_from_bits(bits[y]) + 256;
                for z in 0..DEF_SAMPLES {
                    out[0][z] -= float_gain(tmp[0][z], gain);
                    out[1][z] -= float_gain(tmp[1][z], gain);
                }
            } else {
                let gain = gain_from_bits(bits[y]) - 256;
                for z in 0..DEF_SAMPLES {
                    out[0][z] += float_gain(tmp[0][z], gain);
                    out[1][z] += float_gain(tmp[1][z], gain);
                }
            }
        }

        self.peers[x].lock().out_audio = out;
    }

    fn peer_import(&self, rt: &Runtime, x: usize) {
        let ticks = rt.ticks();
        let (midi_data, midi_len) = {
            let ts = self.tick_state.lock();
            (ts.midi_data, ts.midi_len)
        };

        let timed_out = {
            let mut peer = self.peers[x].lock();
            if !peer.valid {
                return;
            }
            let p = &mut *peer;

            let mut left = p.out_audio[0];
            let mut right = p.out_audio[1];
            process_output_audio(
                p.output_fmt,
                &mut p.out_peak,
                &mut left,
                &mut right,
                &mut p.out_buffer,
            );

            let signal = send_packet_frame(
                &mut p.output_pkt,
                p.output_fmt,
                &mut p.out_buffer,
                &midi_data[..midi_len],
                p.multi_port,
                &mut p.multi_wait,
                &p.address,
                ticks,
            );

            match signal {
                ControlSignal::Watchdog => {
                    // probe before giving up on the control stream
                    if p.address[0].valid() && p.output_pkt.is_empty() {
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
                        p.output_pkt.queue_pkt(pkt);
                    }
                    false
                }
                ControlSignal::Timeout => {
                    peer.init();
                    true
                }
                ControlSignal::None => false,
            }
        };

        if timed_out {
            log::debug!("peer {} control timeout, disconnecting", x);
            let mut pkt = PacketBuf::new();
            pkt.put_fader_data(kind::FADER_DISCONNECT_REPLY, 0, x as u8, &[]);
            self.broadcast(&pkt, Some(x), false);
        }
    }

    /// Broadcast one level report covering a rotating group of peers.
    fn send_levels(&self, rt: &Runtime) {
        if rt.ticks() % 128 != 0 {
            return;
        }

        let group = {
            let mut ts = self.tick_state.lock();
            let group = ts.level_group;
            ts.level_group += 1;
            if ts.level_group * LEVELS_PER_MSG >= self.peers.len() {
                ts.level_group = 0;
            }
            group
        };

        let mut levels = [0.0f32; 2 * LEVELS_PER_MSG];
        for i in 0..LEVELS_PER_MSG {
            let index = i + group * LEVELS_PER_MSG;
            if index >= self.peers.len() {
                continue;
            }
            let mut peer = self.peers[index].lock();
            if peer.valid {
                levels[2 * i] = peer.in_level[0].get_level();
                levels[2 * i + 1] = peer.in_level[1].get_level();
            }
        }

        let mut pkt = PacketBuf::new();
        pkt.put_fader_value(
            kind::FADER_LEVEL_REPLY,
            0,
            (group * LEVELS_PER_MSG) as u8,
            &levels,
        );
        self.broadcast(&pkt, None, true);
    }

    fn broadcast(&self, pkt: &PacketBuf, except: Option<usize>, single: bool) {
        for y in 0..self.peers.len() {
            if Some(y) == except {
                continue;
            }
            let mut peer = self.peers[y].lock();
            if !peer.valid {
                continue;
            }
            if single && peer.output_pkt.find(pkt.kind()).is_some() {
                continue;
            }
            peer.output_pkt.queue_pkt(pkt.clone());
        }
    }

    fn send_welcome(&self, rt: &Runtime, peer: &mut ServerPeer) {
        for line in &rt.config.welcome_lines {
            let mut line = line.clone();
            truncate_utf8(&mut line, 128);
            let mut pkt = PacketBuf::new();
            pkt.put_raw_data(kind::CHAT_REPLY, line.as_bytes(), 0);
            peer.output_pkt.queue_pkt(pkt);
        }
    }

    /// Bring a newly connected peer up to date on everyone's mixer
    /// state: gains and pans in groups, then the per-peer EQ blobs.
    fn send_mixer_parameters(&self, x: usize) {
        let num_peers = self.peers.len();
        let group_max = num_peers.div_ceil(LEVELS_PER_MSG);
        let mut replies = Vec::new();

        for group in 0..group_max {
            let mut gains = [1.0f32; LEVELS_PER_MSG];
            let mut pans = [0.0f32; LEVELS_PER_MSG];

            for i in 0..LEVELS_PER_MSG {
                let index = i + group * LEVELS_PER_MSG;
                if index >= num_peers {
                    continue;
                }
                let peer = self.peers[index].lock();
                if peer.valid {
                    gains[i] = peer.gain;
                    pans[i] = peer.pan;
                }
            }

            let mut pkt = PacketBuf::new();
            pkt.put_fader_value(
                kind::FADER_GAIN_REPLY,
                0,
                (group * LEVELS_PER_MSG) as u8,
                &gains,
            );
            replies.push(pkt);

            let mut pkt = PacketBuf::new();
            pkt.put_fader_value(
                kind::FADER_PAN_REPLY,
                0,
                (group * LEVELS_PER_MSG) as u8,
                &pans,
            );
            replies.push(pkt);
        }

        for index in 0..num_peers {
            if index == x {
                continue;
            }
            let peer = self.peers[index].lock();
            if !peer.valid || peer.eq_data.is_empty() {
                continue;
            }
            let mut pkt = PacketBuf::new();
            pkt.put_fader_data(kind::FADER_EQ_REPLY, 0, index as u8, &peer.eq_data);
            replies.push(pkt);
        }

        let mut peer = self.peers[x].lock();
        for pkt in replies {
            peer.output_pkt.queue_pkt(pkt);
        }
    }

    /// Administrative disconnect, equivalent to a control timeout.
    pub fn kick(&self, index: usize) {
        if index >= self.peers.len() {
            return;
        }
        let was_valid = {
            let mut peer = self.peers[index].lock();
            let was_valid = peer.valid;
            peer.init();
            was_valid
        };
        if was_valid {
            let mut pkt = PacketBuf::new();
            pkt.put_fader_data(kind::FADER_DISCONNECT_REPLY, 0, index as u8, &[]);
            self.broadcast(&pkt, Some(index), false);
        }
    }
}

/// Strip the zero padding the 4-byte wire grid appends to raw text.
fn trim_padding(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0 {
        end -= 1;
    }
    &data[..end]
}

fn truncate_utf8(text: &mut String, max: usize) {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_padding_strips_trailing_zeros() {
        assert_eq!(trim_padding(&[1, 2, 0, 0]), &[1, 2]);
        assert_eq!(trim_padding(&[0, 0]), &[] as &[u8]);
        assert_eq!(trim_padding(&[1]), &[1]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let mut text = String::from("abcd\u{00e9}f");
        truncate_utf8(&mut text, 5);
        assert_eq!(text, "abcd");
    }
}
