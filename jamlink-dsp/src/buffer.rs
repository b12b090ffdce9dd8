//! Adaptive audio ring buffer.
//!
//! Holds up to 32 ms of mono float samples between the network and the
//! audio clock. Underflow is bridged with a looping waveform synthesized
//! from the last written samples, overflow drops the tail, and a pending
//! resize request converges the fill level on `target_water` by linearly
//! interpolating the content in place. Low/high water marks observed per
//! window drive both the resize and the scheduler's faster/slower vote.

use jamlink_proto::{DEF_SAMPLES, SAMPLE_RATE};

use crate::pingpong::create_ping_pong_buffer;

/// Ring capacity: 32 ms at 48 kHz.
pub const MAX_SAMPLES: usize = 32 * DEF_SAMPLES;

/// Crossfade length after a discontinuity.
const FADE_SAMPLES: usize = DEF_SAMPLES;

/// Peak level meter with half-decay on read.
#[derive(Clone, Default)]
pub struct AudioLevel {
    level: f32,
}

impl AudioLevel {
    pub fn new() -> Self {
        Self { level: 0.0 }
    }

    pub fn clear(&mut self) {
        self.level = 0.0;
    }

    pub fn add_samples(&mut self, samples: &[f32]) {
        for &v in samples {
            let v = v.abs();
            if v > self.level {
                self.level = v;
            }
        }
        if self.level > 1.0 {
            self.level = 1.0;
        }
    }

    pub fn get_level(&mut self) -> f32 {
        let retval = self.level;
        self.level = retval / 2.0;
        retval
    }
}

pub struct AudioBuffer {
    samples: [f32; MAX_SAMPLES],
    ping_pong_data: [f32; FADE_SAMPLES],
    last_sample: f32,
    ping_pong_offset: usize,
    consumer: usize,
    total: usize,
    fade_in: u16,
    low_water: u16,
    high_water: u16,
    target_water: u16,
    adjust_pending: bool,
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBuffer {
    pub fn new() -> Self {
        let mut buffer = Self {
            samples: [0.0; MAX_SAMPLES],
            ping_pong_data: [0.0; FADE_SAMPLES],
            last_sample: 0.0,
            ping_pong_offset: 0,
            consumer: 0,
            total: 0,
            fade_in: FADE_SAMPLES as u16,
            low_water: MAX_SAMPLES as u16,
            high_water: 0,
            target_water: (MAX_SAMPLES / 2) as u16,
            adjust_pending: false,
        };
        buffer.clear();
        buffer
    }

    pub fn clear(&mut self) {
        self.samples = [0.0; MAX_SAMPLES];
        self.ping_pong_data = [0.0; FADE_SAMPLES];
        self.ping_pong_offset = 0;
        self.last_sample = 0.0;
        self.consumer = 0;
        self.total = 0;
        self.fade_in = FADE_SAMPLES as u16;
        self.low_water = MAX_SAMPLES as u16;
        self.high_water = 0;
        self.adjust_pending = false;
    }

    /// Number of buffered samples.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Request an in-place resize at the next suitable read.
    pub fn schedule_adjust(&mut self) {
        self.adjust_pending = true;
    }

    /// Set the fill target in 1 ms units; returns the clamped value.
    pub fn set_water_target(&mut self, value: i32) -> i32 {
        let mut value = value * DEF_SAMPLES as i32;
        if value > (MAX_SAMPLES / 2) as i32 {
            value = (MAX_SAMPLES / 2) as i32;
        } else if value < (4 * DEF_SAMPLES) as i32 {
            value = (4 * DEF_SAMPLES) as i32;
        }
        self.target_water = value as u16;
        value / DEF_SAMPLES as i32
    }

    /// Signed distance from the observed window midpoint to the fill
    /// target. Zero when the window is noisier than the target itself.
    pub fn water_ref(&self) -> i32 {
        if self.low_water > self.high_water {
            return 0;
        }
        let diff = (self.high_water - self.low_water) as i32 / 2;
        if diff > self.target_water as i32 {
            return 0;
        }
        self.low_water as i32 + diff - self.target_water as i32
    }

    /// Collapse [`water_ref`] to a scheduler class:
    /// 0 = running dry, go slower; 1 = normal; 2 = backed up, go faster.
    pub fn low_water_class(&self) -> u8 {
        let reference = self.water_ref();
        if reference < 0 {
            0
        } else if reference > 0 {
            2
        } else {
            1
        }
    }

    fn do_water(&mut self, num: usize) {
        if num > self.total {
            self.low_water = 0;
        } else if self.low_water as usize > self.total - num {
            self.low_water = (self.total - num) as u16;
        }
        if (self.high_water as usize) < self.total {
            self.high_water = self.total as u16;
        }
    }

    fn add_ping_pong(&mut self, sample: f32) {
        self.ping_pong_data[self.ping_pong_offset] = sample;
        self.ping_pong_offset += 1;
        if self.ping_pong_offset == FADE_SAMPLES {
            self.ping_pong_offset = 0;
        }
    }

    /// Write samples at the producer side, dropping any overflow tail.
    /// After a discontinuity the first samples crossfade against the
    /// ping-pong loop; the write tail refills the loop.
    pub fn add_samples(&mut self, src: &[f32]) {
        let mut producer = (self.consumer + self.total) % MAX_SAMPLES;
        let mut fwd = MAX_SAMPLES - producer;
        let max = MAX_SAMPLES - self.total;

        let mut num = src.len().min(max);
        let mut src = &src[..num];

        while num != 0 {
            if fwd > num {
                fwd = num;
            }
            if fwd != 0 {
                if self.fade_in != 0 {
                    for x in 0..fwd {
                        let f = self.fade_in as f32 / FADE_SAMPLES as f32;
                        let s =
                            self.ping_pong_data[(self.ping_pong_offset + x) % FADE_SAMPLES];
                        self.samples[producer + x] = src[x] - f * src[x] + s * f;
                        if self.fade_in != 0 {
                            self.fade_in -= 1;
                        }
                    }
                } else {
                    self.samples[producer..producer + fwd].copy_from_slice(&src[..fwd]);
                }

                // the tail of every write keeps the ping-pong loop fresh
                let from = if fwd < FADE_SAMPLES {
                    0
                } else {
                    fwd - FADE_SAMPLES
                };
                for off in from..fwd {
                    let sample = self.samples[producer + off];
                    self.add_ping_pong(sample);
                }

                self.last_sample = self.samples[producer + fwd - 1];
                src = &src[fwd..];
                num -= fwd;
                self.total += fwd;
                producer += fwd;
            }
            if producer == MAX_SAMPLES {
                producer = 0;
                fwd = MAX_SAMPLES;
            } else {
                debug_assert_eq!(num, 0);
                break;
            }
        }
    }

    /// Fill with the decaying ping-pong waveform instead of hard zeros.
    pub fn add_silence(&mut self, num: usize) {
        let mut producer = (self.consumer + self.total) % MAX_SAMPLES;
        let mut fwd = MAX_SAMPLES - producer;
        let max = MAX_SAMPLES - self.total;
        let mut num = num.min(max);

        // re-thread the loop so it starts at the most recent sample
        let window = self.ping_pong_data;
        create_ping_pong_buffer(
            &window,
            &mut self.ping_pong_data,
            self.ping_pong_offset,
            FADE_SAMPLES,
        );

        while num != 0 {
            if fwd > num {
                fwd = num;
            }
            if fwd != 0 {
                let mut gain = 1.0f32;

                for x in 0..fwd {
                    gain -= gain / (SAMPLE_RATE as f32 / 8.0);
                    self.samples[producer + x] =
                        self.ping_pong_data[(self.ping_pong_offset + x) % FADE_SAMPLES] * gain;
                }

                self.ping_pong_offset = (self.ping_pong_offset + fwd) % FADE_SAMPLES;

                for x in 0..FADE_SAMPLES {
                    self.ping_pong_data[x] *= gain;
                }

                self.last_sample = self.samples[producer + fwd - 1];
                self.fade_in = FADE_SAMPLES as u16;
                num -= fwd;
                self.total += fwd;
                producer += fwd;
            }
            if producer == MAX_SAMPLES {
                producer = 0;
                fwd = MAX_SAMPLES;
            }
        }
    }

    /// Read `dst.len()` samples. Must be called periodically; underflow
    /// is bridged with synthesized silence and a pending resize runs
    /// once the buffer is at least mid-window full.
    pub fn rem_samples(&mut self, dst: &mut [f32]) {
        let mut num = dst.len();
        self.do_water(num);

        if self.adjust_pending {
            let missing = self.water_ref();
            let middle = (self.high_water as usize + self.low_water as usize) / 2;

            // only adjust when the buffer is above middle full
            if self.total >= middle {
                self.do_adjust_buffer(missing);
                self.adjust_pending = false;
            }
        }

        let mut out = 0;
        while num != 0 {
            if self.total == 0 {
                self.add_silence(FADE_SAMPLES);
            }
            let mut fwd = MAX_SAMPLES - self.consumer;
            if fwd > num {
                fwd = num;
            }
            if fwd > self.total {
                fwd = self.total;
            }
            dst[out..out + fwd]
                .copy_from_slice(&self.samples[self.consumer..self.consumer + fwd]);
            out += fwd;
            num -= fwd;
            self.consumer += fwd;
            self.total -= fwd;
            if self.consumer == MAX_SAMPLES {
                self.consumer = 0;
            }
        }
    }

    /// Resize the content by `missing` samples (positive shrinks) using
    /// averaging plus linear interpolation, preserving the final sample.
    fn do_adjust_buffer(&mut self, missing: i32) {
        if missing == 0 || self.total == 0 {
            self.reset_water();
            return;
        }

        let to_signed = self.total as i64 - missing as i64;
        if to_signed < 2 || to_signed > MAX_SAMPLES as i64 {
            self.reset_water();
            return;
        }
        let mut to = to_signed as usize;

        // unroll the ring into a contiguous scratch buffer
        let mut scratch = [0.0f32; MAX_SAMPLES];
        for (x, slot) in scratch.iter_mut().enumerate().take(self.total) {
            *slot = self.samples[(self.consumer + x) % MAX_SAMPLES];
        }

        self.consumer = 0;

        to -= 1;
        let total = self.total - 1;

        // keep the last sample exactly
        self.samples[to] = scratch[total];

        let mut x = 0usize;
        while x < to {
            let src_start = (total * x) / to;
            let mut dst_next = x + 1;
            let mut src_end;

            loop {
                src_end = (total * dst_next) / to;
                if dst_next == to {
                    break;
                }
                if src_end != src_start {
                    break;
                }
                dst_next += 1;
            }

            let mut start = 0.0f32;
            for &v in &scratch[src_start..src_end] {
                start += v;
            }
            if start != 0.0 {
                start /= (src_end - src_start) as f32;
            }

            let delta = (scratch[src_end] - start) / (dst_next - x) as f32;

            while x < dst_next {
                self.samples[x] = start;
                start += delta;
                x += 1;
            }
        }

        self.total = to + 1;
        self.reset_water();
    }

    fn reset_water(&mut self) {
        self.low_water = self.target_water;
        self.high_water = self.target_water;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_stay_in_bounds_for_any_sequence() {
        let mut buffer = AudioBuffer::new();
        let chunk = [0.1f32; 97];
        let mut out = [0.0f32; 61];

        for i in 0..2000 {
            if i % 3 != 0 {
                buffer.add_samples(&chunk);
            }
            buffer.rem_samples(&mut out);
            assert!(buffer.total() <= MAX_SAMPLES);
        }
    }

    #[test]
    fn overflow_drops_the_tail() {
        let mut buffer = AudioBuffer::new();
        let big = [0.5f32; MAX_SAMPLES + 500];
        buffer.add_samples(&big);
        assert_eq!(buffer.total(), MAX_SAMPLES);
    }

    #[test]
    fn read_from_empty_synthesizes_and_returns_full_count() {
        let mut buffer = AudioBuffer::new();
        let mut out = [7.0f32; 96];
        buffer.rem_samples(&mut out);
        // fresh buffer history is silent, so the fill is silent too
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn underflow_then_refill_fades_in() {
        let mut buffer = AudioBuffer::new();
        let mut out = [0.0f32; 96];
        buffer.rem_samples(&mut out);

        // 440 Hz sine at 48 kHz
        let sine: Vec<f32> = (0..96)
            .map(|i| (std::f32::consts::TAU * 440.0 * i as f32 / 48000.0).sin())
            .collect();
        buffer.add_samples(&sine);
        assert_eq!(buffer.fade_in, 0);

        let mut got = [0.0f32; 96];
        buffer.rem_samples(&mut got);

        // first 48 samples crossfade from silence, the rest are verbatim
        assert!(got[0].abs() < sine[0].abs() + 1e-6);
        for x in 48..96 {
            assert!((got[x] - sine[x]).abs() < 1e-6);
        }

        // the ping-pong window now holds the last 48 input samples
        let mut window: Vec<f32> = buffer.ping_pong_data.to_vec();
        let mut tail: Vec<f32> = sine[48..].to_vec();
        window.sort_by(|a, b| a.partial_cmp(b).unwrap());
        tail.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (w, t) in window.iter().zip(tail.iter()) {
            assert!((w - t).abs() < 1e-6);
        }
    }

    #[test]
    fn shrink_preserves_endpoints() {
        let mut buffer = AudioBuffer::new();
        let ramp: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        buffer.add_samples(&ramp);

        buffer.do_adjust_buffer(48);
        assert_eq!(buffer.total(), 480 - 48);

        let mut out = vec![0.0f32; 480 - 48];
        buffer.rem_samples(&mut out);
        let last = out[480 - 48 - 1];
        assert!((last - ramp[479]).abs() < 1e-6);
        // a shrunk ramp is still monotone
        for pair in out.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-6);
        }
    }

    #[test]
    fn grow_interpolates_between_samples() {
        let mut buffer = AudioBuffer::new();
        let ramp: Vec<f32> = (0..240).map(|i| i as f32 / 240.0).collect();
        buffer.add_samples(&ramp);

        buffer.do_adjust_buffer(-120);
        assert_eq!(buffer.total(), 360);

        let mut out = vec![0.0f32; 360];
        buffer.rem_samples(&mut out);
        assert!((out[359] - ramp[239]).abs() < 1e-6);
        for pair in out.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-6);
        }
    }

    #[test]
    fn water_classes_follow_fill_level() {
        let mut buffer = AudioBuffer::new();
        buffer.set_water_target(8);

        // run the buffer near empty
        let mut out = [0.0f32; 48];
        for _ in 0..4 {
            buffer.rem_samples(&mut out);
        }
        assert_eq!(buffer.low_water_class(), 0);

        // now run it full
        buffer.clear();
        let fill = [0.0f32; MAX_SAMPLES / 2];
        buffer.add_samples(&fill);
        for _ in 0..4 {
            buffer.rem_samples(&mut out);
            buffer.add_samples(&out);
        }
        assert_eq!(buffer.low_water_class(), 2);
    }

    #[test]
    fn water_target_is_clamped() {
        let mut buffer = AudioBuffer::new();
        assert_eq!(buffer.set_water_target(1), 4);
        assert_eq!(buffer.set_water_target(1000), (MAX_SAMPLES / 2 / DEF_SAMPLES) as i32);
        assert_eq!(buffer.set_water_target(8), 8);
    }
}
