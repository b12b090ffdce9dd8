//! FFT-designed FIR equalizer.
//!
//! Filters are described as text: a `filtersize <ms>ms` header, an
//! optional `normalize` line, then `<frequency> <amplitude>` pairs
//! defining a piecewise-linear magnitude response. The response is
//! loaded onto the positive-frequency half of a real spectrum, brought
//! to the time domain by an inverse FFT, shaped by a raised-cosine
//! window and re-centered, giving a linear-phase FIR of power-of-two
//! length up to 512 taps. Filter length requested beyond the rounded
//! block becomes predelay. At runtime blocks convolve through the X3
//! multiply with overlapping output tails.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use thiserror::Error;

use jamlink_proto::SAMPLE_RATE;

use crate::multiply::x3_multiply;

/// Largest FIR block size.
const MAX_FILTER_SIZE: usize = 512;

lazy_static! {
    // One planner for the process: rustfft caches plans per size, so
    // reconfiguring equalizers reuses them across peers.
    static ref FFT_PLANNER: Mutex<FftPlanner<f64>> = Mutex::new(FftPlanner::new());
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EqError {
    #[error("filter specification must start with 'filtersize <ms>ms'")]
    MissingFilterSize,
    #[error("malformed frequency/amplitude pair")]
    BadFrequencyPair,
    #[error("frequencies must be non-decreasing")]
    FrequencyOrder,
}

/// Designs the FIR taps from the parsed magnitude response.
struct Designer {
    rate: f64,
    block_size: usize,
    do_normalize: bool,
    freq: Vec<f64>,
    time: Vec<f64>,
}

impl Designer {
    fn new(rate: f64, block_size: usize) -> Self {
        Self {
            rate,
            block_size,
            do_normalize: false,
            freq: vec![0.0; block_size],
            time: vec![0.0; block_size],
        }
    }

    fn window(&self, x: f64) -> f64 {
        (0.5 + 0.5 * (std::f64::consts::PI * x / (self.block_size as f64 / 2.0)).cos())
            / self.block_size as f64
    }

    fn load_freq_amps(&mut self, body: &str) -> Result<(), EqError> {
        let mut body = body;
        if body.get(..4).is_some_and(|s| s.eq_ignore_ascii_case("norm")) {
            body = match body.find('\n') {
                Some(pos) => &body[pos + 1..],
                None => "",
            };
            self.do_normalize = true;
        }

        let mut tokens = body.split_whitespace();
        let mut prev_f = 0.0f64;
        let mut prev_amp = 1.0f64;
        let mut next_f = 0.0f64;
        let mut next_amp = 1.0f64;
        let mut exhausted = false;

        for i in 0..=(self.block_size / 2) {
            let f = (i as f64 * self.rate) / self.block_size as f64;

            while f >= next_f {
                prev_f = next_f;
                prev_amp = next_amp;

                if exhausted {
                    next_f = self.rate;
                    next_amp = prev_amp;
                } else {
                    match (tokens.next(), tokens.next()) {
                        (None, _) => {
                            exhausted = true;
                            next_f = self.rate;
                            next_amp = prev_amp;
                        }
                        (Some(fs), Some(amps)) => {
                            next_f = fs.parse().map_err(|_| EqError::BadFrequencyPair)?;
                            next_amp = amps.parse().map_err(|_| EqError::BadFrequencyPair)?;
                            if next_f < prev_f {
                                return Err(EqError::FrequencyOrder);
                            }
                        }
                        (Some(_), None) => return Err(EqError::BadFrequencyPair),
                    }
                }
                if prev_f == 0.0 {
                    prev_amp = next_amp;
                }
            }
            self.freq[i] = ((f - prev_f) / (next_f - prev_f)) * (next_amp - prev_amp) + prev_amp;
        }
        Ok(())
    }

    fn load(&mut self, body: &str) -> Result<(), EqError> {
        self.freq.iter_mut().for_each(|v| *v = 0.0);
        self.load_freq_amps(body)?;

        // inverse real FFT of the symmetric magnitude response
        let n = self.block_size;
        let mut spectrum = vec![Complex::new(0.0f64, 0.0); n];
        for i in 0..=(n / 2) {
            spectrum[i] = Complex::new(self.freq[i], 0.0);
            if i != 0 && i != n / 2 {
                spectrum[n - i] = Complex::new(self.freq[i], 0.0);
            }
        }
        FFT_PLANNER.lock().plan_fft_inverse(n).process(&mut spectrum);
        for i in 0..n {
            self.time[i] = spectrum[i].re;
        }

        // multiply by symmetric window and shift to the block center
        for i in 0..(n / 2) {
            self.time[n / 2 + i] = self.time[i] * self.window(i as f64);
        }
        for i in (1..(n / 2)).rev() {
            self.time[i] = self.time[n - i];
        }
        self.time[0] = 0.0;

        if self.do_normalize {
            let sum: f64 = self.time.iter().map(|v| v.abs()).sum();
            if sum != 0.0 {
                self.time.iter_mut().for_each(|v| *v /= sum);
            }
        }
        Ok(())
    }
}

/// Block-convolving FIR equalizer with predelay.
pub struct Equalizer {
    filter_size: usize,
    filter_predelay: usize,
    filter_offset: usize,
    filter_data: Vec<f32>,
    filter_in: [Vec<f32>; 2],
    filter_out: [Vec<f32>; 2],
}

impl Default for Equalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Equalizer {
    pub fn new() -> Self {
        Self {
            filter_size: 0,
            filter_predelay: 0,
            filter_offset: 0,
            filter_data: Vec::new(),
            filter_in: [Vec::new(), Vec::new()],
            filter_out: [Vec::new(), Vec::new()],
        }
    }

    /// True when a filter is loaded; a disabled equalizer passes audio
    /// through untouched.
    pub fn is_active(&self) -> bool {
        self.filter_size != 0
    }

    pub fn cleanup(&mut self) {
        *self = Self::new();
    }

    /// Load a filter from its text specification. An in-range request
    /// that rounds to a zero-length filter disables the equalizer.
    pub fn init(&mut self, spec: &str) -> Result<(), EqError> {
        let spec = spec.trim_start();
        if !spec
            .get(..11)
            .is_some_and(|s| s.eq_ignore_ascii_case("filtersize "))
        {
            return Err(EqError::MissingFilterSize);
        }
        let rest = &spec[11..];
        let line_end = rest.find('\n').unwrap_or(rest.len());
        let head = rest[..line_end].trim();
        let ms_text = head.strip_suffix("ms").unwrap_or(head).trim();
        let ms: f64 = ms_text.parse().map_err(|_| EqError::MissingFilterSize)?;

        let requested = ((SAMPLE_RATE as f64 * ms) / 1000.0) as i64;
        let mut size = requested.clamp(0, MAX_FILTER_SIZE as i64) as usize;
        let mut osize = requested.clamp(0, SAMPLE_RATE as i64) as usize;

        // power of two, rounding down
        while (size & size.wrapping_neg()) != size {
            size -= size & size.wrapping_neg();
        }

        // anything beyond the block becomes predelay
        osize = osize.saturating_sub(size);

        if size == 0 {
            self.cleanup();
            return Ok(());
        }

        let body = &rest[line_end..];
        let body = body.strip_prefix('\n').unwrap_or(body);

        let mut designer = Designer::new(SAMPLE_RATE as f64, size);
        designer.load(body)?;

        if self.filter_size != size || self.filter_predelay != osize {
            self.filter_size = size;
            self.filter_predelay = osize;
            self.filter_offset = 0;
            self.filter_data = vec![0.0; size];
            self.filter_in = [vec![0.0; size], vec![0.0; size]];
            self.filter_out = [vec![0.0; 2 * size + osize], vec![0.0; 2 * size + osize]];
        }

        for (dst, &src) in self.filter_data.iter_mut().zip(designer.time.iter()) {
            *dst = src as f32;
        }
        Ok(())
    }

    pub fn process_stereo(&mut self, left: &mut [f32], right: &mut [f32]) {
        if !self.is_active() || left.is_empty() {
            return;
        }
        debug_assert_eq!(left.len(), right.len());

        let mut pos = 0;
        let samples = left.len();
        loop {
            let mut delta = self.filter_size - self.filter_offset;
            if delta > samples - pos {
                delta = samples - pos;
            }

            for y in 0..delta {
                let idx = y + self.filter_offset;
                self.filter_in[0][idx] = left[pos + y];
                left[pos + y] = self.filter_out[0][idx];

                self.filter_in[1][idx] = right[pos + y];
                right[pos + y] = self.filter_out[1][idx];
            }

            self.filter_offset += delta;
            pos += delta;

            if self.filter_offset == self.filter_size {
                for x in 0..2 {
                    self.transform_channel(x);
                }
                self.filter_offset = 0;
            }

            if pos == samples {
                break;
            }
        }
    }

    pub fn process_mono(&mut self, left: &mut [f32]) {
        if !self.is_active() || left.is_empty() {
            return;
        }

        let mut pos = 0;
        let samples = left.len();
        loop {
            let mut delta = self.filter_size - self.filter_offset;
            if delta > samples - pos {
                delta = samples - pos;
            }

            for y in 0..delta {
                let idx = y + self.filter_offset;
                self.filter_in[0][idx] = left[pos + y];
                left[pos + y] = self.filter_out[0][idx];
            }

            self.filter_offset += delta;
            pos += delta;

            if self.filter_offset == self.filter_size {
                self.transform_channel(0);
                self.filter_offset = 0;
            }

            if pos == samples {
                break;
            }
        }
    }

    fn transform_channel(&mut self, channel: usize) {
        let size = self.filter_size;
        let predelay = self.filter_predelay;
        let out = &mut self.filter_out[channel];

        // shift the output tail down by one block
        for y in 0..(size + predelay) {
            out[y] = out[y + size];
            out[y + size] = 0.0;
        }

        x3_multiply(
            &self.filter_in[channel],
            &self.filter_data,
            &mut out[predelay..],
        );
    }
}
