//! Receive-side jitter estimation.
//!
//! One histogram bin per tick offset: every received frame lands in bin
//! `(ticks - counter) mod 32`, so a perfectly paced stream keeps hitting
//! one bin and a jittery stream smears across several. When any bin
//! saturates the histogram is halved and the jitter figure recomputed as
//! the base-2 logarithm of the shortest rotated window covering all
//! non-trivial bins.

/// Histogram width in ticks (ms). Must be a power of two.
pub const MAX_JITTER: usize = 2 * 16;

#[derive(Clone)]
pub struct JitterStats {
    stats: [f32; MAX_JITTER],
    packet_recover: u64,
    packet_damage: u64,
    counter: u16,
    jitter_ticks: u16,
}

impl Default for JitterStats {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterStats {
    pub fn new() -> Self {
        Self {
            stats: [0.0; MAX_JITTER],
            packet_recover: 0,
            packet_damage: 0,
            counter: 0,
            jitter_ticks: 0,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Estimated jitter in milliseconds.
    pub fn jitter_in_ms(&self) -> u16 {
        self.jitter_ticks
    }

    /// Frames reconstructed through XOR recovery.
    pub fn packet_recover(&self) -> u64 {
        self.packet_recover
    }

    /// Frames replaced by synthesized silence.
    pub fn packet_damage(&self) -> u64 {
        self.packet_damage
    }

    /// Account one received frame at the given tick count. Assumes one
    /// frame per tick on a loss-free path.
    pub fn rx_packet(&mut self, ticks: u16) {
        let index = (ticks.wrapping_sub(self.counter) as usize) % MAX_JITTER;
        self.stats[index] += 1.0;
        self.counter = self.counter.wrapping_add(1);

        if self.stats[index] >= MAX_JITTER as f32 {
            let mut mask: u32 = 0;
            for (x, bin) in self.stats.iter_mut().enumerate() {
                *bin /= 2.0;
                if *bin >= 0.5 {
                    mask |= 1 << x;
                }
            }

            // smallest rotation of the occupancy mask
            let mut start = mask;
            for _ in 0..MAX_JITTER {
                if start > mask {
                    start = mask;
                }
                if mask & 1 != 0 {
                    mask >>= 1;
                    mask |= 1 << (MAX_JITTER - 1);
                } else {
                    mask >>= 1;
                }
            }

            self.jitter_ticks = 0;
            while start > 1 {
                self.jitter_ticks += 1;
                start /= 2;
            }
        }
    }

    pub fn rx_recover(&mut self) {
        self.packet_recover += 1;
    }

    pub fn rx_damage(&mut self) {
        self.packet_damage += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_stream_reports_zero_jitter() {
        let mut jitter = JitterStats::new();
        for tick in 0..4096u16 {
            jitter.rx_packet(tick);
        }
        assert_eq!(jitter.jitter_in_ms(), 0);
    }

    #[test]
    fn smeared_arrivals_report_nonzero_jitter() {
        let mut jitter = JitterStats::new();
        // arrivals alternately early and late by up to 8 ticks
        let mut tick: u16 = 0;
        for n in 0..8192u16 {
            jitter.rx_packet(tick.wrapping_add(n % 8));
            tick = tick.wrapping_add(1);
        }
        assert!(jitter.jitter_in_ms() >= 2);
    }

    #[test]
    fn recovery_and_damage_counters() {
        let mut jitter = JitterStats::new();
        jitter.rx_recover();
        jitter.rx_damage();
        jitter.rx_damage();
        assert_eq!(jitter.packet_recover(), 1);
        assert_eq!(jitter.packet_damage(), 2);
    }
}
