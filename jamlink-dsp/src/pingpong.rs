//! Underflow fill synthesis.
//!
//! When a ring buffer runs dry the gap is filled with a looping waveform
//! derived from the last written window rather than hard silence: the
//! dominant half-period is estimated from mean crossings, the window is
//! sorted towards the last sample's direction of travel, and a periodic
//! up-down sweep is threaded through the sorted values starting at the
//! last sample. The result is a click-free hum that fades out.

/// Build a `num`-sample loop into `dst` from the circular source window
/// `src`, where `last` is the offset one past the most recent sample.
pub fn create_ping_pong_buffer(src: &[f32], dst: &mut [f32], last: usize, num: usize) {
    if num < 2 {
        if num == 1 {
            dst[0] = src[0];
        }
        return;
    }

    let mut temp: Vec<f32> = src[..num].to_vec();
    let average: f32 = temp.iter().sum::<f32>() / num as f32;

    // estimate dominant frequency from mean crossings
    let mut freq: usize = 0;
    for i in 0..num - 1 {
        if temp[i] > average && temp[i + 1] < average {
            freq += 1;
        }
        if temp[i] < average && temp[i + 1] > average {
            freq += 1;
        }
    }

    let last_sample = src[(num - 1 + last) % num];

    if src[(num - 2 + last) % num] > last_sample {
        // going down
        temp.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    } else {
        // going up
        temp.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    }

    // make sure frequency is even
    freq -= freq % 2;

    // find the last sample and thread the loop from there
    for i in 0..num {
        if i != num - 1 && temp[i] != last_sample {
            continue;
        }
        let mut k = 0;
        let mut j = i + freq;

        while k != num {
            while j < num && k != num {
                dst[k] = temp[j];
                k += 1;
                j += freq;
            }
            j -= num;
            while j < num && k != num {
                dst[k] = temp[num - 1 - j];
                k += 1;
                j += freq;
            }
            j -= num;
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_windows_are_copied() {
        let mut dst = [9.0f32; 1];
        create_ping_pong_buffer(&[0.25], &mut dst, 0, 1);
        assert_eq!(dst[0], 0.25);

        let mut none: [f32; 0] = [];
        create_ping_pong_buffer(&[], &mut none, 0, 0);
    }

    #[test]
    fn output_values_come_from_the_input_window() {
        let src: Vec<f32> = (0..48)
            .map(|i| (i as f32 * std::f32::consts::TAU / 16.0).sin())
            .collect();
        let mut dst = [0.0f32; 48];
        create_ping_pong_buffer(&src, &mut dst, 0, 48);

        for v in dst.iter() {
            assert!(
                src.iter().any(|s| (s - v).abs() < 1e-6),
                "sample {} not drawn from source window",
                v
            );
        }
    }

    #[test]
    fn silence_stays_silent() {
        let src = [0.0f32; 48];
        let mut dst = [1.0f32; 48];
        create_ping_pong_buffer(&src, &mut dst, 17, 48);
        assert!(dst.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn loop_is_bounded_by_the_window_peak() {
        let src: Vec<f32> = (0..48).map(|i| ((i % 7) as f32 - 3.0) / 4.0).collect();
        let peak = src.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        let mut dst = [0.0f32; 48];
        create_ping_pong_buffer(&src, &mut dst, 5, 48);
        for &v in dst.iter() {
            assert!(v.abs() <= peak + 1e-6);
        }
    }
}
