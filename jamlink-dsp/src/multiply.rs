//! Karatsuba-style overlap multiply.
//!
//! Computes the linear convolution of two equal-length vectors into an
//! accumulating output of twice the length. Power-of-two sizes only: the
//! recursion halves the problem with three sub-multiplies and in-place
//! butterfly steps, falling back to a comba loop below 32 taps. Used by
//! the equalizer as its time-domain convolution engine.

/// Recursion cut-off exponent; strides below `2^5` use the comba leaf.
const LOG2_COMBA: usize = 5;

#[derive(Clone, Copy, Default)]
struct X3Input {
    a: f32,
    b: f32,
}

fn x3_sub(input: &mut [X3Input], low: &mut [f32], high: &mut [f32], toggle: bool) {
    let stride = input.len();

    if stride >= (1usize << LOG2_COMBA) {
        let strideh = stride >> 1;

        if toggle {
            // inverse step
            for x in 0..strideh {
                let a = low[x];
                let b = low[x + strideh];
                let c = high[x];
                let d = high[x + strideh];

                low[x + strideh] = a + b;
                high[x] = a + b + c + d;
            }

            {
                let (in_lo, _) = input.split_at_mut(strideh);
                let (lo0, lo1) = low.split_at_mut(strideh);
                x3_sub(in_lo, lo0, lo1, true);
            }

            for x in 0..strideh {
                low[x + strideh] = -low[x + strideh];
            }

            {
                let (_, in_hi) = input.split_at_mut(strideh);
                let (_, lo1) = low.split_at_mut(strideh);
                let (_, hi1) = high.split_at_mut(strideh);
                x3_sub(in_hi, lo1, hi1, true);
            }

            // forward step
            for x in 0..strideh {
                let a = low[x];
                let b = low[x + strideh];
                let c = high[x];
                let d = high[x + strideh];

                low[x + strideh] = -a - b;
                high[x] = c + b - d;

                input[x + strideh].a += input[x].a;
                input[x + strideh].b += input[x].b;
            }

            {
                let (_, in_hi) = input.split_at_mut(strideh);
                let (_, lo1) = low.split_at_mut(strideh);
                let (hi0, _) = high.split_at_mut(strideh);
                x3_sub(in_hi, lo1, hi0, false);
            }
        } else {
            {
                let (_, in_hi) = input.split_at_mut(strideh);
                let (_, lo1) = low.split_at_mut(strideh);
                let (hi0, _) = high.split_at_mut(strideh);
                x3_sub(in_hi, lo1, hi0, true);
            }

            // inverse step
            for x in 0..strideh {
                let a = low[x];
                let b = low[x + strideh];
                let c = high[x];
                let d = high[x + strideh];

                low[x + strideh] = -a - b;
                high[x] = a + b + c + d;

                input[x + strideh].a -= input[x].a;
                input[x + strideh].b -= input[x].b;
            }

            {
                let (_, in_hi) = input.split_at_mut(strideh);
                let (_, lo1) = low.split_at_mut(strideh);
                let (_, hi1) = high.split_at_mut(strideh);
                x3_sub(in_hi, lo1, hi1, false);
            }

            for x in 0..strideh {
                low[x + strideh] = -low[x + strideh];
            }

            {
                let (in_lo, _) = input.split_at_mut(strideh);
                let (lo0, lo1) = low.split_at_mut(strideh);
                x3_sub(in_lo, lo0, lo1, false);
            }

            // forward step
            for x in 0..strideh {
                let a = low[x];
                let b = low[x + strideh];
                let c = high[x];
                let d = high[x + strideh];

                low[x + strideh] = b - a;
                high[x] = c - b - d;
            }
        }
    } else {
        // comba leaf
        for x in 0..stride {
            let value = input[x].a;

            for y in 0..(stride - x) {
                low[x + y] += input[y].b * value;
            }
            for y in (stride - x)..stride {
                high[x + y - stride] += input[y].b * value;
            }
        }
    }
}

/// Accumulate the convolution of `va` and `vb` into `out[0 .. 2 * n]`.
/// Sizes that are not a power of two are ignored.
pub fn x3_multiply(va: &[f32], vb: &[f32], out: &mut [f32]) {
    let max = va.len();

    if max == 0 || (max & (max - 1)) != 0 {
        return;
    }
    debug_assert_eq!(vb.len(), max);
    debug_assert!(out.len() >= 2 * max);

    let mut input: Vec<X3Input> = va
        .iter()
        .zip(vb.iter())
        .map(|(&a, &b)| X3Input { a, b })
        .collect();

    let (low, high) = out[..2 * max].split_at_mut(max);
    x3_sub(&mut input, low, high, true);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_convolution(a: &[f32], b: &[f32]) -> Vec<f32> {
        let n = a.len();
        let mut out = vec![0.0f64; 2 * n];
        for (i, &ai) in a.iter().enumerate() {
            for (j, &bj) in b.iter().enumerate() {
                out[i + j] += ai as f64 * bj as f64;
            }
        }
        out.into_iter().map(|v| v as f32).collect()
    }

    fn check_size(n: usize) {
        let a: Vec<f32> = (0..n).map(|i| ((i * 7919) % 23) as f32 / 23.0 - 0.5).collect();
        let b: Vec<f32> = (0..n).map(|i| ((i * 104729) % 17) as f32 / 17.0 - 0.5).collect();

        let mut out = vec![0.0f32; 2 * n];
        x3_multiply(&a, &b, &mut out);

        let want = naive_convolution(&a, &b);
        for (x, (got, expect)) in out.iter().zip(want.iter()).enumerate() {
            assert!(
                (got - expect).abs() < 1e-3 * (n as f32).sqrt(),
                "n={} index={} got={} want={}",
                n,
                x,
                got,
                expect
            );
        }
    }

    #[test]
    fn comba_leaf_matches_naive() {
        check_size(8);
        check_size(16);
    }

    #[test]
    fn recursive_sizes_match_naive() {
        check_size(32);
        check_size(64);
        check_size(128);
        check_size(512);
    }

    #[test]
    fn output_accumulates() {
        let a = [1.0f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let b = [0.5f32; 8];
        let mut out = [0.0f32; 16];
        x3_multiply(&a, &b, &mut out);
        x3_multiply(&a, &b, &mut out);
        assert!((out[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn non_power_of_two_is_ignored() {
        let a = [1.0f32; 12];
        let mut out = [0.0f32; 24];
        x3_multiply(&a, &a, &mut out);
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
