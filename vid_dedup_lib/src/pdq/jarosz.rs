//! The image-domain half of PDQ: the Jarosz low-pass filter, decimation to
//! the 64x64 DCT buffer, and the gradient quality metric.
//!
//! Two passes of a box filter per axis approximate a tent filter. The window
//! footprint feeds directly into which bits of the final hash flip, so the
//! phase arithmetic below follows the published reference exactly.

use crate::definitions::PDQ_BUFFER_DIM;

/// Box window width for an `n`-pixel side: `max(2, round(n / 64))`, rounded
/// up to an even integer so the filter is symmetric.
pub(super) fn window_size(n: usize) -> usize {
    let w = ((n as f64) / 64.0).round() as usize;
    let w = w.max(2);
    if w % 2 == 1 {
        w + 1
    } else {
        w
    }
}

/// Two repetitions of (box along rows, box along columns) over a square
/// `dim`x`dim` image. `buf1` holds the input and, on return, the output;
/// `buf2` is scratch of the same size.
pub(super) fn jarosz_filter(buf1: &mut [f32], buf2: &mut [f32], dim: usize, window: usize) {
    for _ in 0..2 {
        box_along_rows(buf1, buf2, dim, window);
        box_along_cols(buf2, buf1, dim, window);
    }
}

fn box_along_rows(input: &[f32], output: &mut [f32], dim: usize, window: usize) {
    for row in 0..dim {
        box_1d(input, output, row * dim, dim, 1, window);
    }
}

fn box_along_cols(input: &[f32], output: &mut [f32], dim: usize, window: usize) {
    for col in 0..dim {
        box_1d(input, output, col, dim, dim, window);
    }
}

//Incremental sliding-window mean with clamped edges, in four phases:
//accumulate without writing, writes with a growing window, writes with the
//full window, writes with a shrinking window. Matches the reference
//element-for-element, including the (window + 2) / 2 half-window rounding.
fn box_1d(
    input: &[f32],
    output: &mut [f32],
    start: usize,
    vector_length: usize,
    stride: usize,
    full_window: usize,
) {
    let half_window = (full_window + 2) / 2;

    let phase_1_len = half_window - 1;
    let phase_2_len = full_window - half_window + 1;
    let phase_3_len = vector_length - full_window;
    let phase_4_len = half_window - 1;

    let mut li = start; // left edge of the read window
    let mut ri = start; // right edge of the read window
    let mut oi = start; // output index

    let mut sum = 0f32;
    let mut current_window = 0usize;

    for _ in 0..phase_1_len {
        sum += input[ri];
        current_window += 1;
        ri += stride;
    }

    for _ in 0..phase_2_len {
        sum += input[ri];
        current_window += 1;
        output[oi] = sum / current_window as f32;
        ri += stride;
        oi += stride;
    }

    for _ in 0..phase_3_len {
        sum += input[ri];
        sum -= input[li];
        output[oi] = sum / current_window as f32;
        ri += stride;
        li += stride;
        oi += stride;
    }

    for _ in 0..phase_4_len {
        sum -= input[li];
        current_window -= 1;
        output[oi] = sum / current_window as f32;
        li += stride;
        oi += stride;
    }
}

/// Decimate the filtered `in_dim`x`in_dim` plane to 64x64 by nearest-sample
/// selection at cell centers.
pub(super) fn decimate(
    input: &[f32],
    in_dim: usize,
    output: &mut [f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM],
) {
    for i in 0..PDQ_BUFFER_DIM {
        let ini = (((i as f64) + 0.5) * (in_dim as f64) / PDQ_BUFFER_DIM as f64) as usize;
        for j in 0..PDQ_BUFFER_DIM {
            let inj = (((j as f64) + 0.5) * (in_dim as f64) / PDQ_BUFFER_DIM as f64) as usize;
            output[i * PDQ_BUFFER_DIM + j] = input[ini * in_dim + inj];
        }
    }
}

/// Quality in `[0, 100]` from the gradient energy of the decimated buffer.
/// Uniform frames (slates, fades) score near zero.
pub(super) fn gradient_quality(buffer: &[f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM]) -> u8 {
    let dim = PDQ_BUFFER_DIM;
    let mut gradient_sum = 0f32;

    for i in 0..dim {
        for j in 0..dim - 1 {
            let u = buffer[i * dim + j];
            let v = buffer[i * dim + j + 1];
            gradient_sum += ((u - v) * 100.0 / 255.0).abs();
        }
    }

    for i in 0..dim - 1 {
        for j in 0..dim {
            let u = buffer[i * dim + j];
            let v = buffer[(i + 1) * dim + j];
            gradient_sum += ((u - v) * 100.0 / 255.0).abs();
        }
    }

    ((gradient_sum / 90.0) as u32).min(100) as u8
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn window_size_matches_reference_values() {
        assert_eq!(window_size(512), 8);
        assert_eq!(window_size(64), 2);
        assert_eq!(window_size(100), 2);
        //odd rounded result is bumped to even
        assert_eq!(window_size(192), 4);
        assert_eq!(window_size(160), 4);
    }

    #[test]
    fn box_filter_preserves_constant_signal() {
        let dim = 16;
        let mut buf1 = vec![42.0f32; dim * dim];
        let mut buf2 = vec![0f32; dim * dim];
        jarosz_filter(&mut buf1, &mut buf2, dim, 2);
        for v in &buf1 {
            assert!((v - 42.0).abs() < 1e-4);
        }
    }

    #[test]
    fn box_filter_smooths_an_impulse() {
        let dim = 16;
        let mut buf1 = vec![0f32; dim * dim];
        buf1[8 * dim + 8] = 255.0;
        let peak_before = 255.0;

        let mut buf2 = vec![0f32; dim * dim];
        jarosz_filter(&mut buf1, &mut buf2, dim, 4);

        let peak_after = buf1.iter().cloned().fold(0f32, f32::max);
        assert!(peak_after < peak_before / 4.0);

        //energy is spread, not destroyed
        let total: f32 = buf1.iter().sum();
        assert!(total > 100.0);
    }

    #[test]
    fn decimate_picks_cell_centers() {
        let dim = 128;
        let input: Vec<f32> = (0..dim * dim).map(|i| (i / dim) as f32).collect();
        let mut out = [0f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM];
        decimate(&input, dim, &mut out);
        //row i of the output samples input row (i + 0.5) * 2
        assert_eq!(out[0], 1.0);
        assert_eq!(out[63 * PDQ_BUFFER_DIM], 127.0);
    }

    #[test]
    fn quality_is_zero_for_flat_buffer() {
        let buffer = [128f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM];
        assert_eq!(gradient_quality(&buffer), 0);
    }

    #[test]
    fn quality_saturates_for_checkerboard() {
        let mut buffer = [0f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM];
        for i in 0..PDQ_BUFFER_DIM {
            for j in 0..PDQ_BUFFER_DIM {
                buffer[i * PDQ_BUFFER_DIM + j] = if (i + j) % 2 == 0 { 0.0 } else { 255.0 };
            }
        }
        assert_eq!(gradient_quality(&buffer), 100);
    }
}
