//! The frequency-domain half of PDQ: a 2-D DCT-II over the 64x64 buffer, of
//! which the 16x16 block at spatial frequencies 1..=16 (the DC row and column
//! are skipped) is thresholded against its own median to yield 256 bits.
//!
//! rustdct's unnormalized DCT-II differs from the reference's orthogonal
//! transform only by a uniform positive scale across the retained block, so
//! the median comparison, and therefore every output bit, is unaffected.

use rustdct::TransformType2And3;

use crate::definitions::{PDQ_BUFFER_DIM, PDQ_DCT_DIM, PDQ_HASH_BYTES};

use super::PdqHash;

/// The 16x16 block of DCT coefficients at rows/columns 1..=16, row-major.
pub(super) fn dct_16x16(
    dct: &dyn TransformType2And3<f32>,
    buffer: &[f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM],
) -> [f32; PDQ_DCT_DIM * PDQ_DCT_DIM] {
    let dim = PDQ_BUFFER_DIM;

    //rustdct wants row-major contiguous rows, so transform rows, transpose,
    //transform rows again. The final orientation is transposed, which is
    //irrelevant to a block that is thresholded cell-by-cell against a median,
    //but we transpose back anyway so the bit order matches the reference.
    let mut working = buffer.to_vec();
    let mut scratch = vec![0f32; dim * dim];

    for row in working.chunks_exact_mut(dim) {
        dct.process_dct2(row);
    }
    transpose::transpose(&working, &mut scratch, dim, dim);
    for row in scratch.chunks_exact_mut(dim) {
        dct.process_dct2(row);
    }
    transpose::transpose(&scratch, &mut working, dim, dim);

    let mut block = [0f32; PDQ_DCT_DIM * PDQ_DCT_DIM];
    for i in 0..PDQ_DCT_DIM {
        for j in 0..PDQ_DCT_DIM {
            block[i * PDQ_DCT_DIM + j] = working[(i + 1) * dim + (j + 1)];
        }
    }
    block
}

/// Threshold each coefficient against the block median and pack the outcomes
/// into 32 bytes. Bit `i` of byte `j` corresponds to the row-major coefficient
/// `i + 8*j`.
pub(super) fn pack_bits(block: &[f32; PDQ_DCT_DIM * PDQ_DCT_DIM]) -> PdqHash {
    let median = median_of(block);

    let mut bytes = [0u8; PDQ_HASH_BYTES];
    for (k, &coefficient) in block.iter().enumerate() {
        if coefficient > median {
            bytes[k / 8] |= 1 << (k % 8);
        }
    }
    PdqHash::from_bytes(bytes)
}

fn median_of(block: &[f32; PDQ_DCT_DIM * PDQ_DCT_DIM]) -> f32 {
    let mut sorted = *block;
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    (sorted[mid - 1] + sorted[mid]) / 2.0
}

#[cfg(test)]
mod test {
    use rustdct::DctPlanner;

    use super::*;

    #[test]
    fn median_splits_the_block_evenly() {
        let mut block = [0f32; PDQ_DCT_DIM * PDQ_DCT_DIM];
        for (i, v) in block.iter_mut().enumerate() {
            *v = i as f32;
        }
        let hash = pack_bits(&block);
        let set_bits: u32 = hash.as_bytes().iter().map(|b| b.count_ones()).sum();
        assert_eq!(set_bits, 128);
    }

    #[test]
    fn bit_order_is_row_major_lsb_first() {
        //every cell sits on the median except flat index 17, which exceeds it
        let mut block = [-1f32; PDQ_DCT_DIM * PDQ_DCT_DIM];
        block[17] = 1.0;

        let hash = pack_bits(&block);
        let set_bits: u32 = hash.as_bytes().iter().map(|b| b.count_ones()).sum();
        assert_eq!(set_bits, 1);
        assert_eq!(hash.as_bytes()[17 / 8], 1 << (17 % 8));
    }

    #[test]
    fn dct_of_flat_buffer_has_no_ac_energy() {
        let mut planner = DctPlanner::new();
        let dct = planner.plan_dct2(PDQ_BUFFER_DIM);

        let buffer = [100f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM];
        let block = dct_16x16(dct.as_ref(), &buffer);
        for coefficient in &block {
            assert!(coefficient.abs() < 1e-2);
        }
    }

    #[test]
    fn dct_detects_lowest_retained_frequency() {
        let mut planner = DctPlanner::new();
        let dct = planner.plan_dct2(PDQ_BUFFER_DIM);

        //a separable cosine at the lowest retained frequency on both axes
        let mut buffer = [0f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM];
        for i in 0..PDQ_BUFFER_DIM {
            for j in 0..PDQ_BUFFER_DIM {
                let tx = std::f32::consts::PI * (j as f32 + 0.5) / PDQ_BUFFER_DIM as f32;
                let ty = std::f32::consts::PI * (i as f32 + 0.5) / PDQ_BUFFER_DIM as f32;
                buffer[i * PDQ_BUFFER_DIM + j] = tx.cos() * ty.cos() * 100.0;
            }
        }
        let block = dct_16x16(dct.as_ref(), &buffer);

        //energy concentrates at (1, 1) of the full spectrum, which is the
        //first cell of the retained block
        let target = block[0].abs();
        let elsewhere = block
            .iter()
            .enumerate()
            .filter(|&(k, _)| k != 0)
            .map(|(_, v)| v.abs())
            .fold(0f32, f32::max);
        assert!(target > 10.0 * elsewhere.max(1e-3));
    }
}
