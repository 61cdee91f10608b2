use std::fmt;
use std::sync::Arc;

use image::GrayImage;
use rustdct::{DctPlanner, TransformType2And3};
use thiserror::Error;

use crate::definitions::{FRAME_SIDE, PDQ_BUFFER_DIM, PDQ_HASH_BYTES};

mod dct;
mod jarosz;

/// An error that prevented a frame hash from being created.
///
/// The hasher never fails for content reasons; only a frame of the wrong
/// geometry is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("input frame must be {FRAME_SIDE}x{FRAME_SIDE}, got {0}x{1}")]
    WrongDimensions(u32, u32),
}

/// A 256-bit PDQ perceptual hash of a single frame.
///
/// Perceptually similar frames produce hashes at a small Hamming distance.
/// The bit order is fixed: bit `i` of byte `j` holds the sign of DCT
/// coefficient `(i + 8*j) / 16, (i + 8*j) % 16` relative to the block median,
/// so distances are comparable across every producer of these hashes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PdqHash([u8; PDQ_HASH_BYTES]);

impl PdqHash {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PDQ_HASH_BYTES]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PDQ_HASH_BYTES] {
        &self.0
    }

    /// The number of differing bits between this hash and another.
    #[must_use]
    pub fn hamming_distance(&self, other: &Self) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl fmt::Debug for PdqHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PdqHash(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for PdqHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Hashes 512x512 luminance frames into ([`PdqHash`], quality) pairs.
///
/// The DCT plan is built once per hasher; clone it into each worker rather
/// than constructing a new one per frame.
#[derive(Clone)]
pub struct PdqHasher {
    dct: Arc<dyn TransformType2And3<f32>>,
}

impl Default for PdqHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PdqHasher {
    #[must_use]
    pub fn new() -> Self {
        let mut planner = DctPlanner::new();
        Self {
            dct: planner.plan_dct2(PDQ_BUFFER_DIM),
        }
    }

    /// Hash one frame, returning the hash and its quality score in `[0, 100]`.
    ///
    /// # Errors
    /// Returns [`HashError::WrongDimensions`] unless the frame is 512x512.
    pub fn hash_frame(&self, frame: &GrayImage) -> Result<(PdqHash, u8), HashError> {
        let (width, height) = frame.dimensions();
        if width != FRAME_SIDE || height != FRAME_SIDE {
            return Err(HashError::WrongDimensions(width, height));
        }

        let side = FRAME_SIDE as usize;
        let mut buf1: Vec<f32> = frame.as_raw().iter().map(|&p| f32::from(p)).collect();
        let mut buf2 = vec![0f32; side * side];

        let window = jarosz::window_size(side);
        jarosz::jarosz_filter(&mut buf1, &mut buf2, side, window);

        let mut decimated = [0f32; PDQ_BUFFER_DIM * PDQ_BUFFER_DIM];
        jarosz::decimate(&buf1, side, &mut decimated);

        let quality = jarosz::gradient_quality(&decimated);

        let coefficients = dct::dct_16x16(self.dct.as_ref(), &decimated);
        let hash = dct::pack_bits(&coefficients);

        Ok((hash, quality))
    }
}
