//! The video-level hasher: folds a stream of luminance frames into a
//! [`VideoFingerprint`], the ordered list of per-frame PDQ records that
//! represents one video for all downstream matching.

use image::GrayImage;
use itertools::Itertools;
use log::warn;
use thiserror::Error;

use crate::definitions::QUALITY_THRESHOLD;
use crate::pdq::{HashError, PdqHash, PdqHasher};

/// An error that prevented a video fingerprint from being created. Entries
/// that fail this way are recorded with the `failed` flag and never retried
/// within the same run.
#[derive(Error, Debug, Clone)]
pub enum HashCreationError {
    /// The container holds no decodable video stream.
    #[error("no decodable video stream: {0}")]
    Decode(String),

    /// The decoder reported an error before producing a single frame.
    #[error("corrupt video stream: {0}")]
    CorruptStream(String),

    /// The frame hasher rejected a frame.
    #[error(transparent)]
    Hash(#[from] HashError),
}

/// One sampled frame of a fingerprint: its PDQ hash, quality score and
/// position in the video.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct FrameRecord {
    pub hash: PdqHash,
    pub quality: u8,
    pub timestamp: f32,
}

impl FrameRecord {
    /// Whether this frame participates in similarity scoring and indexing.
    /// Low-quality frames (slates, fades, black screens) are retained in the
    /// fingerprint but excluded from matching.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.quality >= QUALITY_THRESHOLD
    }
}

/// The vPDQ fingerprint of one video: frame records ordered by timestamp,
/// with runs of identical consecutive hashes collapsed to their first frame.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct VideoFingerprint {
    records: Vec<FrameRecord>,
}

impl VideoFingerprint {
    /// Hash a sequence of `(timestamp_seconds, frame)` items into a
    /// fingerprint.
    ///
    /// The sequence is consumed once. An error on the first item means the
    /// stream never produced a usable frame and becomes
    /// [`HashCreationError::CorruptStream`]; an error after that is logged
    /// and truncates the fingerprint to the usable prefix.
    ///
    /// # Errors
    /// [`HashCreationError::CorruptStream`] if no frame could be decoded, or
    /// [`HashCreationError::Hash`] if a decoded frame has the wrong geometry.
    pub fn from_frames<I>(frames: I) -> Result<Self, HashCreationError>
    where
        I: IntoIterator<Item = Result<(f64, GrayImage), String>>,
    {
        let hasher = PdqHasher::new();
        Self::from_frames_with(&hasher, frames)
    }

    /// As [`from_frames`](Self::from_frames), reusing a prepared hasher.
    /// Workers hold one [`PdqHasher`] each so the DCT plan is not rebuilt per
    /// video.
    pub fn from_frames_with<I>(hasher: &PdqHasher, frames: I) -> Result<Self, HashCreationError>
    where
        I: IntoIterator<Item = Result<(f64, GrayImage), String>>,
    {
        let mut records: Vec<FrameRecord> = Vec::new();

        for (index, item) in frames.into_iter().enumerate() {
            let (timestamp, frame) = match item {
                Ok(frame) => frame,
                Err(msg) if index == 0 => return Err(HashCreationError::CorruptStream(msg)),
                Err(msg) => {
                    warn!("decoder error mid-stream, keeping {} frames: {msg}", records.len());
                    break;
                }
            };

            let (hash, quality) = hasher.hash_frame(&frame)?;

            //adjacent-duplicate collapse: a static shot contributes one record
            if records.last().map(|prev| prev.hash) == Some(hash) {
                continue;
            }

            records.push(FrameRecord {
                hash,
                quality,
                timestamp: timestamp as f32,
            });
        }

        if records.is_empty() {
            return Err(HashCreationError::CorruptStream(
                "stream produced no frames".to_string(),
            ));
        }

        Ok(Self { records })
    }

    /// Build a fingerprint from already-hashed records, collapsing adjacent
    /// duplicates. Used when reading the store back from disk, and by tests.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = FrameRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .dedup_by(|a, b| a.hash == b.hash)
                .collect(),
        }
    }

    /// All frame records, in timestamp order.
    pub fn records(&self) -> impl Iterator<Item = &FrameRecord> {
        self.records.iter()
    }

    /// The records that participate in matching (quality at or above the
    /// threshold).
    pub fn retained(&self) -> impl Iterator<Item = &FrameRecord> {
        self.records.iter().filter(|r| r.is_retained())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}
