//! The vPDQ set-similarity metric between two fingerprints.
//!
//! Each retained frame of one video is matched against the nearest retained
//! frame of the other; the fraction of matched frames is measured separately
//! on each side. Requiring *both* fractions to clear the threshold stops a
//! short clip from matching the feature film it was cut from, while two full
//! re-encodes of the same video still pass easily.

use crate::definitions::{search_radius, DEFAULT_SIMILARITY_THRESHOLD};
use crate::vpdq::{FrameRecord, VideoFingerprint};

/// Search tuning shared by the similarity metric and the coordinator.
#[derive(Clone, Copy, Debug)]
pub struct SimilarityCfg {
    /// Similarity threshold in percent, 0..=100.
    pub threshold: u32,
    /// Gate on the query-side fraction only, as older deduplicators did.
    /// Tolerances tuned against those versions carry over unchanged.
    pub one_sided: bool,
}

impl Default for SimilarityCfg {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            one_sided: false,
        }
    }
}

impl SimilarityCfg {
    /// The per-frame Hamming radius implied by the threshold.
    #[must_use]
    pub fn radius(&self) -> u32 {
        search_radius(self.threshold)
    }
}

/// The outcome of comparing two fingerprints: the fraction of each side's
/// retained frames that found a match within the radius on the other side.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct SetSimilarity {
    pub fraction_a: f64,
    pub fraction_b: f64,
}

impl SetSimilarity {
    /// Whether this comparison clears the configured gate.
    #[must_use]
    pub fn passes(&self, cfg: &SimilarityCfg) -> bool {
        let needed = f64::from(cfg.threshold) / 100.0;
        if cfg.one_sided {
            self.fraction_a >= needed
        } else {
            self.fraction_a >= needed && self.fraction_b >= needed
        }
    }

    /// The pair score in `[0, 1]` reported to the host.
    #[must_use]
    pub fn score(&self, cfg: &SimilarityCfg) -> f64 {
        if cfg.one_sided {
            self.fraction_a
        } else {
            (self.fraction_a + self.fraction_b) / 2.0
        }
    }
}

/// Compare two fingerprints at the given per-frame radius. Returns `None`
/// when either side has no retained frames, since a fraction over zero frames
/// is meaningless.
#[must_use]
pub fn set_similarity(
    a: &VideoFingerprint,
    b: &VideoFingerprint,
    radius: u32,
) -> Option<SetSimilarity> {
    fn matched(xs: &[&FrameRecord], ys: &[&FrameRecord], radius: u32) -> usize {
        xs.iter()
            .filter(|x| {
                ys.iter()
                    .any(|y| x.hash.hamming_distance(&y.hash) <= radius)
            })
            .count()
    }

    let retained_a: Vec<_> = a.retained().collect();
    let retained_b: Vec<_> = b.retained().collect();
    if retained_a.is_empty() || retained_b.is_empty() {
        return None;
    }

    Some(SetSimilarity {
        fraction_a: matched(&retained_a, &retained_b, radius) as f64 / retained_a.len() as f64,
        fraction_b: matched(&retained_b, &retained_a, radius) as f64 / retained_b.len() as f64,
    })
}
