/// Side length of the luminance plane fed to the frame hasher. The extractor
/// scales every decoded frame to this canonical size; the hasher rejects
/// anything else.
pub const FRAME_SIDE: u32 = 512;

/// Width of a PDQ hash in bits.
pub const PDQ_HASH_BITS: u32 = 256;

/// Width of a PDQ hash in bytes.
pub const PDQ_HASH_BYTES: usize = (PDQ_HASH_BITS / 8) as usize;

//Side length of the decimated buffer the DCT runs over. The 16x16 corner of
//its spectrum becomes the hash.
pub(crate) const PDQ_BUFFER_DIM: usize = 64;
pub(crate) const PDQ_DCT_DIM: usize = 16;

/// Frames whose PDQ quality score falls below this value are kept in the
/// fingerprint but excluded from similarity scoring and from the index.
/// Quality measures gradient energy; a black slate or a hard fade scores near
/// zero and would otherwise match everything.
pub const QUALITY_THRESHOLD: u8 = 50;

/// The default similarity threshold, in percent. A pair of videos is reported
/// when both sides match at least this fraction of their own frames. 100
/// requires near-identical fingerprints; values below ~60 produce large
/// numbers of false positives.
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 75;

/// How many times a transient host failure (timeout, 5xx) is attempted before
/// the file is skipped for this run.
pub const DEFAULT_MAX_HOST_RETRIES: u32 = 3;

/// The per-frame Hamming radius for a similarity threshold in percent.
///
/// Two frame hashes count as matching when their distance does not exceed the
/// radius. At the default threshold of 75 this permits 32 differing bits.
#[must_use]
pub fn search_radius(similarity_threshold: u32) -> u32 {
    let tolerated = (100 - similarity_threshold.min(100)) * PDQ_HASH_BITS;
    ((tolerated as f64) / 100.0 / 2.0).round() as u32
}

#[cfg(test)]
mod test {
    use super::search_radius;

    #[test]
    fn radius_at_default_threshold_is_32() {
        assert_eq!(search_radius(75), 32);
    }

    #[test]
    fn radius_is_zero_at_full_similarity() {
        assert_eq!(search_radius(100), 0);
    }

    #[test]
    fn radius_is_half_the_hash_at_zero_similarity() {
        assert_eq!(search_radius(0), 128);
    }
}
