#![allow(clippy::let_and_return)]
#![allow(clippy::len_without_is_empty)]
#![warn(clippy::cast_lossless)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::todo)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::panic)]
#![allow(clippy::doc_markdown)]

//! # Overview
//! `vid_dedup_lib` finds likely-duplicate videos in a media library managed by a
//! host service (e.g. Hydrus), and reports each candidate pair back to that
//! service for human adjudication. It never touches the media bytes themselves.
//!
//! The pipeline has three phases:
//! * **Hash**: each video is decoded into one luminance frame per second of
//!   video time, and every frame is reduced to a 256-bit [PDQ](https://github.com/facebook/ThreatExchange)
//!   perceptual hash plus a quality score. The ordered per-frame records form a
//!   [`VideoFingerprint`] (the "vPDQ" of a video), which is cached in a durable
//!   [`HashStore`] so restarts never redo work.
//! * **Index**: all frame hashes across all fingerprints are loaded into a
//!   [`SimilarityIndex`], a BK-tree under Hamming distance, which answers
//!   radius queries in sub-linear time on realistic libraries.
//! * **Search**: for every not-yet-searched fingerprint, candidate videos are
//!   discovered through the index and scored with the symmetric vPDQ
//!   set-similarity metric. Pairs above the threshold are dispatched to the
//!   host as potential duplicates.
//!
//! The host service is reached only through the [`HostClient`] and
//! [`PairReporter`] traits; likewise video decoding enters through the
//! [`FingerprintBuilder`] trait. This keeps the core free of I/O concerns and
//! lets the whole pipeline run against in-memory stubs in tests.
//!
//! # Interruption
//! Every phase is restartable. Fingerprints are committed atomically per
//! entry, the store file is replaced by rename only, and search progress is
//! tracked with a per-entry `search_complete` flag. Cancelling mid-run loses
//! at most the work of the videos currently in flight.

mod definitions;
mod host;
mod index;
mod pdq;
mod pipeline;
mod search;
mod similarity;
mod store;
mod vpdq;

pub use definitions::{
    search_radius, DEFAULT_MAX_HOST_RETRIES, DEFAULT_SIMILARITY_THRESHOLD, FRAME_SIDE,
    PDQ_HASH_BITS, PDQ_HASH_BYTES, QUALITY_THRESHOLD,
};
pub use host::{HostClient, HostError, MediaId, PairReporter};
pub use index::{BackPointer, IndexError, SimilarityIndex};
pub use pdq::{HashError, PdqHash, PdqHasher};
pub use pipeline::{
    CancelToken, FingerprintBuilder, Phase, Pipeline, PipelineCfg, PipelineError, PipelineReport,
    ProgressSink,
};
pub use search::{PairEvent, SearchAbort, SearchCoordinator, SearchStats};
pub use similarity::{set_similarity, SetSimilarity, SimilarityCfg};
pub use store::{EntryFlags, HashStore, StoreEntry, StoreError};
pub use vpdq::{FrameRecord, HashCreationError, VideoFingerprint};
