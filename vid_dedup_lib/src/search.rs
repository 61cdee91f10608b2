//! The search coordinator: walks every hashed-but-unsearched entry, discovers
//! candidate videos through the similarity index, scores them with the full
//! set-similarity metric, and dispatches qualifying pairs to the reporter.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::host::{HostError, MediaId, PairReporter};
use crate::index::SimilarityIndex;
use crate::pipeline::{retry_transient, CancelToken};
use crate::similarity::{set_similarity, SimilarityCfg};
use crate::store::{HashStore, StoreError};

/// A discovered potential-duplicate pair. The smaller media id always comes
/// first so the same pair never appears under two identities.
#[derive(Clone, PartialEq, Debug)]
pub struct PairEvent {
    pub a: MediaId,
    pub b: MediaId,
    pub score: f64,
}

impl PairEvent {
    fn new(x: MediaId, y: MediaId, score: f64) -> Self {
        if x <= y {
            Self { a: x, b: y, score }
        } else {
            Self { a: y, b: x, score }
        }
    }
}

/// Counters reported at the end of the search phase.
#[derive(Clone, Copy, Default, Debug)]
pub struct SearchStats {
    /// Entries whose outer-loop iteration ran to completion.
    pub searched: usize,
    /// Pairs dispatched to the reporter.
    pub pairs: usize,
    /// Whether the phase stopped early on cancellation.
    pub cancelled: bool,
}

/// Drives the pair search over one store/index pair.
pub struct SearchCoordinator<'a> {
    store: &'a HashStore,
    index: &'a SimilarityIndex,
    cfg: SimilarityCfg,
    max_retries: u32,
}

impl<'a> SearchCoordinator<'a> {
    #[must_use]
    pub fn new(
        store: &'a HashStore,
        index: &'a SimilarityIndex,
        cfg: SimilarityCfg,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            index,
            cfg,
            max_retries,
        }
    }

    /// Run the search to completion or cancellation, invoking `progress` after
    /// each finished outer iteration.
    ///
    /// An entry's `search_complete` flag is only written once its whole
    /// iteration (including reporting) has succeeded, so an interrupted run
    /// redoes at most one entry.
    ///
    /// # Errors
    /// A reporter failure that survives retries aborts the search with the
    /// host error so no pair is silently dropped; store write failures
    /// propagate as [`StoreError`].
    pub fn run(
        &self,
        reporter: &dyn PairReporter,
        cancel: &CancelToken,
        mut progress: impl FnMut(),
    ) -> Result<SearchStats, SearchAbort> {
        let radius = self.cfg.radius();
        let mut stats = SearchStats::default();

        //flags are snapshotted per outer iteration; entries hashed after this
        //list is taken are picked up on the next run via their own
        //search_complete flag
        let ids = self.store.ids();
        info!("searching {} store entries at radius {radius}", ids.len());

        for media_id in ids {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            let Some(entry) = self.store.get(&media_id) else {
                continue;
            };
            if !entry.flags.hashed || entry.flags.failed || entry.flags.search_complete {
                continue;
            }
            let Some(fingerprint) = entry.fingerprint.as_ref() else {
                continue;
            };

            //candidate discovery: union of radius queries over retained frames
            let mut candidates: HashSet<MediaId> = HashSet::new();
            for record in fingerprint.retained() {
                for pointer in self.index.radius_query(&record.hash, radius) {
                    if pointer.media_id != media_id
                        && !entry.searched_against.contains(&pointer.media_id)
                    {
                        candidates.insert(pointer.media_id.clone());
                    }
                }
            }

            let mut considered: Vec<MediaId> = Vec::with_capacity(candidates.len());
            for other_id in candidates {
                let Some(other) = self.store.get(&other_id) else {
                    continue;
                };
                if !other.flags.hashed || other.flags.failed {
                    continue;
                }
                let Some(other_fingerprint) = other.fingerprint.as_ref() else {
                    continue;
                };

                if let Some(similarity) = set_similarity(fingerprint, other_fingerprint, radius) {
                    if similarity.passes(&self.cfg) {
                        let pair = PairEvent::new(
                            media_id.clone(),
                            other_id.clone(),
                            similarity.score(&self.cfg),
                        );
                        debug!(
                            "potential duplicate: {} / {} at {:.3}",
                            pair.a, pair.b, pair.score
                        );
                        self.dispatch(reporter, &pair)?;
                        stats.pairs += 1;
                    }
                }
                considered.push(other_id);
            }

            //advance both cursors: the reverse direction stops B from
            //re-emitting the same pair when its own iteration comes up
            for other_id in &considered {
                self.store.record_searched(other_id, [media_id.clone()]);
            }
            self.store.record_searched(&media_id, considered);
            self.store
                .mark(&media_id, |flags| flags.search_complete = true)
                .map_err(SearchAbort::Store)?;

            stats.searched += 1;
            progress();
        }

        if stats.cancelled {
            warn!("search cancelled after {} entries", stats.searched);
        }
        Ok(stats)
    }

    fn dispatch(&self, reporter: &dyn PairReporter, pair: &PairEvent) -> Result<(), SearchAbort> {
        retry_transient(self.max_retries, || {
            reporter.report_potential_duplicate(&pair.a, &pair.b, pair.score)
        })
        .map_err(SearchAbort::Report)
    }
}

/// Why a search run stopped before finishing.
#[derive(Debug, thiserror::Error)]
pub enum SearchAbort {
    #[error("failed to report a duplicate pair: {0}")]
    Report(#[source] HostError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
