//! The pipeline driver: sequences discover → hash → index → search, farms the
//! CPU-bound hashing out to a bounded worker pool, funnels every store write
//! through a single writer, and honors cooperative cancellation between units
//! of work.

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::{retry_notify, ExponentialBackoff};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use thiserror::Error;

use crate::host::{HostClient, HostError, MediaId, PairReporter};
use crate::index::SimilarityIndex;
use crate::search::{SearchAbort, SearchCoordinator, SearchStats};
use crate::similarity::SimilarityCfg;
use crate::store::{EntryFlags, HashStore, StoreError};
use crate::vpdq::{HashCreationError, VideoFingerprint};

/// Initial retry interval after a transient host failure.
const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum retry interval.
const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(2);

/// Turns one video byte stream into a fingerprint. The production
/// implementation decodes through ffmpeg; tests substitute canned
/// fingerprints so the pipeline runs hermetically.
pub trait FingerprintBuilder: Send + Sync {
    fn fingerprint(
        &self,
        media: Box<dyn Read + Send>,
    ) -> Result<VideoFingerprint, HashCreationError>;
}

/// Cooperative cancellation shared between the driver, its workers and the
/// embedding application (e.g. a SIGINT handler). Cancelling never interrupts
/// a video mid-hash; in-flight work finishes and is committed.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The phases of one deduplication run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Discover,
    Hash,
    Index,
    Search,
}

/// Progress callbacks for a terminal renderer. All methods default to no-ops
/// so `&()` is a valid sink.
pub trait ProgressSink: Sync {
    fn begin(&self, _phase: Phase, _total: u64) {}
    fn advance(&self, _phase: Phase) {}
}

impl ProgressSink for () {}

/// Configuration for one pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineCfg {
    pub similarity: SimilarityCfg,
    /// Query terms passed verbatim to the host when listing files.
    pub query: Vec<String>,
    /// Worker pool size for hashing.
    pub job_count: usize,
    pub skip_hashing: bool,
    pub skip_search: bool,
    /// Attempts per transient host failure.
    pub max_retries: u32,
    /// Where the similarity-index snapshot lives.
    pub index_path: PathBuf,
}

/// Counters reported at the end of a run.
#[derive(Clone, Copy, Default, Debug)]
pub struct PipelineReport {
    /// Media ids returned by the host query.
    pub discovered: usize,
    /// Fingerprints committed this run.
    pub hashed: usize,
    /// Entries marked failed this run.
    pub failed: usize,
    /// Files skipped on host errors; they stay unhashed and unmarked.
    pub skipped: usize,
    /// Entries fully searched this run.
    pub searched: usize,
    /// Pairs dispatched this run.
    pub pairs: usize,
    pub cancelled: bool,
}

/// An error that ends the run. Cancellation is not an error; it surfaces as
/// [`PipelineReport::cancelled`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("host failure while {during}: {src}")]
    Host {
        during: &'static str,
        #[source]
        src: HostError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

//The outcome of one hash unit, sent from a worker to the store writer.
enum HashOutcome {
    Hashed {
        media_id: MediaId,
        fingerprint: VideoFingerprint,
    },
    Failed {
        media_id: MediaId,
        error: HashCreationError,
    },
    Skipped {
        media_id: MediaId,
        error: HostError,
    },
}

/// One deduplication run over a store, wired to a host client, a pair
/// reporter and a fingerprint builder.
pub struct Pipeline<'a> {
    client: &'a dyn HostClient,
    reporter: &'a dyn PairReporter,
    builder: &'a dyn FingerprintBuilder,
    store: &'a HashStore,
    cfg: PipelineCfg,
}

impl<'a> Pipeline<'a> {
    #[must_use]
    pub fn new(
        client: &'a dyn HostClient,
        reporter: &'a dyn PairReporter,
        builder: &'a dyn FingerprintBuilder,
        store: &'a HashStore,
        cfg: PipelineCfg,
    ) -> Self {
        Self {
            client,
            reporter,
            builder,
            store,
            cfg,
        }
    }

    /// Run all configured phases. Returns the run counters; the store is
    /// saved before returning, including on cancellation.
    ///
    /// # Errors
    /// Fatal store problems and host failures that survive retries. Per-video
    /// failures are contained and counted, never propagated.
    pub fn run(
        &self,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::default();

        if !self.cfg.skip_hashing {
            self.run_hash_phase(cancel, progress, &mut report)?;
        } else {
            info!("skipping the hash phase by configuration");
        }

        if !self.cfg.skip_search && !cancel.is_cancelled() {
            let index = self.ensure_index(progress);
            self.run_search_phase(&index, cancel, progress, &mut report)?;
        } else if self.cfg.skip_search {
            info!("skipping the search phase by configuration");
        }

        report.cancelled = cancel.is_cancelled();
        self.store.save()?;
        Ok(report)
    }

    fn run_hash_phase(
        &self,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        progress.begin(Phase::Discover, 0);
        let discovered = retry_transient(self.cfg.max_retries, || {
            self.client.list_media(&self.cfg.query)
        })
        .map_err(|src| PipelineError::Host {
            during: "listing files",
            src,
        })?;
        report.discovered = discovered.len();

        //previously failed entries are eligible again on a fresh run; within
        //this run a failure is final
        let to_hash: Vec<MediaId> = discovered
            .into_iter()
            .filter(|id| self.store.get(id).map_or(true, |entry| !entry.flags.hashed))
            .collect();
        info!(
            "{} of {} files need perceptual hashing",
            to_hash.len(),
            report.discovered
        );
        progress.begin(Phase::Hash, to_hash.len() as u64);

        let job_count = self.cfg.job_count.max(1);
        let (work_tx, work_rx) = bounded::<MediaId>(job_count * 2);
        let (result_tx, result_rx) = bounded::<HashOutcome>(job_count * 2);

        std::thread::scope(|scope| -> Result<(), PipelineError> {
            for _ in 0..job_count {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || self.hash_worker(&work_rx, &result_tx, cancel));
            }
            drop(work_rx);
            drop(result_tx);

            //single producer: feed ids until done or cancelled
            scope.spawn(move || {
                for media_id in to_hash {
                    if cancel.is_cancelled() || work_tx.send(media_id).is_err() {
                        break;
                    }
                }
            });

            //single writer: every store mutation happens on this thread
            for outcome in result_rx {
                match outcome {
                    HashOutcome::Hashed {
                        media_id,
                        fingerprint,
                    } => {
                        self.store
                            .upsert(media_id, Some(fingerprint), EntryFlags::hashed())?;
                        report.hashed += 1;
                    }
                    HashOutcome::Failed { media_id, error } => {
                        warn!("hashing failed for {media_id}: {error}");
                        self.store
                            .upsert(media_id, None, EntryFlags::failed())?;
                        report.failed += 1;
                    }
                    HashOutcome::Skipped { media_id, error } => {
                        warn!("skipping {media_id} on host error: {error}");
                        report.skipped += 1;
                    }
                }
                progress.advance(Phase::Hash);
            }
            Ok(())
        })?;

        self.store.save()?;
        info!(
            "hash phase done: {} hashed, {} failed, {} skipped",
            report.hashed, report.failed, report.skipped
        );
        Ok(())
    }

    fn hash_worker(
        &self,
        work: &Receiver<MediaId>,
        results: &Sender<HashOutcome>,
        cancel: &CancelToken,
    ) {
        for media_id in work {
            if cancel.is_cancelled() {
                break;
            }

            let outcome = self.hash_one(media_id);
            if results.send(outcome).is_err() {
                break;
            }
        }
    }

    fn hash_one(&self, media_id: MediaId) -> HashOutcome {
        let bytes = match retry_transient(self.cfg.max_retries, || {
            self.client.fetch_bytes(&media_id)
        }) {
            Ok(bytes) => bytes,
            Err(error) => return HashOutcome::Skipped { media_id, error },
        };

        match self.builder.fingerprint(bytes) {
            Ok(fingerprint) => {
                debug!("hashed {media_id}: {} frames", fingerprint.len());
                HashOutcome::Hashed {
                    media_id,
                    fingerprint,
                }
            }
            Err(error) => HashOutcome::Failed { media_id, error },
        }
    }

    //Make the index reflect the store: reuse the snapshot when it matches,
    //otherwise rebuild and re-snapshot. A damaged snapshot is recovered here
    //without user action.
    fn ensure_index(&self, progress: &dyn ProgressSink) -> SimilarityIndex {
        progress.begin(Phase::Index, 0);
        let path = &self.cfg.index_path;

        if path.exists() {
            match SimilarityIndex::load_from(path) {
                Ok(index) if index.reflects(self.store) => {
                    info!("similarity index snapshot is current ({} frames)", index.len());
                    return index;
                }
                Ok(_) => info!("similarity index snapshot is stale, rebuilding"),
                Err(e) => warn!("similarity index snapshot is unusable, rebuilding: {e}"),
            }
        }

        let mut index = SimilarityIndex::new();
        index.rebuild_from(self.store);
        if let Err(e) = index.snapshot_to(path) {
            //the snapshot is an optimization; the run proceeds without it
            warn!("could not write index snapshot: {e}");
        }
        index
    }

    fn run_search_phase(
        &self,
        index: &SimilarityIndex,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        let mut pending = 0u64;
        self.store.for_each_entry(|e| {
            if e.flags.hashed && !e.flags.failed && !e.flags.search_complete {
                pending += 1;
            }
        });
        progress.begin(Phase::Search, pending);

        let coordinator = SearchCoordinator::new(
            self.store,
            index,
            self.cfg.similarity,
            self.cfg.max_retries,
        );
        let stats: SearchStats = coordinator
            .run(self.reporter, cancel, || progress.advance(Phase::Search))
            .map_err(|abort| match abort {
                SearchAbort::Report(src) => PipelineError::Host {
                    during: "reporting duplicate pairs",
                    src,
                },
                SearchAbort::Store(e) => PipelineError::Store(e),
            })?;

        report.searched = stats.searched;
        report.pairs = stats.pairs;
        info!(
            "search phase done: {} entries searched, {} pairs reported",
            stats.searched, stats.pairs
        );
        Ok(())
    }
}

/// Run `op`, retrying transient host errors with exponential backoff starting
/// at 100 ms, up to `max_attempts` calls. Permanent errors and the final
/// transient failure are returned to the caller.
pub(crate) fn retry_transient<T>(
    max_attempts: u32,
    mut op: impl FnMut() -> Result<T, HostError>,
) -> Result<T, HostError> {
    let policy = ExponentialBackoff {
        initial_interval: RETRY_INITIAL_INTERVAL,
        max_interval: RETRY_MAX_INTERVAL,
        //attempt counting below terminates the retries, not elapsed time
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };

    let mut attempt = 0u32;
    let result = retry_notify(
        policy,
        || {
            attempt += 1;
            op().map_err(|e| {
                let retryable = matches!(e, HostError::Transient(_)) && attempt < max_attempts;
                if retryable {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        },
        |err: HostError, delay: Duration| {
            warn!("transient host error, retrying in {delay:?}: {err}");
        },
    );

    result.map_err(|e| match e {
        backoff::Error::Permanent(err) => err,
        backoff::Error::Transient { err, .. } => err,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::HostError;
    use parking_lot::Mutex;

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let calls = Mutex::new(0u32);
        let result: Result<(), _> = retry_transient(3, || {
            *calls.lock() += 1;
            Err(HostError::Transient("flaky".to_string()))
        });
        assert!(matches!(result, Err(HostError::Transient(_))));
        assert_eq!(*calls.lock(), 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Mutex::new(0u32);
        let result: Result<(), _> = retry_transient(3, || {
            *calls.lock() += 1;
            Err(HostError::Permanent("gone".to_string()))
        });
        assert!(matches!(result, Err(HostError::Permanent(_))));
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn success_after_transient_failure() {
        let calls = Mutex::new(0u32);
        let result = retry_transient(3, || {
            let mut calls = calls.lock();
            *calls += 1;
            if *calls < 2 {
                Err(HostError::Transient("hiccup".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
