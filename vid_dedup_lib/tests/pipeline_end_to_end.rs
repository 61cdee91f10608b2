//! Whole-pipeline tests against an in-memory host and a stub fingerprint
//! builder: no network, no ffmpeg, real store and index files on disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::prelude::*;

use vid_dedup_lib::{
    CancelToken, FingerprintBuilder, FrameRecord, HashCreationError, HashStore, HostClient,
    HostError, MediaId, PairReporter, PdqHash, Phase, Pipeline, PipelineCfg, ProgressSink,
    SimilarityCfg, VideoFingerprint,
};

//The stub "container format": a leading 0xFF byte means the file is corrupt;
//otherwise every 33-byte chunk is one frame (32 hash bytes + 1 quality byte).
struct StubBuilder;

impl FingerprintBuilder for StubBuilder {
    fn fingerprint(
        &self,
        mut media: Box<dyn Read + Send>,
    ) -> Result<VideoFingerprint, HashCreationError> {
        let mut payload = Vec::new();
        media
            .read_to_end(&mut payload)
            .map_err(|e| HashCreationError::Decode(e.to_string()))?;

        if payload.first() == Some(&0xFF) {
            return Err(HashCreationError::CorruptStream(
                "stub decoder failure".to_string(),
            ));
        }

        let records = payload.chunks_exact(33).enumerate().map(|(i, chunk)| {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&chunk[..32]);
            FrameRecord {
                hash: PdqHash::from_bytes(hash),
                quality: chunk[32],
                timestamp: i as f32,
            }
        });
        Ok(VideoFingerprint::from_records(records))
    }
}

#[derive(Default)]
struct StubHost {
    videos: BTreeMap<MediaId, Vec<u8>>,
    missing: HashSet<MediaId>,
    //per-id countdown of transient failures before a fetch succeeds
    flaky: Mutex<HashMap<MediaId, u32>>,
}

impl StubHost {
    fn add_video(&mut self, media_id: MediaId, payload: Vec<u8>) {
        self.videos.insert(media_id, payload);
    }
}

impl HostClient for StubHost {
    fn list_media(&self, _query: &[String]) -> Result<Vec<MediaId>, HostError> {
        Ok(self.videos.keys().cloned().collect())
    }

    fn fetch_bytes(&self, media_id: &MediaId) -> Result<Box<dyn Read + Send>, HostError> {
        if self.missing.contains(media_id) {
            return Err(HostError::Permanent("404 not found".to_string()));
        }
        if let Some(remaining) = self.flaky.lock().get_mut(media_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HostError::Transient("simulated timeout".to_string()));
            }
        }
        let payload = self
            .videos
            .get(media_id)
            .ok_or_else(|| HostError::Permanent("unknown id".to_string()))?;
        Ok(Box::new(Cursor::new(payload.clone())))
    }
}

#[derive(Default)]
struct RecordingReporter {
    pairs: Mutex<HashSet<(MediaId, MediaId)>>,
    reports: Mutex<Vec<f64>>,
}

impl PairReporter for RecordingReporter {
    fn report_potential_duplicate(
        &self,
        a: &MediaId,
        b: &MediaId,
        score: f64,
    ) -> Result<(), HostError> {
        self.pairs.lock().insert((a.clone(), b.clone()));
        self.reports.lock().push(score);
        Ok(())
    }
}

//Cancels the run after a fixed number of hash completions.
struct CancelAfter {
    token: CancelToken,
    remaining: Mutex<u32>,
}

impl ProgressSink for CancelAfter {
    fn advance(&self, phase: Phase) {
        if phase == Phase::Hash {
            let mut remaining = self.remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                if *remaining == 0 {
                    self.token.cancel();
                }
            }
        }
    }
}

fn id(byte: u8) -> MediaId {
    MediaId::from_bytes(vec![byte; 32])
}

fn frames_payload(hashes: &[[u8; 32]], quality: u8) -> Vec<u8> {
    let mut payload = Vec::new();
    for hash in hashes {
        payload.extend_from_slice(hash);
        payload.push(quality);
    }
    payload
}

fn random_hashes(count: usize, rng: &mut StdRng) -> Vec<[u8; 32]> {
    (0..count).map(|_| rng.random()).collect()
}

fn cfg(dir: &Path) -> PipelineCfg {
    PipelineCfg {
        similarity: SimilarityCfg::default(),
        query: vec![],
        job_count: 2,
        skip_hashing: false,
        skip_search: false,
        max_retries: 3,
        index_path: dir.join("index.snapshot"),
    }
}

fn store_at(dir: &Path) -> HashStore {
    HashStore::open(dir.join("fingerprints.db"), 1000).unwrap()
}

fn flag_summary(store: &HashStore) -> BTreeMap<String, (bool, bool, usize)> {
    store
        .iter()
        .into_iter()
        .map(|e| {
            (
                e.media_id.to_string(),
                (
                    e.flags.hashed,
                    e.flags.failed,
                    e.fingerprint.map_or(0, |f| f.len()),
                ),
            )
        })
        .collect()
}

#[test]
fn identical_videos_produce_one_pair() {
    let mut rng = StdRng::seed_from_u64(101);
    let shared = random_hashes(10, &mut rng);
    let other = random_hashes(10, &mut rng);

    let mut host = StubHost::default();
    host.add_video(id(1), frames_payload(&shared, 90));
    host.add_video(id(2), frames_payload(&shared, 90));
    host.add_video(id(3), frames_payload(&other, 90));

    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());
    let reporter = RecordingReporter::default();

    let pipeline = Pipeline::new(&host, &reporter, &StubBuilder, &store, cfg(dir.path()));
    let report = pipeline.run(&CancelToken::new(), &()).unwrap();

    assert_eq!(report.discovered, 3);
    assert_eq!(report.hashed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.searched, 3);
    assert_eq!(report.pairs, 1);
    assert!(!report.cancelled);

    let pairs = reporter.pairs.lock();
    assert_eq!(pairs.len(), 1);
    assert!(pairs.contains(&(id(1), id(2))));
    assert!(reporter.reports.lock().iter().all(|&s| s >= 0.95));
}

#[test]
fn corrupt_video_is_recorded_failed_without_pairs() {
    let mut rng = StdRng::seed_from_u64(102);

    let mut host = StubHost::default();
    host.add_video(id(1), frames_payload(&random_hashes(5, &mut rng), 90));
    host.add_video(id(2), vec![0xFF, 1, 2, 3]);

    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());
    let reporter = RecordingReporter::default();

    let pipeline = Pipeline::new(&host, &reporter, &StubBuilder, &store, cfg(dir.path()));
    let report = pipeline.run(&CancelToken::new(), &()).unwrap();

    assert_eq!(report.hashed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.pairs, 0);

    let failed = store.get(&id(2)).unwrap();
    assert!(failed.flags.failed && !failed.flags.hashed);
    assert!(failed.fingerprint.is_none());
}

#[test]
fn permanently_missing_file_is_skipped_not_failed() {
    let mut rng = StdRng::seed_from_u64(103);

    let mut host = StubHost::default();
    host.add_video(id(1), frames_payload(&random_hashes(5, &mut rng), 90));
    host.add_video(id(2), frames_payload(&random_hashes(5, &mut rng), 90));
    host.missing.insert(id(2));

    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());
    let reporter = RecordingReporter::default();

    let pipeline = Pipeline::new(&host, &reporter, &StubBuilder, &store, cfg(dir.path()));
    let report = pipeline.run(&CancelToken::new(), &()).unwrap();

    assert_eq!(report.hashed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    //the file may reappear later; no entry is created for it
    assert!(store.get(&id(2)).is_none());
}

#[test]
fn transient_fetch_failures_are_retried() {
    let mut rng = StdRng::seed_from_u64(104);

    let mut host = StubHost::default();
    host.add_video(id(1), frames_payload(&random_hashes(5, &mut rng), 90));
    host.flaky.lock().insert(id(1), 2);

    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());
    let reporter = RecordingReporter::default();

    let pipeline = Pipeline::new(&host, &reporter, &StubBuilder, &store, cfg(dir.path()));
    let report = pipeline.run(&CancelToken::new(), &()).unwrap();

    assert_eq!(report.hashed, 1);
    assert_eq!(report.skipped, 0);
}

#[test]
fn cancelled_run_resumes_to_the_same_state() {
    let mut rng = StdRng::seed_from_u64(105);
    let payloads: Vec<(MediaId, Vec<u8>)> = {
        let shared = random_hashes(8, &mut rng);
        let mut videos = vec![
            (id(1), frames_payload(&shared, 90)),
            (id(2), frames_payload(&shared, 90)),
        ];
        //enough files that a single worker cannot have them all in flight
        //when the cancellation lands
        for i in 3..=12 {
            videos.push((id(i), frames_payload(&random_hashes(8, &mut rng), 90)));
        }
        videos
    };

    let mut host = StubHost::default();
    for (media_id, payload) in &payloads {
        host.add_video(media_id.clone(), payload.clone());
    }

    //reference: a single uninterrupted run
    let reference_dir = tempfile::tempdir().unwrap();
    let reference_store = store_at(reference_dir.path());
    let reference_reporter = RecordingReporter::default();
    Pipeline::new(
        &host,
        &reference_reporter,
        &StubBuilder,
        &reference_store,
        cfg(reference_dir.path()),
    )
    .run(&CancelToken::new(), &())
    .unwrap();

    //interrupted: cancel after two hashes, then resume with a fresh pipeline
    //over the same store file. One worker keeps at most one hash in flight
    //past the cancellation point.
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_at(dir.path());
        let reporter = RecordingReporter::default();
        let sink = CancelAfter {
            token: CancelToken::new(),
            remaining: Mutex::new(2),
        };
        let mut interrupted_cfg = cfg(dir.path());
        interrupted_cfg.job_count = 1;
        let report = Pipeline::new(&host, &reporter, &StubBuilder, &store, interrupted_cfg)
            .run(&sink.token, &sink)
            .unwrap();
        assert!(report.cancelled);
        assert!(report.hashed < payloads.len());
    }

    let store = store_at(dir.path());
    let reporter = RecordingReporter::default();
    let report = Pipeline::new(&host, &reporter, &StubBuilder, &store, cfg(dir.path()))
        .run(&CancelToken::new(), &())
        .unwrap();
    assert!(!report.cancelled);

    //the resumed store converges to the single-shot result
    assert_eq!(flag_summary(&store), flag_summary(&reference_store));
    assert_eq!(
        *reporter.pairs.lock(),
        *reference_reporter.pairs.lock()
    );
}

#[test]
fn stale_snapshot_is_rebuilt_when_the_store_changes() {
    let mut rng = StdRng::seed_from_u64(106);
    let shared = random_hashes(8, &mut rng);

    let mut host = StubHost::default();
    host.add_video(id(1), frames_payload(&shared, 90));

    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());
    let reporter = RecordingReporter::default();
    Pipeline::new(&host, &reporter, &StubBuilder, &store, cfg(dir.path()))
        .run(&CancelToken::new(), &())
        .unwrap();
    assert!(PathBuf::from(dir.path().join("index.snapshot")).exists());

    //a new duplicate arrives after the snapshot was taken
    host.add_video(id(2), frames_payload(&shared, 90));
    let reporter = RecordingReporter::default();
    let report = Pipeline::new(&host, &reporter, &StubBuilder, &store, cfg(dir.path()))
        .run(&CancelToken::new(), &())
        .unwrap();

    assert_eq!(report.pairs, 1);
    assert!(reporter.pairs.lock().contains(&(id(1), id(2))));
}

#[test]
fn skip_flags_disable_their_phases() {
    let mut rng = StdRng::seed_from_u64(107);
    let shared = random_hashes(8, &mut rng);

    let mut host = StubHost::default();
    host.add_video(id(1), frames_payload(&shared, 90));
    host.add_video(id(2), frames_payload(&shared, 90));

    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());
    let reporter = RecordingReporter::default();

    let mut hash_only = cfg(dir.path());
    hash_only.skip_search = true;
    let report = Pipeline::new(&host, &reporter, &StubBuilder, &store, hash_only)
        .run(&CancelToken::new(), &())
        .unwrap();
    assert_eq!(report.hashed, 2);
    assert_eq!(report.pairs, 0);
    assert!(reporter.pairs.lock().is_empty());

    let mut search_only = cfg(dir.path());
    search_only.skip_hashing = true;
    let report = Pipeline::new(&host, &reporter, &StubBuilder, &store, search_only)
        .run(&CancelToken::new(), &())
        .unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(report.pairs, 1);
}

#[test]
fn low_quality_slate_frames_do_not_pair_different_videos() {
    let mut rng = StdRng::seed_from_u64(108);

    //both videos open with the same 30s slate (low quality), then diverge
    let slate = random_hashes(1, &mut rng);
    let body_a = random_hashes(8, &mut rng);
    let body_b = random_hashes(8, &mut rng);

    let mut payload_a = frames_payload(&slate, 10);
    payload_a.extend(frames_payload(&body_a, 90));
    let mut payload_b = frames_payload(&slate, 10);
    payload_b.extend(frames_payload(&body_b, 90));

    let mut host = StubHost::default();
    host.add_video(id(1), payload_a);
    host.add_video(id(2), payload_b);

    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path());
    let reporter = RecordingReporter::default();
    let report = Pipeline::new(&host, &reporter, &StubBuilder, &store, cfg(dir.path()))
        .run(&CancelToken::new(), &())
        .unwrap();

    assert_eq!(report.pairs, 0);
}
