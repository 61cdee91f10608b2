//! The in-memory similarity index: a BK-tree over every retained frame hash
//! in the library, keyed by Hamming distance.
//!
//! Hamming space has no coordinates, so spatial trees do not apply; a BK-tree
//! only needs the metric itself and gives sub-linear radius queries on the
//! low-entropy hash populations real libraries produce. Leaves accumulate
//! back-pointers when distinct frames share an exact hash.
//!
//! The index is a derived view of the [`HashStore`]: it can always be rebuilt
//! from it, and its snapshot file is a cache, not a source of truth.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;

use crate::definitions::PDQ_HASH_BYTES;
use crate::host::MediaId;
use crate::pdq::PdqHash;
use crate::store::HashStore;

const SNAPSHOT_MAGIC: [u8; 8] = *b"HVDBKIDX";
const SNAPSHOT_VERSION: u32 = 1;
const MAX_MEDIA_ID_LEN: u16 = 1024;

/// An error loading or writing an index snapshot. Never fatal: the caller
/// recovers by rebuilding from the store and re-snapshotting.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index snapshot io error at {path}: {src}")]
    Io {
        path: PathBuf,
        #[source]
        src: std::io::Error,
    },

    #[error("index snapshot at {path} is unusable: {detail}")]
    Corrupt { path: PathBuf, detail: String },
}

/// Points from an indexed frame hash back to the fingerprint frame it came
/// from.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct BackPointer {
    pub media_id: MediaId,
    pub frame_index: u32,
}

struct Node {
    hash: PdqHash,
    pointers: Vec<BackPointer>,
    children: BTreeMap<u32, Node>,
}

impl Node {
    fn new(hash: PdqHash, pointer: BackPointer) -> Self {
        Self {
            hash,
            pointers: vec![pointer],
            children: BTreeMap::new(),
        }
    }
}

/// BK-tree over frame hashes with back-pointer leaves.
#[derive(Default)]
pub struct SimilarityIndex {
    root: Option<Box<Node>>,
    //insertion order, kept so snapshots rebuild an identical tree
    log: Vec<(PdqHash, BackPointer)>,
}

impl SimilarityIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of indexed frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn add(&mut self, hash: PdqHash, pointer: BackPointer) {
        self.log.push((hash, pointer.clone()));

        if self.root.is_none() {
            self.root = Some(Box::new(Node::new(hash, pointer)));
            return;
        }
        let mut node = self
            .root
            .as_deref_mut()
            .expect("root exists; just checked");
        loop {
            let distance = node.hash.hamming_distance(&hash);
            if distance == 0 {
                node.pointers.push(pointer);
                return;
            }
            //descend the edge for this distance, creating a leaf if absent
            match node.children.entry(distance) {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(Node::new(hash, pointer));
                    return;
                }
                std::collections::btree_map::Entry::Occupied(child) => {
                    node = child.into_mut();
                }
            }
        }
    }

    /// Every back-pointer whose hash is within Hamming distance `radius` of
    /// `hash`.
    #[must_use]
    pub fn radius_query(&self, hash: &PdqHash, radius: u32) -> Vec<&BackPointer> {
        let mut results = Vec::new();
        let Some(root) = self.root.as_deref() else {
            return results;
        };

        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let distance = node.hash.hamming_distance(hash);
            if distance <= radius {
                results.extend(node.pointers.iter());
            }

            //the triangle inequality prunes any edge outside d +/- radius
            let low = distance.saturating_sub(radius);
            let high = distance + radius;
            for (_, child) in node.children.range(low..=high) {
                stack.push(child);
            }
        }
        results
    }

    /// Discard the tree and rebuild it from every hashed, non-failed entry in
    /// the store. Low-quality frames are not indexed.
    pub fn rebuild_from(&mut self, store: &HashStore) {
        self.root = None;
        self.log.clear();

        let mut frames = 0usize;
        store.for_each_entry(|entry| {
            if !entry.flags.hashed || entry.flags.failed {
                return;
            }
            let Some(fingerprint) = &entry.fingerprint else {
                return;
            };
            for (frame_index, record) in fingerprint.records().enumerate() {
                if !record.is_retained() {
                    continue;
                }
                self.add(
                    record.hash,
                    BackPointer {
                        media_id: entry.media_id.clone(),
                        frame_index: frame_index as u32,
                    },
                );
                frames += 1;
            }
        });
        info!("similarity index rebuilt over {frames} frames");
    }

    /// Whether this index holds exactly the frames the store would produce.
    /// Used to decide if a loaded snapshot is stale.
    #[must_use]
    pub fn reflects(&self, store: &HashStore) -> bool {
        let mut indexed: HashMap<&MediaId, u32> = HashMap::new();
        for (_, pointer) in &self.log {
            *indexed.entry(&pointer.media_id).or_default() += 1;
        }

        let mut expected_total = 0usize;
        let mut per_entry_match = true;
        store.for_each_entry(|entry| {
            if !entry.flags.hashed || entry.flags.failed {
                return;
            }
            let Some(fingerprint) = &entry.fingerprint else {
                return;
            };
            let retained = fingerprint.retained().count() as u32;
            if retained == 0 {
                return;
            }
            expected_total += retained as usize;
            if indexed.get(&entry.media_id) != Some(&retained) {
                per_entry_match = false;
            }
        });

        per_entry_match && expected_total == self.log.len()
    }

    /// Write the insertion sequence to `path` with the store's atomic commit
    /// discipline. Re-inserting the sequence on load reproduces the identical
    /// tree.
    pub fn snapshot_to(&self, path: &Path) -> Result<(), IndexError> {
        let io_err = |src| IndexError::Io {
            path: path.to_path_buf(),
            src,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let temp_path = path.with_extension("tmp");
        let temp_file = std::fs::File::create(&temp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(temp_file);

        writer.write_all(&SNAPSHOT_MAGIC).map_err(io_err)?;
        writer
            .write_all(&SNAPSHOT_VERSION.to_le_bytes())
            .map_err(io_err)?;
        writer
            .write_all(&(self.log.len() as u64).to_le_bytes())
            .map_err(io_err)?;

        for (hash, pointer) in &self.log {
            writer.write_all(hash.as_bytes()).map_err(io_err)?;
            let id = pointer.media_id.as_bytes();
            writer
                .write_all(&(id.len() as u16).to_le_bytes())
                .map_err(io_err)?;
            writer.write_all(id).map_err(io_err)?;
            writer
                .write_all(&pointer.frame_index.to_le_bytes())
                .map_err(io_err)?;
        }

        writer.flush().map_err(io_err)?;
        let temp_file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        temp_file.sync_all().map_err(io_err)?;
        std::fs::rename(&temp_path, path).map_err(io_err)?;
        Ok(())
    }

    /// Load a snapshot written by [`snapshot_to`](Self::snapshot_to).
    ///
    /// # Errors
    /// [`IndexError`] when the file is missing, torn or version-mismatched;
    /// the caller should rebuild from the store.
    pub fn load_from(path: &Path) -> Result<Self, IndexError> {
        let io_err = |src| IndexError::Io {
            path: path.to_path_buf(),
            src,
        };
        let corrupt = |detail: String| IndexError::Corrupt {
            path: path.to_path_buf(),
            detail,
        };

        let file = std::fs::File::open(path).map_err(io_err)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|e| corrupt(format!("truncated header: {e}")))?;
        if magic != SNAPSHOT_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }

        let mut version = [0u8; 4];
        reader
            .read_exact(&mut version)
            .map_err(|e| corrupt(format!("truncated header: {e}")))?;
        let version = u32::from_le_bytes(version);
        if version != SNAPSHOT_VERSION {
            return Err(corrupt(format!("unknown snapshot version {version}")));
        }

        let mut count = [0u8; 8];
        reader
            .read_exact(&mut count)
            .map_err(|e| corrupt(format!("truncated header: {e}")))?;
        let count = u64::from_le_bytes(count);

        let mut index = Self::new();
        for _ in 0..count {
            let mut hash = [0u8; PDQ_HASH_BYTES];
            reader
                .read_exact(&mut hash)
                .map_err(|e| corrupt(format!("truncated record: {e}")))?;

            let mut id_len = [0u8; 2];
            reader
                .read_exact(&mut id_len)
                .map_err(|e| corrupt(format!("truncated record: {e}")))?;
            let id_len = u16::from_le_bytes(id_len);
            if id_len == 0 || id_len > MAX_MEDIA_ID_LEN {
                return Err(corrupt(format!("implausible media id length {id_len}")));
            }

            let mut id = vec![0u8; usize::from(id_len)];
            reader
                .read_exact(&mut id)
                .map_err(|e| corrupt(format!("truncated record: {e}")))?;

            let mut frame_index = [0u8; 4];
            reader
                .read_exact(&mut frame_index)
                .map_err(|e| corrupt(format!("truncated record: {e}")))?;

            index.add(
                PdqHash::from_bytes(hash),
                BackPointer {
                    media_id: MediaId::from_bytes(id),
                    frame_index: u32::from_le_bytes(frame_index),
                },
            );
        }
        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use rand::prelude::*;

    use super::*;

    fn pointer(byte: u8, frame: u32) -> BackPointer {
        BackPointer {
            media_id: MediaId::from_bytes(vec![byte; 32]),
            frame_index: frame,
        }
    }

    fn random_hash(rng: &mut StdRng) -> PdqHash {
        PdqHash::from_bytes(rng.random())
    }

    fn brute_force<'a>(
        population: &'a [(PdqHash, BackPointer)],
        query: &PdqHash,
        radius: u32,
    ) -> HashSet<&'a BackPointer> {
        population
            .iter()
            .filter(|(h, _)| h.hamming_distance(query) <= radius)
            .map(|(_, p)| p)
            .collect()
    }

    #[test]
    fn query_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(42);
        let population: Vec<(PdqHash, BackPointer)> = (0..500)
            .map(|i| (random_hash(&mut rng), pointer((i % 251) as u8, i)))
            .collect();

        let mut index = SimilarityIndex::new();
        for (hash, ptr) in &population {
            index.add(*hash, ptr.clone());
        }

        for _ in 0..20 {
            let query = random_hash(&mut rng);
            for radius in [0, 16, 32, 64, 128] {
                let got: HashSet<&BackPointer> =
                    index.radius_query(&query, radius).into_iter().collect();
                let expected = brute_force(&population, &query, radius);
                assert_eq!(got, expected, "radius {radius}");
            }
        }
    }

    #[test]
    fn radius_queries_are_monotonic() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut index = SimilarityIndex::new();
        for i in 0..300 {
            index.add(random_hash(&mut rng), pointer((i % 199) as u8, i));
        }

        let query = random_hash(&mut rng);
        let mut previous: HashSet<&BackPointer> = HashSet::new();
        for radius in [0, 8, 16, 32, 64, 128, 256] {
            let current: HashSet<&BackPointer> =
                index.radius_query(&query, radius).into_iter().collect();
            assert!(previous.is_subset(&current), "radius {radius}");
            previous = current;
        }
    }

    #[test]
    fn exact_collisions_share_a_leaf() {
        let mut index = SimilarityIndex::new();
        let hash = PdqHash::from_bytes([0xab; 32]);
        index.add(hash, pointer(1, 0));
        index.add(hash, pointer(2, 7));

        let hits = index.radius_query(&hash, 0);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn snapshot_roundtrip_preserves_queries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.snapshot");

        let mut rng = StdRng::seed_from_u64(9);
        let mut index = SimilarityIndex::new();
        for i in 0..200 {
            index.add(random_hash(&mut rng), pointer((i % 97) as u8, i));
        }
        index.snapshot_to(&path).unwrap();

        let loaded = SimilarityIndex::load_from(&path).unwrap();
        assert_eq!(loaded.len(), index.len());

        for _ in 0..10 {
            let query = random_hash(&mut rng);
            let got: HashSet<BackPointer> = loaded
                .radius_query(&query, 40)
                .into_iter()
                .cloned()
                .collect();
            let expected: HashSet<BackPointer> = index
                .radius_query(&query, 40)
                .into_iter()
                .cloned()
                .collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn rebuild_matches_incremental_construction() {
        use crate::store::{EntryFlags, HashStore};
        use crate::vpdq::{FrameRecord, VideoFingerprint};

        let dir = tempfile::tempdir().unwrap();
        let store = HashStore::open(dir.path().join("fingerprints.db"), 1000).unwrap();

        let mut rng = StdRng::seed_from_u64(17);
        let mut incremental = SimilarityIndex::new();

        for v in 0..20u8 {
            let records: Vec<FrameRecord> = (0..6)
                .map(|frame| FrameRecord {
                    hash: random_hash(&mut rng),
                    //one low-quality frame per video, never indexed
                    quality: if frame == 0 { 10 } else { 90 },
                    timestamp: frame as f32,
                })
                .collect();

            for (frame_index, record) in records.iter().enumerate() {
                if record.is_retained() {
                    incremental.add(
                        record.hash,
                        BackPointer {
                            media_id: MediaId::from_bytes(vec![v; 32]),
                            frame_index: frame_index as u32,
                        },
                    );
                }
            }
            store
                .upsert(
                    MediaId::from_bytes(vec![v; 32]),
                    Some(VideoFingerprint::from_records(records)),
                    EntryFlags::hashed(),
                )
                .unwrap();
        }

        let mut rebuilt = SimilarityIndex::new();
        rebuilt.rebuild_from(&store);
        assert_eq!(rebuilt.len(), incremental.len());

        for _ in 0..10 {
            let query = random_hash(&mut rng);
            for radius in [0, 32, 96] {
                let got: HashSet<&BackPointer> =
                    rebuilt.radius_query(&query, radius).into_iter().collect();
                let expected: HashSet<&BackPointer> = incremental
                    .radius_query(&query, radius)
                    .into_iter()
                    .collect();
                assert_eq!(got, expected);
            }
        }
    }

    #[test]
    fn torn_snapshot_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.snapshot");

        let mut rng = StdRng::seed_from_u64(13);
        let mut index = SimilarityIndex::new();
        for i in 0..20 {
            index.add(random_hash(&mut rng), pointer(i as u8, 0));
        }
        index.snapshot_to(&path).unwrap();

        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 5).unwrap();

        assert!(matches!(
            SimilarityIndex::load_from(&path),
            Err(IndexError::Corrupt { .. })
        ));
    }
}
