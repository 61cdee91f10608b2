//! The durable fingerprint store: a keyed map from media id to fingerprint
//! and lifecycle flags, held in memory behind a read-write lock and persisted
//! as a single file with an atomic write-temp-then-rename commit.
//!
//! The store is the single source of truth for persistent state; the
//! similarity index is a derived view and is rebuilt from here whenever it is
//! stale or damaged.

use std::collections::{HashMap, HashSet};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

use log::{info, trace};
use parking_lot::RwLock;
use thiserror::Error;

use crate::host::MediaId;
use crate::vpdq::VideoFingerprint;

mod format;

/// An error raised by the fingerprint store. Corruption and version
/// mismatches are fatal to the run; the store never migrates or repairs a
/// file it does not understand.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io error at {path}: {src}")]
    Io {
        path: PathBuf,
        #[source]
        src: std::io::Error,
    },

    #[error("fingerprint store at {path} is corrupt ({detail}); delete it or restore a backup")]
    Corrupt { path: PathBuf, detail: String },

    #[error(
        "fingerprint store at {path} has schema version {found} but this build reads version \
         {expected}; upgrade the tool or use a fresh database directory"
    )]
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

/// Per-entry lifecycle flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EntryFlags {
    /// A fingerprint has been computed and committed for this entry.
    pub hashed: bool,
    /// The entry has been compared against every other hashed entry.
    pub search_complete: bool,
    /// Decoding or hashing failed unrecoverably; the entry is neither indexed
    /// nor searched, and is not retried within a run.
    pub failed: bool,
}

impl EntryFlags {
    const HASHED: u8 = 1;
    const SEARCH_COMPLETE: u8 = 1 << 1;
    const FAILED: u8 = 1 << 2;

    #[must_use]
    pub fn hashed() -> Self {
        Self {
            hashed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed() -> Self {
        Self {
            failed: true,
            ..Self::default()
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.hashed {
            byte |= Self::HASHED;
        }
        if self.search_complete {
            byte |= Self::SEARCH_COMPLETE;
        }
        if self.failed {
            byte |= Self::FAILED;
        }
        byte
    }

    pub(crate) fn from_byte(byte: u8) -> Self {
        Self {
            hashed: byte & Self::HASHED != 0,
            search_complete: byte & Self::SEARCH_COMPLETE != 0,
            failed: byte & Self::FAILED != 0,
        }
    }
}

/// One store entry: the media id, its fingerprint once hashed, lifecycle
/// flags, and the in-run search cursor.
#[derive(Clone, Debug)]
pub struct StoreEntry {
    pub media_id: MediaId,
    pub fingerprint: Option<VideoFingerprint>,
    pub flags: EntryFlags,
    /// Media ids this entry has already been compared against during the
    /// current run. Not persisted: on restart re-comparison re-emits pairs,
    /// which the host treats as a no-op.
    pub searched_against: HashSet<MediaId>,
}

impl StoreEntry {
    fn new(media_id: MediaId, fingerprint: Option<VideoFingerprint>, flags: EntryFlags) -> Self {
        Self {
            media_id,
            fingerprint,
            flags,
            searched_against: HashSet::new(),
        }
    }

    pub(crate) fn from_disk(
        media_id: MediaId,
        fingerprint: Option<VideoFingerprint>,
        flags: EntryFlags,
    ) -> Self {
        Self::new(media_id, fingerprint, flags)
    }
}

/// The persistent fingerprint store.
///
/// Mutating operations are atomic per entry and batched to disk: every
/// `save_threshold` modifications the whole map is serialized to a sibling
/// temp file, fsynced, and renamed over the store file, so a crash leaves
/// either the old file or the new one, never a torn write. Callers must
/// [`save`](Self::save) once after the final modification.
#[derive(Debug)]
pub struct HashStore {
    path: PathBuf,
    save_threshold: u32,
    modified_count: AtomicU32,
    entries: RwLock<HashMap<MediaId, StoreEntry>>,
}

impl HashStore {
    /// Open the store at `path`, loading any existing file. A missing file is
    /// an empty store, not an error.
    ///
    /// # Errors
    /// [`StoreError::Corrupt`] or [`StoreError::VersionMismatch`] when the
    /// file exists but cannot be trusted; both are fatal to the caller.
    pub fn open(path: impl Into<PathBuf>, save_threshold: u32) -> Result<Self, StoreError> {
        let path = path.into();

        let entries = if path.exists() {
            let file = std::fs::File::open(&path).map_err(|src| StoreError::Io {
                path: path.clone(),
                src,
            })?;
            let loaded = format::read_store(&mut BufReader::new(file), &path)?;
            trace!(
                "loaded fingerprint store: path {}, entries {}",
                path.display(),
                loaded.len()
            );
            loaded
                .into_iter()
                .map(|entry| (entry.media_id.clone(), entry))
                .collect()
        } else {
            info!("creating new fingerprint store at {}", path.display());
            HashMap::new()
        };

        Ok(Self {
            path,
            save_threshold: save_threshold.max(1),
            modified_count: AtomicU32::default(),
            entries: RwLock::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn get(&self, media_id: &MediaId) -> Option<StoreEntry> {
        self.entries.read().get(media_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, media_id: &MediaId) -> bool {
        self.entries.read().contains_key(media_id)
    }

    /// Create or replace the entry for `media_id`. The fingerprint and flags
    /// become visible together.
    pub fn upsert(
        &self,
        media_id: MediaId,
        fingerprint: Option<VideoFingerprint>,
        flags: EntryFlags,
    ) -> Result<(), StoreError> {
        {
            let mut entries = self.entries.write();
            entries.insert(
                media_id.clone(),
                StoreEntry::new(media_id, fingerprint, flags),
            );
        }
        self.note_modification()
    }

    /// Update one flag of an existing entry. Unknown ids are ignored.
    pub fn mark(
        &self,
        media_id: &MediaId,
        update: impl FnOnce(&mut EntryFlags),
    ) -> Result<(), StoreError> {
        {
            let mut entries = self.entries.write();
            match entries.get_mut(media_id) {
                Some(entry) => update(&mut entry.flags),
                None => return Ok(()),
            }
        }
        self.note_modification()
    }

    /// Extend the in-run search cursor of an entry.
    pub fn record_searched(
        &self,
        media_id: &MediaId,
        others: impl IntoIterator<Item = MediaId>,
    ) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(media_id) {
            entry.searched_against.extend(others);
        }
    }

    /// A snapshot of every entry. Iteration order is unspecified.
    #[must_use]
    pub fn iter(&self) -> Vec<StoreEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// The ids of every entry, without cloning fingerprints.
    #[must_use]
    pub fn ids(&self) -> Vec<MediaId> {
        self.entries.read().keys().cloned().collect()
    }

    /// Visit every entry under the read guard, without cloning. Used for
    /// index rebuilds; the visitor must not call back into the store.
    pub fn for_each_entry(&self, mut visit: impl FnMut(&StoreEntry)) {
        for entry in self.entries.read().values() {
            visit(entry);
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, media_id: &MediaId) -> Result<bool, StoreError> {
        let existed = self.entries.write().remove(media_id).is_some();
        if existed {
            self.note_modification()?;
        }
        Ok(existed)
    }

    /// Drop every entry and persist the empty store.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.entries.write().clear();
        self.modified_count.store(0, Relaxed);
        self.save_inner()
    }

    /// Reset search progress on every entry (flags and cursors), keeping the
    /// fingerprints. The next run re-searches the whole library.
    pub fn clear_search_progress(&self) -> Result<(), StoreError> {
        {
            let mut entries = self.entries.write();
            for entry in entries.values_mut() {
                entry.flags.search_complete = false;
                entry.searched_against.clear();
            }
        }
        self.modified_count.store(0, Relaxed);
        self.save_inner()
    }

    /// Persist to disk if anything changed since the last save.
    pub fn save(&self) -> Result<(), StoreError> {
        if self.modified_count.swap(0, Relaxed) == 0 {
            return Ok(());
        }
        self.save_inner()
    }

    fn note_modification(&self) -> Result<(), StoreError> {
        let previous = self.modified_count.fetch_add(1, Relaxed);
        if previous + 1 >= self.save_threshold {
            self.modified_count.store(0, Relaxed);
            self.save_inner()
        } else {
            Ok(())
        }
    }

    //Commit discipline: serialize to a sibling temp file, fsync, rename over
    //the store file. Readers of the old file are unaffected; a crash at any
    //byte offset leaves the previous store intact.
    fn save_inner(&self) -> Result<(), StoreError> {
        let io_err = |src| StoreError::Io {
            path: self.path.clone(),
            src,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let temp_file = std::fs::File::create(&temp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(temp_file);

        {
            let entries = self.entries.read();
            info!(
                target: "store_transactions",
                "saving fingerprint store at {} with {} entries",
                self.path.display(),
                entries.len()
            );
            format::write_store(&mut writer, entries.len() as u64, entries.values())
                .map_err(io_err)?;
        }

        writer.flush().map_err(io_err)?;
        let temp_file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        temp_file.sync_all().map_err(io_err)?;
        std::fs::rename(&temp_path, &self.path).map_err(io_err)?;

        Ok(())
    }
}
