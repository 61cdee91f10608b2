//! The on-disk layout of the fingerprint store. This is a versioned wire
//! format, stable across releases:
//!
//! ```text
//! magic(8B) | version(u32) | entry_count(u64)
//! entry: media_id_len(u16) | media_id | flags(u8) | frame_count(u32)
//!        | (frame_hash(32B) | quality(u8) | timestamp(f32)) * frame_count
//! ```
//!
//! All integers are little-endian. Readers that meet an unknown version must
//! refuse to proceed rather than guess at a migration.

use std::io::{self, Read, Write};
use std::path::Path;

use crate::definitions::PDQ_HASH_BYTES;
use crate::host::MediaId;
use crate::pdq::PdqHash;
use crate::vpdq::{FrameRecord, VideoFingerprint};

use super::{EntryFlags, StoreEntry, StoreError};

pub(super) const STORE_MAGIC: [u8; 8] = *b"HVDFPRNT";
pub(super) const STORE_VERSION: u32 = 1;

//Ceiling on frames per entry when reading. A week-long video at one frame
//per second stays well under this; anything larger is corruption.
const MAX_FRAME_COUNT: u32 = 1 << 24;
const MAX_MEDIA_ID_LEN: u16 = 1024;

pub(super) fn write_store<'a, W, I>(writer: &mut W, count: u64, entries: I) -> io::Result<()>
where
    W: Write,
    I: Iterator<Item = &'a StoreEntry>,
{
    writer.write_all(&STORE_MAGIC)?;
    writer.write_all(&STORE_VERSION.to_le_bytes())?;
    writer.write_all(&count.to_le_bytes())?;

    for entry in entries {
        write_entry(writer, entry)?;
    }
    Ok(())
}

fn write_entry<W: Write>(writer: &mut W, entry: &StoreEntry) -> io::Result<()> {
    let id = entry.media_id.as_bytes();
    debug_assert!(id.len() <= usize::from(MAX_MEDIA_ID_LEN));
    writer.write_all(&(id.len() as u16).to_le_bytes())?;
    writer.write_all(id)?;
    writer.write_all(&[entry.flags.to_byte()])?;

    match &entry.fingerprint {
        None => writer.write_all(&0u32.to_le_bytes())?,
        Some(fingerprint) => {
            writer.write_all(&(fingerprint.len() as u32).to_le_bytes())?;
            for record in fingerprint.records() {
                writer.write_all(record.hash.as_bytes())?;
                writer.write_all(&[record.quality])?;
                writer.write_all(&record.timestamp.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

pub(super) fn read_store<R: Read>(reader: &mut R, path: &Path) -> Result<Vec<StoreEntry>, StoreError> {
    let corrupt = |detail: &str| StoreError::Corrupt {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };

    let mut magic = [0u8; 8];
    read_exact(reader, &mut magic, path, "file header")?;
    if magic != STORE_MAGIC {
        return Err(corrupt("bad magic; not a fingerprint store"));
    }

    let version = read_u32(reader, path, "schema version")?;
    if version != STORE_VERSION {
        return Err(StoreError::VersionMismatch {
            path: path.to_path_buf(),
            found: version,
            expected: STORE_VERSION,
        });
    }

    let count = read_u64(reader, path, "entry count")?;
    let mut entries = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        entries.push(read_entry(reader, path)?);
    }
    Ok(entries)
}

fn read_entry<R: Read>(reader: &mut R, path: &Path) -> Result<StoreEntry, StoreError> {
    let corrupt = |detail: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        detail,
    };

    let id_len = read_u16(reader, path, "media id length")?;
    if id_len == 0 || id_len > MAX_MEDIA_ID_LEN {
        return Err(corrupt(format!("implausible media id length {id_len}")));
    }
    let mut id = vec![0u8; usize::from(id_len)];
    read_exact(reader, &mut id, path, "media id")?;

    let mut flags = [0u8; 1];
    read_exact(reader, &mut flags, path, "entry flags")?;
    let flags = EntryFlags::from_byte(flags[0]);

    let frame_count = read_u32(reader, path, "frame count")?;
    if frame_count > MAX_FRAME_COUNT {
        return Err(corrupt(format!("implausible frame count {frame_count}")));
    }

    let fingerprint = if frame_count == 0 {
        None
    } else {
        let mut records = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            let mut hash = [0u8; PDQ_HASH_BYTES];
            read_exact(reader, &mut hash, path, "frame hash")?;
            let mut quality = [0u8; 1];
            read_exact(reader, &mut quality, path, "frame quality")?;
            let mut timestamp = [0u8; 4];
            read_exact(reader, &mut timestamp, path, "frame timestamp")?;
            records.push(FrameRecord {
                hash: PdqHash::from_bytes(hash),
                quality: quality[0],
                timestamp: f32::from_le_bytes(timestamp),
            });
        }
        Some(VideoFingerprint::from_records(records))
    };

    Ok(StoreEntry::from_disk(
        MediaId::from_bytes(id),
        fingerprint,
        flags,
    ))
}

//Short reads are corruption, not EOF: entry boundaries are derived from the
//declared counts, so running out of bytes means a torn file.
fn read_exact<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    path: &Path,
    what: &str,
) -> Result<(), StoreError> {
    reader.read_exact(buf).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("truncated while reading {what}: {e}"),
    })
}

fn read_u16<R: Read>(reader: &mut R, path: &Path, what: &str) -> Result<u16, StoreError> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf, path, what)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R, path: &Path, what: &str) -> Result<u32, StoreError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, path, what)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R, path: &Path, what: &str) -> Result<u64, StoreError> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, path, what)?;
    Ok(u64::from_le_bytes(buf))
}
