//! The seam between the core and the media-management service that owns the
//! files. The pipeline only ever talks to the host through these traits.

use std::fmt;
use std::io::Read;

use thiserror::Error;

/// An opaque identifier the host service uses for one media file, typically a
/// 32-byte content hash. Ordering is lexicographic over the raw bytes and is
/// used to canonicalize pair events.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaId(Box<[u8]>);

impl MediaId {
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

//media ids show up in logs a lot; the derive's byte-list form is unreadable
impl fmt::Debug for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MediaId({self})")
    }
}

/// An error returned by the host service.
///
/// Transient errors (timeouts, gateway failures) are retried with backoff;
/// permanent errors (missing file, bad auth) skip the file without marking it
/// failed, since the file may reappear on a later run.
#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("transient host error: {0}")]
    Transient(String),

    #[error("permanent host error: {0}")]
    Permanent(String),
}

/// Read-side host operations consumed by the pipeline.
pub trait HostClient: Send + Sync {
    /// All media ids matching the query terms. Terms are passed to the host
    /// verbatim.
    fn list_media(&self, query: &[String]) -> Result<Vec<MediaId>, HostError>;

    /// A streaming reader over the raw bytes of one file.
    fn fetch_bytes(&self, media_id: &MediaId) -> Result<Box<dyn Read + Send>, HostError>;
}

/// The sink for discovered duplicate pairs. Reporting the same pair twice is
/// a no-op at the host, so emission only has to be at-least-once.
pub trait PairReporter: Send + Sync {
    fn report_potential_duplicate(
        &self,
        a: &MediaId,
        b: &MediaId,
        score: f64,
    ) -> Result<(), HostError>;
}

#[cfg(test)]
mod test {
    use super::MediaId;

    #[test]
    fn display_is_lowercase_hex() {
        let id = MediaId::from_bytes(vec![0xde, 0xad, 0x00, 0x5a]);
        assert_eq!(id.to_string(), "dead005a");
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = MediaId::from_bytes(vec![0x00, 0xff]);
        let b = MediaId::from_bytes(vec![0x01]);
        assert!(a < b);
    }
}
