//! Wires the ffmpeg frame extractor to the core's vPDQ hasher.

use std::io::Read;

use ffmpeg_frame_stream::{open_stream, FrameStreamCfg, FrameStreamError};
use vid_dedup_lib::{
    FingerprintBuilder, HashCreationError, PdqHasher, VideoFingerprint,
};

/// The production [`FingerprintBuilder`]: decodes through ffmpeg at one frame
/// per second and hashes each frame with PDQ. One instance per worker; the
/// DCT plan inside the hasher is reused across videos.
#[derive(Clone, Default)]
pub struct VpdqBuilder {
    hasher: PdqHasher,
    stream_cfg: FrameStreamCfg,
}

impl FingerprintBuilder for VpdqBuilder {
    fn fingerprint(
        &self,
        media: Box<dyn Read + Send>,
    ) -> Result<VideoFingerprint, HashCreationError> {
        let frames = open_stream(media, &self.stream_cfg).map_err(|e| match e {
            FrameStreamError::NoVideoStream | FrameStreamError::Probe(_) => {
                HashCreationError::Decode(e.to_string())
            }
            FrameStreamError::CorruptStream(detail) => HashCreationError::CorruptStream(detail),
            other => HashCreationError::Decode(other.to_string()),
        })?;

        VideoFingerprint::from_frames_with(
            &self.hasher,
            frames.map(|item| item.map_err(|e| e.to_string())),
        )
    }
}
