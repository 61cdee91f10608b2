//! The lazy frame iterator: one ffmpeg child process per video, raw gray
//! frames read from its stdout.

use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use image::GrayImage;
use log::warn;
use tempfile::NamedTempFile;

use crate::probe::{probe, StreamInfo};
use crate::FrameStreamError;

/// Extraction tuning. The defaults (one frame per second of video time at
/// 512x512) are what the PDQ frame hasher expects.
#[derive(Clone, Copy, Debug)]
pub struct FrameStreamCfg {
    /// Sampling rate in frames per second of video time.
    pub sample_fps: f64,
    /// Side length of the emitted square luminance plane.
    pub frame_side: u32,
}

impl Default for FrameStreamCfg {
    fn default() -> Self {
        Self {
            sample_fps: 1.0,
            frame_side: 512,
        }
    }
}

//How frames are being selected from the decoder output.
#[derive(Clone, Copy, Debug)]
enum SampleMode {
    //the container declares a duration: ffmpeg's fps filter picks the frame
    //nearest each sample instant
    FpsFilter { fps: f64 },
    //no declared duration: decode everything and keep every step-th frame
    ByIndex { step: u64, native_fps: f64 },
}

/// Spool `bytes` to a temp file, probe it, and start decoding.
///
/// The returned stream is single-pass and not restartable; to read the video
/// again, call this function again with a fresh byte source.
///
/// # Errors
/// [`FrameStreamError::NoVideoStream`] for audio-only or non-media input,
/// probe/io errors otherwise. Decoder failures surface as items of the
/// iterator, not here.
pub fn open_stream(
    mut bytes: impl Read,
    cfg: &FrameStreamCfg,
) -> Result<FrameStream, FrameStreamError> {
    let mut spool = NamedTempFile::new().map_err(|e| FrameStreamError::Io(e.to_string()))?;
    std::io::copy(&mut bytes, spool.as_file_mut())
        .map_err(|e| FrameStreamError::Io(e.to_string()))?;
    spool
        .as_file_mut()
        .flush()
        .map_err(|e| FrameStreamError::Io(e.to_string()))?;

    let info = probe(spool.path())?;
    let mode = select_sample_mode(&info, cfg.sample_fps);

    let args = ffmpeg_args(spool.path().as_os_str(), &mode, cfg.frame_side);
    let mut child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FrameStreamError::FfmpegNotFound,
            _ => FrameStreamError::Io(format!("{:?}", e.kind())),
        })?;

    //if ffmpeg dies instantly the iterator reports it on the first frame
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FrameStreamError::Io("no stdout from ffmpeg".to_string()))?;

    Ok(FrameStream {
        child,
        stdout,
        side: cfg.frame_side,
        mode,
        emitted: 0,
        raw_index: 0,
        finished: false,
        _spool: spool,
    })
}

fn select_sample_mode(info: &StreamInfo, sample_fps: f64) -> SampleMode {
    if info.duration.is_some() {
        SampleMode::FpsFilter { fps: sample_fps }
    } else {
        let native_fps = info.avg_fps.unwrap_or(25.0);
        let step = ((native_fps / sample_fps).round() as u64).max(1);
        SampleMode::ByIndex { step, native_fps }
    }
}

fn ffmpeg_args(input: &OsStr, mode: &SampleMode, side: u32) -> Vec<OsString> {
    let filter = match mode {
        SampleMode::FpsFilter { fps } => {
            format!("fps={fps},scale={side}:{side}:flags=area")
        }
        SampleMode::ByIndex { .. } => format!("scale={side}:{side}:flags=area"),
    };

    #[rustfmt::skip]
    let args: Vec<OsString> = vec![
        OsString::from("-hide_banner"),
        OsString::from("-loglevel"), OsString::from("warning"),
        OsString::from("-nostats"),
        OsString::from("-threads"),  OsString::from("1"),
        OsString::from("-i"),        input.to_os_string(),
        OsString::from("-vf"),       OsString::from(filter),
        OsString::from("-pix_fmt"),  OsString::from("gray"),
        OsString::from("-c:v"),      OsString::from("rawvideo"),
        OsString::from("-f"),        OsString::from("image2pipe"),
        OsString::from("-"),
    ];
    args
}

/// A lazy, single-pass sequence of `(timestamp_seconds, luminance_plane)`.
///
/// The sequence is finite: it ends at end of stream, or early if the decoder
/// fails mid-video (the already-emitted prefix remains usable). The spooled
/// temp file lives exactly as long as this value.
pub struct FrameStream {
    child: Child,
    stdout: std::process::ChildStdout,
    side: u32,
    mode: SampleMode,
    emitted: u64,
    raw_index: u64,
    finished: bool,
    _spool: NamedTempFile,
}

impl FrameStream {
    //Read one raw frame. Ok(None) is clean end of stream; a partial frame is
    //distinguished from EOF so truncation can be reported.
    fn read_raw_frame(&mut self) -> Result<Option<Vec<u8>>, String> {
        let frame_len = self.side as usize * self.side as usize;
        let mut buf = vec![0u8; frame_len];
        let mut filled = 0usize;

        while filled < frame_len {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(format!("stream truncated mid-frame at byte {filled}")),
                Ok(n) => filled += n,
                Err(e) => return Err(format!("read error from decoder: {e}")),
            }
        }
        Ok(Some(buf))
    }

    fn reap(&mut self) {
        self.finished = true;
        let _kill_error = self.child.kill();
        let _wait_error = self.child.wait();
    }
}

impl Iterator for FrameStream {
    type Item = Result<(f64, GrayImage), FrameStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let raw = match self.read_raw_frame() {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    let first = self.emitted == 0;
                    self.reap();
                    //no frames at all means the decoder failed on the very
                    //first frame; a mid-stream end is a normal finish
                    return first.then(|| {
                        Err(FrameStreamError::CorruptStream(
                            "decoder produced no frames".to_string(),
                        ))
                    });
                }
                Err(detail) => {
                    let first = self.emitted == 0;
                    self.reap();
                    if first {
                        return Some(Err(FrameStreamError::CorruptStream(detail)));
                    }
                    warn!("decoder error mid-stream, stopping extraction: {detail}");
                    return None;
                }
            };

            let keep = match self.mode {
                SampleMode::FpsFilter { .. } => true,
                SampleMode::ByIndex { step, .. } => self.raw_index % step == 0,
            };
            let timestamp = match self.mode {
                SampleMode::FpsFilter { fps } => self.emitted as f64 / fps,
                SampleMode::ByIndex { native_fps, .. } => self.raw_index as f64 / native_fps,
            };
            self.raw_index += 1;
            if !keep {
                continue;
            }

            let Some(frame) = GrayImage::from_raw(self.side, self.side, raw) else {
                self.reap();
                return Some(Err(FrameStreamError::CorruptStream(
                    "frame buffer had the wrong size".to_string(),
                )));
            };
            self.emitted += 1;
            return Some(Ok((timestamp, frame)));
        }
    }
}

//reap the child so no zombie processes accumulate when a stream is dropped
//part-way through
impl Drop for FrameStream {
    fn drop(&mut self) {
        let _kill_error = self.child.kill();
        let _wait_error = self.child.wait();
    }
}
