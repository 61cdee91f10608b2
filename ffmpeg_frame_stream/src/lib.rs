#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::unwrap_used)]

//! Frame extraction for video deduplication, implemented by calling `ffmpeg`
//! and `ffprobe` on the command line.
//!
//! Ffmpeg must be installed and visible on the command line. This crate
//! deliberately shells out rather than linking: there are no well-maintained
//! leak-free bindings, and statically linking ffmpeg would put transitive
//! licensing requirements on downstream users.
//!
//! The input is a byte stream of unknown seekability, and both ffprobe and
//! ffmpeg need to read the container from the start, so the stream is first
//! spooled to a temporary file. Decoded frames come back on ffmpeg's stdout
//! as raw gray planes at a canonical square size, one frame per second of
//! video time by default.

use thiserror::Error;

mod frame_iter;
mod probe;

pub use frame_iter::{open_stream, FrameStream, FrameStreamCfg};
pub use probe::{ffmpeg_and_ffprobe_are_callable, StreamInfo};

/// Ways the extraction of frames from a byte stream can fail.
#[derive(Error, Debug, Clone)]
pub enum FrameStreamError {
    /// ffmpeg/ffprobe was not found. Make sure ffmpeg is installed and
    /// visible on the command line.
    #[error("ffmpeg/ffprobe not found; install ffmpeg and make sure it is on the PATH")]
    FfmpegNotFound,

    /// An io error while spooling the input or talking to a child process.
    #[error("ffmpeg io error: {0}")]
    Io(String),

    /// ffprobe ran but its output could not be interpreted.
    #[error("could not probe video stream: {0}")]
    Probe(String),

    /// The container holds no video stream at all.
    #[error("no video stream in container")]
    NoVideoStream,

    /// The decoder produced no usable frame.
    #[error("corrupt video stream: {0}")]
    CorruptStream(String),
}
