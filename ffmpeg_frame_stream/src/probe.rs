//! Container probing via `ffprobe -print_format json`.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};

use serde_json::Value;

use crate::FrameStreamError;

/// What ffprobe reports about the first video stream of a container. Either
/// field may be absent in damaged or exotic files; the caller picks its
/// sampling strategy accordingly.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    /// Container duration in seconds.
    pub duration: Option<f64>,
    /// Average frame rate of the video stream.
    pub avg_fps: Option<f64>,
}

/// Whether both `ffmpeg` and `ffprobe` can be executed. Applications should
/// check this once at startup and refuse to run otherwise, so a missing
/// install does not masquerade as a library full of corrupt videos.
#[must_use]
pub fn ffmpeg_and_ffprobe_are_callable() -> bool {
    for tool in ["ffprobe", "ffmpeg"] {
        let result = Command::new(tool)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !result.map(|status| status.success()).unwrap_or(false) {
            return false;
        }
    }
    true
}

pub(crate) fn probe(path: &Path) -> Result<StreamInfo, FrameStreamError> {
    #[rustfmt::skip]
    let args = [
        OsStr::new("-v"),            OsStr::new("error"),
        OsStr::new("-show_format"),
        OsStr::new("-show_streams"),
        OsStr::new("-print_format"), OsStr::new("json"),
        path.as_os_str(),
    ];

    let output = Command::new("ffprobe")
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FrameStreamError::FfmpegNotFound,
            _ => FrameStreamError::Io(format!("{:?}", e.kind())),
        })?;

    let stdout = String::from_utf8(output.stdout)
        .map_err(|_| FrameStreamError::Probe("ffprobe output was not utf8".to_string()))?;

    parse_probe_output(&stdout)
}

pub(crate) fn parse_probe_output(json: &str) -> Result<StreamInfo, FrameStreamError> {
    let parsed: Value = serde_json::from_str(json)
        .map_err(|e| FrameStreamError::Probe(format!("ffprobe output was not json: {e}")))?;

    let streams = parsed["streams"].as_array();
    let video_stream = streams
        .and_then(|streams| {
            streams
                .iter()
                .find(|stream| stream["codec_type"] == Value::from("video"))
        })
        .ok_or(FrameStreamError::NoVideoStream)?;

    //ffprobe reports durations as strings; a missing or unparseable one just
    //means the container does not declare it
    let duration = match &parsed["format"]["duration"] {
        Value::String(d) => d.parse::<f64>().ok().filter(|d| *d > 0.0),
        _ => None,
    };

    let avg_fps = match &video_stream["avg_frame_rate"] {
        Value::String(rate) => parse_rational_fps(rate),
        _ => None,
    };

    Ok(StreamInfo { duration, avg_fps })
}

//avg_frame_rate comes as an integer fraction like "30000/1001"; "0/0" means
//ffprobe could not determine it
fn parse_rational_fps(rate: &str) -> Option<f64> {
    let (numerator, denominator) = rate.split_once('/')?;
    let numerator: f64 = numerator.trim().parse().ok()?;
    let denominator: f64 = denominator.trim().parse().ok()?;
    if numerator <= 0.0 || denominator <= 0.0 {
        return None;
    }
    Some(numerator / denominator)
}
