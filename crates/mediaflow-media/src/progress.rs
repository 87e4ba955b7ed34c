//! FFmpeg progress parsing.

use serde::{Deserialize, Serialize};

/// Progress information from FFmpeg.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Frames written so far
    pub frame: u64,
    /// Current FPS
    pub fps: f64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Output time as string (HH:MM:SS.microseconds)
    pub out_time: String,
    /// Encoding speed (e.g., 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Whether FFmpeg reported `progress=end`
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Percentage of `total_frames` written, rounded to two decimals and
    /// clamped to `[0, 100]`.
    ///
    /// Returns `None` when the total is unknown or zero.
    pub fn frame_percentage(&self, total_frames: Option<u64>) -> Option<f64> {
        frame_percentage(self.frame, total_frames)
    }
}

/// `round(frame / total * 100, 2)` clamped to `[0, 100]`.
pub fn frame_percentage(frame: u64, total_frames: Option<u64>) -> Option<f64> {
    let total = total_frames.filter(|t| *t > 0)?;
    let pct = (frame as f64 / total as f64 * 10_000.0).round() / 100.0;
    Some(pct.clamp(0.0, 100.0))
}

/// Fold one line of `-progress` output into `current`.
///
/// Returns a snapshot at the end of each progress block.
pub(crate) fn parse_progress_line(
    line: &str,
    current: &mut FfmpegProgress,
) -> Option<FfmpegProgress> {
    let (key, value) = line.trim().split_once('=')?;

    match key {
        "out_time_ms" | "out_time_us" => {
            // FFmpeg reports microseconds under both keys
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "out_time" => current.out_time = value.to_string(),
        "frame" => {
            if let Ok(frame) = value.parse() {
                current.frame = frame;
            }
        }
        "fps" => {
            if let Ok(fps) = value.parse() {
                current.fps = fps;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            if value == "end" {
                current.is_complete = true;
            }
            return Some(current.clone());
        }
        _ => {}
    }

    None
}

/// Whether a stderr line belongs to the `-progress` key/value stream.
pub(crate) fn is_progress_line(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'),
        None => false,
    }
}
