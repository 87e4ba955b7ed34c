//! FFmpeg CLI wrapper for media inspection and encoding.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:2`, published on a `watch` channel
//! - FFprobe reports with frame counts for progress percentages
//! - `MediaInspector`/`MediaEncoder` collaborator traits

pub mod command;
pub mod encoder;
pub mod error;
pub mod probe;
pub mod progress;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use encoder::{EncodeOptions, FfmpegEncoder, FfprobeInspector, MediaEncoder, MediaInspector};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_media, FormatInfo, MediaReport, StreamInfo};
pub use progress::{frame_percentage, FfmpegProgress};
