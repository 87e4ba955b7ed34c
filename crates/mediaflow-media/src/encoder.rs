//! Media inspection and encoding collaborators.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::watch;

use mediaflow_models::EncodeProfile;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;
use crate::probe::{probe_media, MediaReport};
use crate::progress::FfmpegProgress;

/// Output arguments for one encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub args: Vec<String>,
}

impl From<&EncodeProfile> for EncodeOptions {
    fn from(profile: &EncodeProfile) -> Self {
        Self {
            args: profile.options.clone(),
        }
    }
}

/// Reads stream and container metadata from a local file.
#[async_trait]
pub trait MediaInspector: Send + Sync {
    async fn probe(&self, path: &Path) -> MediaResult<MediaReport>;
}

/// Encodes a local file, publishing live progress until it returns.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    async fn encode(
        &self,
        src: &Path,
        dst: &Path,
        options: &EncodeOptions,
        progress: watch::Sender<FfmpegProgress>,
    ) -> MediaResult<()>;
}

/// `ffprobe`-backed inspector.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfprobeInspector;

#[async_trait]
impl MediaInspector for FfprobeInspector {
    async fn probe(&self, path: &Path) -> MediaResult<MediaReport> {
        probe_media(path).await
    }
}

/// `ffmpeg`-backed encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegEncoder;

#[async_trait]
impl MediaEncoder for FfmpegEncoder {
    async fn encode(
        &self,
        src: &Path,
        dst: &Path,
        options: &EncodeOptions,
        progress: watch::Sender<FfmpegProgress>,
    ) -> MediaResult<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let cmd = FfmpegCommand::new(src, dst).output_args(options.args.iter().cloned());
        FfmpegRunner::new().with_progress(progress).run(&cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow_models::ProfileCatalog;

    #[test]
    fn test_options_from_profile() {
        let catalog = ProfileCatalog::builtin();
        let profile = catalog.get("720p").unwrap();
        let options = EncodeOptions::from(profile);

        assert_eq!(options.args, profile.options);
        assert!(options.args.iter().any(|a| a == "scale=-2:720"));
    }
}
