//! Encode profiles.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Default video codec (H.264)
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
/// Default audio codec
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default encoding preset
pub const DEFAULT_PRESET: &str = "medium";
/// Default audio bitrate
pub const DEFAULT_AUDIO_BITRATE: &str = "128k";

/// A named encode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeProfile {
    /// Profile name referenced by jobs (e.g. "720p")
    pub profile: String,
    /// Suffix appended to the job id for the output file (e.g. "_720p.mp4")
    pub output: String,
    /// Whether the rendition is published downstream
    #[serde(default)]
    pub publish: bool,
    /// FFmpeg output arguments
    #[serde(default)]
    pub options: Vec<String>,
}

impl EncodeProfile {
    /// H.264/AAC MP4 rendition scaled to `height` lines.
    fn h264(height: u32, crf: u8) -> Self {
        Self {
            profile: format!("{}p", height),
            output: format!("_{}p.mp4", height),
            publish: true,
            options: vec![
                "-c:v".to_string(),
                DEFAULT_VIDEO_CODEC.to_string(),
                "-preset".to_string(),
                DEFAULT_PRESET.to_string(),
                "-crf".to_string(),
                crf.to_string(),
                "-vf".to_string(),
                format!("scale=-2:{}", height),
                "-c:a".to_string(),
                DEFAULT_AUDIO_CODEC.to_string(),
                "-b:a".to_string(),
                DEFAULT_AUDIO_BITRATE.to_string(),
                "-movflags".to_string(),
                "+faststart".to_string(),
            ],
        }
    }
}

/// Lookup table of encode profiles by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileCatalog {
    profiles: HashMap<String, EncodeProfile>,
}

impl Default for ProfileCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileCatalog {
    /// Catalog from a list of profiles. Later duplicates win.
    pub fn new(profiles: Vec<EncodeProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.profile.clone(), p))
                .collect(),
        }
    }

    /// Built-in H.264 ladder.
    pub fn builtin() -> Self {
        Self::new(vec![
            EncodeProfile::h264(480, 23),
            EncodeProfile::h264(720, 21),
            EncodeProfile::h264(1080, 20),
        ])
    }

    /// Parse a JSON array of profiles.
    pub fn from_json(raw: &str) -> ModelResult<Self> {
        let profiles: Vec<EncodeProfile> =
            serde_json::from_str(raw).map_err(|e| ModelError::InvalidProfiles(e.to_string()))?;

        if let Some(bad) = profiles.iter().find(|p| p.profile.is_empty() || p.output.is_empty()) {
            return Err(ModelError::InvalidProfiles(format!(
                "profile entries need a name and output suffix: {:?}",
                bad
            )));
        }

        Ok(Self::new(profiles))
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> ModelResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ModelError::InvalidProfiles(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn get(&self, name: &str) -> Option<&EncodeProfile> {
        self.profiles.get(name)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = ProfileCatalog::builtin();
        let p = catalog.get("720p").unwrap();
        assert_eq!(p.output, "_720p.mp4");
        assert!(p.options.contains(&"scale=-2:720".to_string()));
        assert!(catalog.get("4k").is_none());
    }

    #[test]
    fn test_from_json() {
        let raw = r#"[{"profile":"h264_baseline_360p_600","output":"_360.mp4","publish":false,"options":["-c:v","libx264","-profile:v","baseline"]}]"#;
        let catalog = ProfileCatalog::from_json(raw).unwrap();
        assert_eq!(catalog.len(), 1);
        let p = catalog.get("h264_baseline_360p_600").unwrap();
        assert!(!p.publish);
        assert_eq!(p.options.len(), 4);
    }

    #[test]
    fn test_from_json_rejects_missing_output() {
        let raw = r#"[{"profile":"x","output":""}]"#;
        assert!(ProfileCatalog::from_json(raw).is_err());
        assert!(ProfileCatalog::from_json("not json").is_err());
    }
}
