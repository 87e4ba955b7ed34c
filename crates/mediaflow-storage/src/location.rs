//! Storage locators.

use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::error::{StorageError, StorageResult};

/// Where a source or destination lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// `s3://bucket/key`
    S3 { bucket: String, key: String },
    /// `gs://bucket/key`
    Gcs { bucket: String, key: String },
    /// Plain filesystem path or `file://` URI
    Local(PathBuf),
}

impl StorageLocation {
    /// Parse a locator.
    ///
    /// Strings without a scheme are treated as local paths.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StorageError::invalid_location("empty locator"));
        }
        if !raw.contains("://") {
            return Ok(Self::Local(PathBuf::from(raw)));
        }

        let url = Url::parse(raw)
            .map_err(|e| StorageError::invalid_location(format!("{}: {}", raw, e)))?;

        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(Self::Local)
                .map_err(|_| StorageError::invalid_location(raw)),
            scheme @ ("s3" | "gs") => {
                let bucket = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| StorageError::invalid_location(format!("{}: missing bucket", raw)))?
                    .to_string();
                let key = url.path().trim_start_matches('/').to_string();
                if key.is_empty() {
                    return Err(StorageError::invalid_location(format!(
                        "{}: missing object key",
                        raw
                    )));
                }
                Ok(if scheme == "s3" {
                    Self::S3 { bucket, key }
                } else {
                    Self::Gcs { bucket, key }
                })
            }
            other => Err(StorageError::invalid_location(format!(
                "{}: unsupported scheme '{}'",
                raw, other
            ))),
        }
    }

    /// Backend label used in logs and metrics.
    pub fn backend(&self) -> &'static str {
        match self {
            Self::S3 { .. } => "s3",
            Self::Gcs { .. } => "gcs",
            Self::Local(_) => "local",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local(_))
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3 { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
            Self::Gcs { bucket, key } => write!(f, "gs://{}/{}", bucket, key),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote() {
        assert_eq!(
            StorageLocation::parse("gs://in/a.mov").unwrap(),
            StorageLocation::Gcs {
                bucket: "in".into(),
                key: "a.mov".into()
            }
        );
        assert_eq!(
            StorageLocation::parse("s3://media-out/renditions/a_720p.mp4").unwrap(),
            StorageLocation::S3 {
                bucket: "media-out".into(),
                key: "renditions/a_720p.mp4".into()
            }
        );
    }

    #[test]
    fn test_parse_local() {
        assert_eq!(
            StorageLocation::parse("/mpc/src/abc").unwrap(),
            StorageLocation::Local(PathBuf::from("/mpc/src/abc"))
        );
        assert_eq!(
            StorageLocation::parse("file:///mpc/dst/abc.mp4").unwrap(),
            StorageLocation::Local(PathBuf::from("/mpc/dst/abc.mp4"))
        );
    }

    #[test]
    fn test_parse_rejects() {
        assert!(StorageLocation::parse("").is_err());
        assert!(StorageLocation::parse("gs://bucket-only").is_err());
        assert!(StorageLocation::parse("ftp://host/file").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["gs://in/a.mov", "s3://out/dir/b.mp4"] {
            assert_eq!(StorageLocation::parse(raw).unwrap().to_string(), raw);
        }
    }
}
