pub mod file;

use crate::record::VerificationRecord;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// Reference to an artifact that needs verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    /// Display name, e.g. an image reference or file path
    pub name: String,
    /// Digest of the artifact as `algorithm:hex`, when known
    pub digest: Option<String>,
    /// Local copy of the artifact, needed for blob signatures
    pub path: Option<PathBuf>,
}

impl ArtifactRef {
    pub fn from_path(path: &Path) -> Result<Self> {
        let digest = crate::calculate_file_digest(path)?;
        Ok(Self {
            name: path.display().to_string(),
            digest: Some(format!("sha256:{}", digest)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn from_digest(digest: &str) -> Self {
        Self {
            name: digest.to_string(),
            digest: Some(digest.to_string()),
            path: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: None,
            path: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Candidate records for one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedRecords {
    pub records: Vec<VerificationRecord>,
    /// The source already verified the records against a self-contained
    /// bundle.
    pub bundle_verified: bool,
}

impl FetchedRecords {
    pub fn new(records: Vec<VerificationRecord>) -> Self {
        Self {
            records,
            bundle_verified: false,
        }
    }
}

/// Trait for different sources of signatures and attestations
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch the candidate records for a given artifact. Transport errors are
    /// returned unchanged.
    async fn fetch_records(&self, artifact: &ArtifactRef) -> Result<FetchedRecords>;

    /// Get the source type name for logging
    fn source_type(&self) -> &'static str;
}
