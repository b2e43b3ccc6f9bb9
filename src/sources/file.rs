use crate::bundle::parse_records;
use crate::sources::{ArtifactRef, ArtifactSource, FetchedRecords};
use crate::Result;
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use tokio::fs;

/// File-based source for signatures stored next to the artifact: cosign
/// bundles, sigstore bundles or DSSE envelopes, one document or JSON lines.
pub struct FileSource {
    /// Path to the signature file or bundle
    signature_path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            signature_path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ArtifactSource for FileSource {
    async fn fetch_records(&self, artifact: &ArtifactRef) -> Result<FetchedRecords> {
        let content = fs::read_to_string(&self.signature_path).await?;

        // Blob signatures need the artifact bytes as their payload.
        let artifact_bytes = match &artifact.path {
            Some(path) => Some(fs::read(path).await?),
            None => None,
        };

        let records = parse_records(&content, artifact_bytes.as_deref())?;
        debug!(
            "Loaded {} records from {}",
            records.len(),
            self.signature_path.display()
        );

        Ok(FetchedRecords::new(records))
    }

    fn source_type(&self) -> &'static str {
        "File"
    }
}
