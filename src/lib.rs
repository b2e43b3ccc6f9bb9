use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod bundle;
pub mod control;
pub mod identity;
pub mod keys;
pub mod options;
pub mod policy;
pub mod record;
pub mod rekor;
pub mod sources;
pub mod trust;
pub mod verifiers;
pub mod verify;

// Re-export commonly used types
pub use control::RunControl;
pub use identity::{CertificateIdentity, Identity, Matcher, WorkflowClaims};
pub use keys::{KeyHandle, KeyProvider, PublicKey, SignatureVerifier};
pub use options::{AttestationOptions, VerifyOptions};
pub use policy::{PolicyEngine, PolicyResult, PredicateSelector, ValidationErrors};
pub use record::{BundleMaterial, InclusionProof, SignedPayload, TlogEntry, VerificationRecord};
pub use sources::{ArtifactRef, ArtifactSource, FetchedRecords};
pub use trust::resolver::{EnvOverrides, TrustConfig};
pub use trust::root::{MetadataClient, OfflineMetadataClient, SigstoreTufClient};
pub use trust::{TrustAnchor, TrustContext};
pub use verifiers::timestamp::{TimestampAuthority, TimestampToken};
pub use verifiers::tlog::TransparencyLogClient;
pub use verify::{ArtifactOutcome, Collaborators, RunReport, Verdict, Verifier};

#[derive(Debug, Error)]
pub enum VerifyError {
    /// Invalid combination of options, detected before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported option --{option}: {reason}")]
    UnsupportedOption { option: &'static str, reason: String },

    #[error("Trusted root is required when using the new bundle format")]
    MissingTrustRoot,

    #[error("Invalid policy format for {}, expected .cue or .rego", .0.display())]
    PolicyFormat(PathBuf),

    #[error("Failed to load key: {0}")]
    KeyParse(String),

    /// Trust material could not be fetched; callers degrade instead of failing.
    #[error("Trust resolution failed: {0}")]
    TrustResolution(String),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("Certificate validation failed: {0}")]
    CertificateValidation(String),

    #[error("No configured identity matched the certificate ({found})")]
    IdentityMismatch { found: String },

    #[error("Transparency log verification failed: {0}")]
    TlogVerification(String),

    #[error("Timestamp verification failed: {0}")]
    TimestampVerification(String),

    #[error("Claim verification failed: {0}")]
    ClaimVerification(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Policy {} rejected record {record}: {}", policy.display(), messages.join("; "))]
    PolicyValidation {
        policy: PathBuf,
        record: usize,
        messages: Vec<String>,
    },

    #[error("None of the attestations matched the predicate type {requested}, found: {}", observed.join(", "))]
    PredicateTypeMismatch {
        requested: String,
        observed: Vec<String>,
    },

    #[error("No signatures were verified for {reference}")]
    NoVerifiedRecords { reference: String },

    #[error("Timed out while {0}")]
    Timeout(String),

    #[error("Verification cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Verification task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VerifyError {
    /// Errors that exclude a single record while the rest of the artifact
    /// continues to be verified.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            VerifyError::Signature(_)
                | VerifyError::CertificateValidation(_)
                | VerifyError::IdentityMismatch { .. }
                | VerifyError::TlogVerification(_)
                | VerifyError::TimestampVerification(_)
                | VerifyError::ClaimVerification(_)
                | VerifyError::InvalidRecord(_)
        )
    }

    /// Errors raised from option validation, before anything is fetched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            VerifyError::Configuration(_)
                | VerifyError::UnsupportedOption { .. }
                | VerifyError::MissingTrustRoot
                | VerifyError::PolicyFormat(_)
                | VerifyError::KeyParse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VerifyError>;

/// Verify a blob signature (cosign `sign-blob` output or a sigstore bundle)
/// against a public key. Log keys come from `SIGSTORE_REKOR_PUBLIC_KEY` or the
/// public trusted root; entries missing from the file are looked up online.
pub async fn verify_blob_with_key(
    artifact_path: &Path,
    sig_or_bundle_path: &Path,
    public_key_path: &Path,
) -> Result<bool> {
    let source = sources::file::FileSource::new(sig_or_bundle_path);
    let options = VerifyOptions::default()
        .with_key(public_key_path)
        .with_env(EnvOverrides::from_env());
    let collaborators = Collaborators::new(Arc::new(source), Arc::new(SigstoreTufClient::new()));
    let verifier = Verifier::new(options, collaborators).await?;

    let artifact = ArtifactRef::from_path(artifact_path)?;
    let verdict = verifier.verify_artifact(&artifact).await?;

    Ok(verdict.passed())
}

pub fn calculate_file_digest(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    use std::fs::File;
    use std::io::Read;

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
