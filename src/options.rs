//! Options for a verification run.

use crate::identity::Identity;
use crate::policy::PredicateSelector;
use crate::trust::resolver::{EnvOverrides, TrustConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Attestation mode: which predicate type to extract and which policies to
/// apply to the matches.
#[derive(Debug, Clone, Default)]
pub struct AttestationOptions {
    pub predicate_type: PredicateSelector,
    pub policies: Vec<PathBuf>,
}

impl AttestationOptions {
    pub fn new(predicate_type: &str) -> Self {
        Self {
            predicate_type: PredicateSelector::parse(predicate_type),
            policies: Vec::new(),
        }
    }

    pub fn with_policy(mut self, path: impl Into<PathBuf>) -> Self {
        self.policies.push(path.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub trust: TrustConfig,
    /// Accepted signer identities; empty accepts any valid identity.
    pub identities: Vec<Identity>,
    /// Detached SCT file, used instead of the SCT embedded in the certificate.
    pub sct_ref: Option<PathBuf>,
    /// Transparency log for lookups; the public instance when unset.
    pub rekor_url: Option<String>,
    /// Artifacts verified concurrently.
    pub max_workers: usize,
    /// Deadline for the whole run.
    pub timeout: Option<Duration>,
    /// Keep records whose transparency log check failed.
    pub continue_on_tlog_error: bool,
    /// Require the signed payload to make claims about the artifact digest.
    pub check_claims: bool,
    pub attestation: Option<AttestationOptions>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            trust: TrustConfig::default(),
            identities: Vec::new(),
            sct_ref: None,
            rekor_url: None,
            max_workers: DEFAULT_MAX_WORKERS,
            timeout: None,
            continue_on_tlog_error: false,
            check_claims: true,
            attestation: None,
        }
    }
}

impl VerifyOptions {
    pub fn with_key(mut self, path: impl AsRef<Path>) -> Self {
        self.trust.key_ref = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_hardware_key(mut self, slot: Option<&str>) -> Self {
        self.trust.hardware_key = true;
        self.trust.hardware_slot = slot.map(str::to_string);
        self
    }

    pub fn with_certificate(mut self, path: impl AsRef<Path>) -> Self {
        self.trust.cert_ref = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_certificate_chain(mut self, path: impl AsRef<Path>) -> Self {
        self.trust.cert_chain = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_ca_roots(mut self, path: impl AsRef<Path>) -> Self {
        self.trust.ca_roots = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_ca_intermediates(mut self, path: impl AsRef<Path>) -> Self {
        self.trust.ca_intermediates = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_trusted_root(mut self, path: impl AsRef<Path>) -> Self {
        self.trust.trusted_root = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_tsa_certificate_chain(mut self, path: impl AsRef<Path>) -> Self {
        self.trust.tsa_cert_chain = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_sct(mut self, path: impl AsRef<Path>) -> Self {
        self.sct_ref = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn with_rekor_url(mut self, url: impl Into<String>) -> Self {
        self.rekor_url = Some(url.into());
        self
    }

    pub fn with_env(mut self, env: EnvOverrides) -> Self {
        self.trust.env = env;
        self
    }

    pub fn ignore_tlog(mut self) -> Self {
        self.trust.ignore_tlog = true;
        self
    }

    pub fn ignore_sct(mut self) -> Self {
        self.trust.ignore_sct = true;
        self
    }

    pub fn offline(mut self) -> Self {
        self.trust.offline = true;
        self
    }

    pub fn new_bundle_format(mut self) -> Self {
        self.trust.new_bundle_format = true;
        self
    }

    pub fn use_signed_timestamps(mut self) -> Self {
        self.trust.use_signed_timestamps = true;
        self
    }

    pub fn continue_on_tlog_error(mut self) -> Self {
        self.continue_on_tlog_error = true;
        self
    }

    pub fn skip_claims(mut self) -> Self {
        self.check_claims = false;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attestations(mut self, attestation: AttestationOptions) -> Self {
        self.attestation = Some(attestation);
        self
    }

    /// Log lookups are only attempted online, outside the new bundle format.
    pub fn allows_tlog_lookup(&self) -> bool {
        !self.trust.offline && !self.trust.new_bundle_format
    }
}
