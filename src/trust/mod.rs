//! Resolved trust material for a verification run.

pub mod resolver;
pub mod root;

use crate::keys::PublicKey;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Key id (hex SHA-256 of the DER SubjectPublicKeyInfo) to DER key.
pub type KeyMap = BTreeMap<String, Vec<u8>>;

/// Where a piece of trust material came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialSource {
    ExplicitFile(PathBuf),
    Environment {
        variable: &'static str,
        path: PathBuf,
    },
    TrustedRoot(TrustRootOrigin),
    Fetched,
    /// Supplied programmatically through the [`TrustContext`] builders.
    Caller,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustRootOrigin {
    File(PathBuf),
    Online,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustRootState {
    Loaded(TrustRootOrigin),
    /// A fetch was attempted and failed.
    Unavailable(String),
    /// Every needed component had its own source, or the run is offline.
    NotRequested,
}

/// Timestamp authority certificates: signing leaf, intermediates and roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TsaCertificates {
    pub leaf: Option<Vec<u8>>,
    pub intermediates: Vec<Vec<u8>>,
    pub roots: Vec<Vec<u8>>,
}

impl TsaCertificates {
    /// Split a chain ordered leaf first, root last.
    pub fn from_chain(mut chain: Vec<Vec<u8>>) -> Self {
        let Some(root) = chain.pop() else {
            return Self::default();
        };
        if chain.is_empty() {
            return Self {
                leaf: None,
                intermediates: Vec::new(),
                roots: vec![root],
            };
        }
        let leaf = chain.remove(0);
        Self {
            leaf: Some(leaf),
            intermediates: chain,
            roots: vec![root],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum TrustAnchor {
    ExplicitKey(PublicKey),
    HardwareKey { slot: Option<String> },
    ExplicitCertificate { certificate: Vec<u8> },
    ExplicitCertificateWithChain {
        certificate: Vec<u8>,
        chain: Vec<Vec<u8>>,
    },
    CertificateAuthorityRoots,
    DistributedTrustRoot,
}

impl TrustAnchor {
    /// Certificate anchors go through chain, SCT and identity checks.
    pub fn is_certificate_based(&self) -> bool {
        match self {
            TrustAnchor::ExplicitKey(_) | TrustAnchor::HardwareKey { .. } => false,
            TrustAnchor::ExplicitCertificate { .. }
            | TrustAnchor::ExplicitCertificateWithChain { .. }
            | TrustAnchor::CertificateAuthorityRoots
            | TrustAnchor::DistributedTrustRoot => true,
        }
    }
}

impl fmt::Display for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrustAnchor::ExplicitKey(_) => "explicit key",
            TrustAnchor::HardwareKey { .. } => "hardware key",
            TrustAnchor::ExplicitCertificate { .. } => "explicit certificate",
            TrustAnchor::ExplicitCertificateWithChain { .. } => "explicit certificate with chain",
            TrustAnchor::CertificateAuthorityRoots => "certificate authority roots",
            TrustAnchor::DistributedTrustRoot => "distributed trust root",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub certificates: Option<MaterialSource>,
    pub ct_log_keys: Option<MaterialSource>,
    pub tlog_keys: Option<MaterialSource>,
    pub tsa_certificates: Option<MaterialSource>,
}

/// Trust material for one run. Built once, then shared read-only.
#[derive(Debug, Clone)]
pub struct TrustContext {
    anchor: TrustAnchor,
    root_certificates: Vec<Vec<u8>>,
    intermediate_certificates: Vec<Vec<u8>>,
    ct_log_keys: Option<KeyMap>,
    tlog_keys: Option<KeyMap>,
    tsa_certificates: Option<TsaCertificates>,
    provenance: Provenance,
    trust_root: TrustRootState,
}

impl TrustContext {
    pub fn new(anchor: TrustAnchor) -> Self {
        Self {
            anchor,
            root_certificates: Vec::new(),
            intermediate_certificates: Vec::new(),
            ct_log_keys: None,
            tlog_keys: None,
            tsa_certificates: None,
            provenance: Provenance::default(),
            trust_root: TrustRootState::NotRequested,
        }
    }

    pub fn with_certificates(mut self, roots: Vec<Vec<u8>>, intermediates: Vec<Vec<u8>>) -> Self {
        self.root_certificates = roots;
        self.intermediate_certificates = intermediates;
        self.provenance.certificates = Some(MaterialSource::Caller);
        self
    }

    pub fn with_ct_log_keys(mut self, keys: KeyMap) -> Self {
        self.ct_log_keys = Some(keys);
        self.provenance.ct_log_keys = Some(MaterialSource::Caller);
        self
    }

    pub fn with_tlog_keys(mut self, keys: KeyMap) -> Self {
        self.tlog_keys = Some(keys);
        self.provenance.tlog_keys = Some(MaterialSource::Caller);
        self
    }

    pub fn with_tsa_certificates(mut self, certs: TsaCertificates) -> Self {
        self.tsa_certificates = Some(certs);
        self.provenance.tsa_certificates = Some(MaterialSource::Caller);
        self
    }

    pub fn anchor(&self) -> &TrustAnchor {
        &self.anchor
    }

    pub fn root_certificates(&self) -> &[Vec<u8>] {
        &self.root_certificates
    }

    pub fn intermediate_certificates(&self) -> &[Vec<u8>] {
        &self.intermediate_certificates
    }

    pub fn ct_log_keys(&self) -> Option<&KeyMap> {
        self.ct_log_keys.as_ref()
    }

    pub fn tlog_keys(&self) -> Option<&KeyMap> {
        self.tlog_keys.as_ref()
    }

    pub fn tsa_certificates(&self) -> Option<&TsaCertificates> {
        self.tsa_certificates.as_ref()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn trust_root(&self) -> &TrustRootState {
        &self.trust_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsa_chain_split() {
        let certs = TsaCertificates::from_chain(vec![b"leaf".to_vec(), b"mid".to_vec(), b"root".to_vec()]);
        assert_eq!(certs.leaf.as_deref(), Some(&b"leaf"[..]));
        assert_eq!(certs.intermediates, vec![b"mid".to_vec()]);
        assert_eq!(certs.roots, vec![b"root".to_vec()]);

        let root_only = TsaCertificates::from_chain(vec![b"root".to_vec()]);
        assert!(root_only.leaf.is_none());
        assert!(!root_only.is_empty());
        assert!(TsaCertificates::from_chain(Vec::new()).is_empty());
    }

    #[test]
    fn test_builders_record_caller_provenance() {
        let ctx = TrustContext::new(TrustAnchor::DistributedTrustRoot)
            .with_tlog_keys(KeyMap::new());
        assert_eq!(ctx.provenance().tlog_keys, Some(MaterialSource::Caller));
        assert!(ctx.provenance().ct_log_keys.is_none());
        assert_eq!(ctx.trust_root(), &TrustRootState::NotRequested);
        assert!(ctx.anchor().is_certificate_based());
    }
}
