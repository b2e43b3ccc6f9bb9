//! Candidate signatures and attestations as handed to the verification
//! pipeline.

use sha2::{Digest, Sha256};
use std::borrow::Cow;

pub const INTOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// What the signature was computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignedPayload {
    /// A detached blob signature; the signature covers these bytes directly.
    Blob(Vec<u8>),
    /// A DSSE envelope payload; the signature covers its PAE encoding.
    Dsse {
        payload_type: String,
        payload: Vec<u8>,
    },
}

impl SignedPayload {
    /// The exact bytes the signature must verify against.
    pub fn signed_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            SignedPayload::Blob(data) => Cow::Borrowed(data),
            SignedPayload::Dsse {
                payload_type,
                payload,
            } => Cow::Owned(pae(payload_type, payload)),
        }
    }

    pub fn content(&self) -> &[u8] {
        match self {
            SignedPayload::Blob(data) => data,
            SignedPayload::Dsse { payload, .. } => payload,
        }
    }

    /// SHA-256 of the content, used to locate entries in the transparency log.
    pub fn sha256(&self) -> [u8; 32] {
        Sha256::digest(self.content()).into()
    }

    pub fn is_attestation(&self) -> bool {
        matches!(self, SignedPayload::Dsse { payload_type, .. } if payload_type == INTOTO_PAYLOAD_TYPE)
    }
}

/// DSSE Pre-Authentication Encoding.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::new();
    pae.extend_from_slice(b"DSSEv1 ");
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);
    pae
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    pub log_index: u64,
    pub tree_size: u64,
    pub root_hash: Vec<u8>,
    pub hashes: Vec<Vec<u8>>,
    /// Signed note committing to `root_hash` and `tree_size`.
    pub checkpoint: Option<String>,
}

/// A transparency log entry, either embedded in a bundle or returned by a
/// log lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlogEntry {
    /// Canonicalized entry body as stored by the log.
    pub body: Vec<u8>,
    pub integrated_time: i64,
    pub log_index: i64,
    /// Hex-encoded log id (SHA-256 of the log's public key).
    pub log_id: String,
    pub signed_entry_timestamp: Option<Vec<u8>>,
    pub inclusion_proof: Option<InclusionProof>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleMaterial {
    pub tlog_entry: Option<TlogEntry>,
    /// DER-encoded RFC3161 timestamp response.
    pub rfc3161_timestamp: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    pub signature: Vec<u8>,
    pub payload: SignedPayload,
    /// DER-encoded signing certificate.
    pub certificate: Option<Vec<u8>>,
    pub certificate_chain: Option<Vec<Vec<u8>>>,
    pub bundle: Option<BundleMaterial>,
}

impl VerificationRecord {
    pub fn new(signature: Vec<u8>, payload: SignedPayload) -> Self {
        Self {
            signature,
            payload,
            certificate: None,
            certificate_chain: None,
            bundle: None,
        }
    }

    pub fn with_certificate(mut self, der: Vec<u8>) -> Self {
        self.certificate = Some(der);
        self
    }

    pub fn with_certificate_chain(mut self, chain: Vec<Vec<u8>>) -> Self {
        self.certificate_chain = Some(chain);
        self
    }

    pub fn with_bundle(mut self, bundle: BundleMaterial) -> Self {
        self.bundle = Some(bundle);
        self
    }

    pub fn tlog_entry(&self) -> Option<&TlogEntry> {
        self.bundle.as_ref().and_then(|b| b.tlog_entry.as_ref())
    }

    pub fn rfc3161_timestamp(&self) -> Option<&[u8]> {
        self.bundle
            .as_ref()
            .and_then(|b| b.rfc3161_timestamp.as_deref())
    }
}
