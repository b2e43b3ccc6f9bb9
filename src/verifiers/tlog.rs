//! Transparency log (Rekor) entry verification: body consistency, signed
//! entry timestamp and RFC 6962 inclusion proof under a signed checkpoint.

use super::checkpoint::verify_checkpoint;
use crate::control::RunControl;
use crate::keys::{PublicKey, SignatureVerifier};
use crate::record::{InclusionProof, SignedPayload, TlogEntry, VerificationRecord};
use crate::trust::KeyMap;
use crate::{Result, VerifyError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::debug;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Looks up log entries by the SHA-256 of the signed content.
#[async_trait]
pub trait TransparencyLogClient: Send + Sync {
    async fn lookup_entry(&self, payload_sha256: &[u8; 32]) -> Result<Option<TlogEntry>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlogMode {
    /// The entry was embedded in the record's bundle.
    Bundle,
    /// The entry was fetched from the log.
    Lookup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedLogEntry {
    pub entry: TlogEntry,
    pub mode: TlogMode,
    /// The entry's inclusion proof led to a root hash the log signed.
    pub inclusion_proven: bool,
}

fn invalid(msg: impl Into<String>) -> VerifyError {
    VerifyError::TlogVerification(msg.into())
}

pub struct TlogVerifier<'a> {
    keys: Option<&'a KeyMap>,
    client: Option<&'a dyn TransparencyLogClient>,
    allow_lookup: bool,
}

impl<'a> TlogVerifier<'a> {
    pub fn new(
        keys: Option<&'a KeyMap>,
        client: Option<&'a dyn TransparencyLogClient>,
        allow_lookup: bool,
    ) -> Self {
        Self {
            keys,
            client,
            allow_lookup,
        }
    }

    /// Verify the record's embedded entry, or look one up when the record
    /// has none and lookups are allowed.
    pub async fn verify(
        &self,
        record: &VerificationRecord,
        control: &RunControl,
    ) -> Result<VerifiedLogEntry> {
        if let Some(entry) = record.tlog_entry() {
            let inclusion_proven = self.verify_entry(entry, record)?;
            return Ok(VerifiedLogEntry {
                entry: entry.clone(),
                mode: TlogMode::Bundle,
                inclusion_proven,
            });
        }

        if !self.allow_lookup {
            return Err(invalid("record has no embedded transparency log entry"));
        }
        let client = self
            .client
            .ok_or_else(|| invalid("no transparency log client configured for lookup"))?;

        let digest = record.payload.sha256();
        debug!("Looking up transparency log entry for sha256:{}", hex::encode(digest));
        let entry = control
            .run("looking up transparency log entry", client.lookup_entry(&digest))
            .await?
            .ok_or_else(|| {
                invalid(format!(
                    "no transparency log entry found for sha256:{}",
                    hex::encode(digest)
                ))
            })?;

        let inclusion_proven = self.verify_entry(&entry, record)?;
        Ok(VerifiedLogEntry {
            entry,
            mode: TlogMode::Lookup,
            inclusion_proven,
        })
    }

    fn verify_entry(&self, entry: &TlogEntry, record: &VerificationRecord) -> Result<bool> {
        let keys = self
            .keys
            .ok_or_else(|| invalid("no transparency log public keys available"))?;

        check_body(entry, record)?;
        verify_signed_entry_timestamp(entry, keys)?;
        let inclusion_proven = match &entry.inclusion_proof {
            Some(proof) => verify_inclusion(&entry.body, proof, keys)?,
            None => false,
        };

        debug!(
            "Transparency log entry {} verified (integrated at {})",
            entry.log_index, entry.integrated_time
        );
        Ok(inclusion_proven)
    }
}

fn required_str<'v>(spec: &'v Value, pointer: &str, kind: &str, what: &str) -> Result<&'v str> {
    spec.pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("{} entry is missing the {}", kind, what)))
}

fn check_hash(logged: &str, content_hash: &str, what: &str) -> Result<()> {
    if !logged.eq_ignore_ascii_case(content_hash) {
        return Err(invalid(format!(
            "entry {} hash {} does not match sha256:{}",
            what, logged, content_hash
        )));
    }
    Ok(())
}

/// The entry body must record this record's signature and content. Entry
/// kinds that cannot be tied to the record are rejected.
fn check_body(entry: &TlogEntry, record: &VerificationRecord) -> Result<()> {
    let body: Value = serde_json::from_slice(&entry.body)
        .map_err(|e| invalid(format!("entry body is not JSON: {}", e)))?;
    let kind = body
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("entry body has no kind"))?;
    let version = body.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
    let spec = body
        .get("spec")
        .ok_or_else(|| invalid(format!("{} entry has no spec", kind)))?;
    let content_hash = hex::encode(record.payload.sha256());

    match (kind, &record.payload) {
        ("hashedrekord" | "rekord", SignedPayload::Blob(_)) => {
            let signature = required_str(spec, "/signature/content", kind, "signature")?;
            if !same_signature(signature, &record.signature) {
                return Err(invalid("entry signature does not match the record signature"));
            }
            let hash = required_str(spec, "/data/hash/value", kind, "artifact hash")?;
            check_hash(hash, &content_hash, "artifact")?;
        }
        ("dsse", SignedPayload::Dsse { .. }) => {
            let signatures = spec
                .get("signatures")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid("dsse entry is missing signatures"))?;
            let found = signatures.iter().any(|s| {
                s.get("signature")
                    .and_then(Value::as_str)
                    .is_some_and(|sig| same_signature(sig, &record.signature))
            });
            if !found {
                return Err(invalid("entry signatures do not include the record signature"));
            }
            let hash = required_str(spec, "/payloadHash/value", kind, "payload hash")?;
            check_hash(hash, &content_hash, "payload")?;
        }
        ("intoto", SignedPayload::Dsse { .. }) => {
            let hash = required_str(spec, "/content/payloadHash/value", kind, "payload hash")?;
            check_hash(hash, &content_hash, "payload")?;

            match version {
                // v0.0.1 bodies record the payload hash and key, not the signature.
                "0.0.1" => {}
                "0.0.2" => {
                    let signatures = spec
                        .pointer("/content/envelope/signatures")
                        .and_then(Value::as_array)
                        .ok_or_else(|| invalid("intoto entry is missing envelope signatures"))?;
                    let found = signatures.iter().any(|s| {
                        s.get("sig")
                            .and_then(Value::as_str)
                            .is_some_and(|sig| same_envelope_signature(sig, &record.signature))
                    });
                    if !found {
                        return Err(invalid("entry signatures do not include the record signature"));
                    }
                }
                other => {
                    return Err(invalid(format!("unsupported intoto entry version {:?}", other)));
                }
            }
        }
        ("hashedrekord" | "rekord" | "dsse" | "intoto", payload) => {
            let record_kind = match payload {
                SignedPayload::Blob(_) => "blob signature",
                SignedPayload::Dsse { .. } => "DSSE envelope",
            };
            return Err(invalid(format!("a {} entry cannot record a {}", kind, record_kind)));
        }
        (other, _) => return Err(invalid(format!("unsupported entry kind {:?}", other))),
    }
    Ok(())
}

fn same_signature(encoded: &str, signature: &[u8]) -> bool {
    BASE64.decode(encoded).is_ok_and(|decoded| decoded == signature)
}

/// intoto v0.0.2 bodies store the envelope's base64 signature encoded once
/// more.
fn same_envelope_signature(encoded: &str, signature: &[u8]) -> bool {
    same_signature(encoded, signature)
        || BASE64
            .decode(encoded)
            .ok()
            .and_then(|inner| BASE64.decode(inner).ok())
            .is_some_and(|decoded| decoded == signature)
}

/// Canonical SET payload: keys in lexicographic order, no whitespace.
#[derive(Serialize)]
struct SetPayload<'a> {
    body: String,
    #[serde(rename = "integratedTime")]
    integrated_time: i64,
    #[serde(rename = "logID")]
    log_id: &'a str,
    #[serde(rename = "logIndex")]
    log_index: i64,
}

fn verify_signed_entry_timestamp(entry: &TlogEntry, keys: &KeyMap) -> Result<()> {
    let set = entry
        .signed_entry_timestamp
        .as_deref()
        .ok_or_else(|| invalid("entry has no signed entry timestamp"))?;
    let key = keys
        .get(&entry.log_id)
        .ok_or_else(|| invalid(format!("entry was signed by an unknown log {}", entry.log_id)))?;

    let payload = serde_json::to_vec(&SetPayload {
        body: BASE64.encode(&entry.body),
        integrated_time: entry.integrated_time,
        log_id: &entry.log_id,
        log_index: entry.log_index,
    })?;

    PublicKey::from_spki_der(key)
        .map_err(|e| invalid(format!("Invalid transparency log key: {}", e)))?
        .verify(set, &payload)
        .map_err(|e| invalid(format!("signed entry timestamp: {}", e)))
}

fn leaf_hash(body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(body);
    hasher.finalize().into()
}

fn node_hash(left: &[u8], right: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// A proof only counts when a checkpoint signed by the log commits to its
/// root hash and tree size.
fn verify_inclusion(body: &[u8], proof: &InclusionProof, keys: &KeyMap) -> Result<bool> {
    let Some(note) = proof.checkpoint.as_deref() else {
        debug!("Inclusion proof has no signed checkpoint, not checking it");
        return Ok(false);
    };

    let checkpoint = verify_checkpoint(note, keys)?;
    if checkpoint.tree_size != proof.tree_size {
        return Err(invalid(format!(
            "inclusion proof is for tree size {} but the checkpoint is for {}",
            proof.tree_size, checkpoint.tree_size
        )));
    }
    if checkpoint.root_hash != proof.root_hash {
        return Err(invalid("inclusion proof root hash differs from the checkpoint"));
    }
    verify_inclusion_proof(body, proof)?;
    Ok(true)
}

/// RFC 9162 section 2.1.3.2.
fn verify_inclusion_proof(body: &[u8], proof: &InclusionProof) -> Result<()> {
    if proof.log_index >= proof.tree_size {
        return Err(invalid(format!(
            "inclusion proof index {} is outside tree of size {}",
            proof.log_index, proof.tree_size
        )));
    }

    let mut fn_ = proof.log_index;
    let mut sn = proof.tree_size - 1;
    let mut hash = leaf_hash(body);

    for sibling in &proof.hashes {
        if sn == 0 {
            return Err(invalid("inclusion proof is longer than expected"));
        }
        if fn_ & 1 == 1 || fn_ == sn {
            hash = node_hash(sibling, &hash);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            hash = node_hash(&hash, sibling);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    if sn != 0 {
        return Err(invalid("inclusion proof is shorter than expected"));
    }
    if hash.as_slice() != proof.root_hash.as_slice() {
        return Err(invalid("inclusion proof does not lead to the checkpoint root hash"));
    }
    Ok(())
}
