//! Wire formats that carry signatures: cosign's local signed payload, the
//! sigstore bundle, and bare DSSE envelopes. Everything is normalized into
//! [`VerificationRecord`]s.

use crate::keys::decode_certificates;
use crate::record::{
    BundleMaterial, InclusionProof, SignedPayload, TlogEntry, VerificationRecord,
    INTOTO_PAYLOAD_TYPE,
};
use crate::{Result, VerifyError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const SIGSTORE_BUNDLE_MEDIA_TYPE_PREFIX: &str = "application/vnd.dev.sigstore.bundle";
const INTOTO_STATEMENT_PREFIX: &str = "https://in-toto.io/Statement/v";

/// The JSON document written by `cosign sign-blob --bundle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSignedPayload {
    #[serde(rename = "base64Signature")]
    pub base64_signature: String,
    /// Base64 of the PEM-encoded signing certificate.
    #[serde(rename = "cert", default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(rename = "rekorBundle", default, skip_serializing_if = "Option::is_none")]
    pub rekor_bundle: Option<RekorBundle>,
    #[serde(rename = "rfc3161Timestamp", default, skip_serializing_if = "Option::is_none")]
    pub rfc3161_timestamp: Option<Rfc3161Timestamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekorBundle {
    #[serde(rename = "SignedEntryTimestamp")]
    pub signed_entry_timestamp: String,
    #[serde(rename = "Payload")]
    pub payload: RekorPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekorPayload {
    pub body: String,
    #[serde(rename = "integratedTime")]
    pub integrated_time: i64,
    #[serde(rename = "logIndex")]
    pub log_index: i64,
    #[serde(rename = "logID")]
    pub log_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rfc3161Timestamp {
    #[serde(rename = "SignedRFC3161Timestamp")]
    pub signed_rfc3161_timestamp: String,
}

impl LocalSignedPayload {
    pub fn into_record(self, payload: SignedPayload) -> Result<VerificationRecord> {
        let signature = decode_b64("base64Signature", &self.base64_signature)?;
        let mut record = VerificationRecord::new(signature, payload);

        if let Some(cert) = self.cert.as_deref().filter(|c| !c.is_empty()) {
            let pem = decode_b64("cert", cert)?;
            let mut certs = decode_certificates(&pem)
                .map_err(|e| VerifyError::InvalidRecord(format!("Invalid cert field: {}", e)))?;
            let leaf = certs.remove(0);
            record = record.with_certificate(leaf);
            if !certs.is_empty() {
                record = record.with_certificate_chain(certs);
            }
        }

        let mut material = BundleMaterial::default();
        if let Some(rekor) = self.rekor_bundle {
            material.tlog_entry = Some(TlogEntry {
                body: decode_b64("rekorBundle.Payload.body", &rekor.payload.body)?,
                integrated_time: rekor.payload.integrated_time,
                log_index: rekor.payload.log_index,
                log_id: rekor.payload.log_id,
                signed_entry_timestamp: Some(decode_b64(
                    "rekorBundle.SignedEntryTimestamp",
                    &rekor.signed_entry_timestamp,
                )?),
                inclusion_proof: None,
            });
        }
        if let Some(ts) = self.rfc3161_timestamp {
            material.rfc3161_timestamp = Some(decode_b64(
                "rfc3161Timestamp.SignedRFC3161Timestamp",
                &ts.signed_rfc3161_timestamp,
            )?);
        }
        if material != BundleMaterial::default() {
            record = record.with_bundle(material);
        }

        Ok(record)
    }
}

/// Parse a signature file: a single JSON document or JSON lines, each one a
/// cosign local signed payload, a sigstore bundle, or a DSSE envelope.
///
/// `artifact` is required for blob signatures, whose payload is not carried
/// in the file.
pub fn parse_records(content: &str, artifact: Option<&[u8]>) -> Result<Vec<VerificationRecord>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    // A pretty-printed single document spans several lines.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return parse_document(&value, artifact);
    }

    let mut records = Vec::new();
    for line in trimmed.lines() {
        if line.trim().is_empty() {
            continue;
        }
        trace!("Parsing line of length: {}", line.len());
        let value: Value = serde_json::from_str(line)?;
        records.extend(parse_document(&value, artifact)?);
    }
    Ok(records)
}

pub fn parse_document(value: &Value, artifact: Option<&[u8]>) -> Result<Vec<VerificationRecord>> {
    if value.get("base64Signature").is_some() {
        let local: LocalSignedPayload = serde_json::from_value(value.clone())?;
        return Ok(vec![local.into_record(blob_payload(artifact)?)?]);
    }

    if value
        .get("mediaType")
        .and_then(Value::as_str)
        .is_some_and(|m| m.starts_with(SIGSTORE_BUNDLE_MEDIA_TYPE_PREFIX))
    {
        return parse_sigstore_bundle(value, artifact).map(|r| vec![r]);
    }

    if value.get("payloadType").is_some() && value.get("signatures").is_some() {
        let (payload, signatures) = parse_dsse_envelope(value)?;
        return Ok(signatures
            .into_iter()
            .map(|sig| VerificationRecord::new(sig, payload.clone()))
            .collect());
    }

    Err(VerifyError::InvalidRecord(
        "Unrecognized signature document: expected a cosign bundle, sigstore bundle or DSSE envelope"
            .into(),
    ))
}

/// Parse a sigstore bundle (v0.1 to v0.3) into a single record.
pub fn parse_sigstore_bundle(value: &Value, artifact: Option<&[u8]>) -> Result<VerificationRecord> {
    let material = value
        .get("verificationMaterial")
        .ok_or_else(|| VerifyError::InvalidRecord("Bundle has no verificationMaterial".into()))?;

    let mut record = if let Some(envelope) = value.get("dsseEnvelope") {
        let (payload, mut signatures) = parse_dsse_envelope(envelope)?;
        if signatures.len() != 1 {
            return Err(VerifyError::InvalidRecord(format!(
                "Bundle DSSE envelope must carry exactly one signature, found {}",
                signatures.len()
            )));
        }
        VerificationRecord::new(signatures.remove(0), payload)
    } else if let Some(message) = value.get("messageSignature") {
        let signature = str_field(message, "signature")?;
        VerificationRecord::new(decode_b64("messageSignature.signature", signature)?, blob_payload(artifact)?)
    } else {
        return Err(VerifyError::InvalidRecord(
            "Bundle has neither DSSE envelope nor message signature".into(),
        ));
    };

    let mut certs = extract_certificates(material)?;
    if !certs.is_empty() {
        let leaf = certs.remove(0);
        record = record.with_certificate(leaf);
        if !certs.is_empty() {
            record = record.with_certificate_chain(certs);
        }
    }

    let tlog_entry = match material
        .get("tlogEntries")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
    {
        Some(entry) => Some(parse_bundle_tlog_entry(entry)?),
        None => None,
    };

    let rfc3161_timestamp = match material
        .pointer("/timestampVerificationData/rfc3161Timestamps/0/signedTimestamp")
        .and_then(Value::as_str)
    {
        Some(token) => Some(decode_b64("signedTimestamp", token)?),
        None => None,
    };

    if tlog_entry.is_some() || rfc3161_timestamp.is_some() {
        record = record.with_bundle(BundleMaterial {
            tlog_entry,
            rfc3161_timestamp,
        });
    }

    Ok(record)
}

fn extract_certificates(material: &Value) -> Result<Vec<Vec<u8>>> {
    if let Some(raw) = material.pointer("/certificate/rawBytes").and_then(Value::as_str) {
        return Ok(vec![decode_b64("certificate.rawBytes", raw)?]);
    }

    let mut chain = Vec::new();
    if let Some(certs) = material
        .pointer("/x509CertificateChain/certificates")
        .and_then(Value::as_array)
    {
        for cert in certs {
            let raw = str_field(cert, "rawBytes")?;
            chain.push(decode_b64("x509CertificateChain.rawBytes", raw)?);
        }
    }
    Ok(chain)
}

/// Bundle tlog entries encode integers as strings and hashes as base64.
fn parse_bundle_tlog_entry(entry: &Value) -> Result<TlogEntry> {
    let body = decode_b64("canonicalizedBody", str_field(entry, "canonicalizedBody")?)?;
    let log_id = entry
        .pointer("/logId/keyId")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::InvalidRecord("Tlog entry has no logId.keyId".into()))?;

    let signed_entry_timestamp = match entry
        .pointer("/inclusionPromise/signedEntryTimestamp")
        .and_then(Value::as_str)
    {
        Some(set) => Some(decode_b64("signedEntryTimestamp", set)?),
        None => None,
    };

    let inclusion_proof = match entry.get("inclusionProof") {
        Some(proof) => {
            let hashes = proof
                .get("hashes")
                .and_then(Value::as_array)
                .map(|hashes| {
                    hashes
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|h| decode_b64("inclusionProof.hashes", h))
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            Some(InclusionProof {
                log_index: value_as_u64(proof, "logIndex")?,
                tree_size: value_as_u64(proof, "treeSize")?,
                root_hash: decode_b64("inclusionProof.rootHash", str_field(proof, "rootHash")?)?,
                hashes,
                checkpoint: proof
                    .pointer("/checkpoint/envelope")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        }
        None => None,
    };

    Ok(TlogEntry {
        body,
        integrated_time: value_as_i64(entry, "integratedTime")?,
        log_index: value_as_i64(entry, "logIndex")?,
        log_id: hex::encode(decode_b64("logId.keyId", log_id)?),
        signed_entry_timestamp,
        inclusion_proof,
    })
}

/// Returns the envelope payload and every decoded signature.
fn parse_dsse_envelope(envelope: &Value) -> Result<(SignedPayload, Vec<Vec<u8>>)> {
    let payload_type = str_field(envelope, "payloadType")?.to_string();
    let payload = decode_b64("payload", str_field(envelope, "payload")?)?;

    let signatures = envelope
        .get("signatures")
        .and_then(Value::as_array)
        .ok_or_else(|| VerifyError::InvalidRecord("DSSE envelope has no signatures".into()))?
        .iter()
        .map(|sig| decode_b64("sig", str_field(sig, "sig")?))
        .collect::<Result<Vec<_>>>()?;

    Ok((
        SignedPayload::Dsse {
            payload_type,
            payload,
        },
        signatures,
    ))
}

fn blob_payload(artifact: Option<&[u8]>) -> Result<SignedPayload> {
    artifact
        .map(|data| SignedPayload::Blob(data.to_vec()))
        .ok_or_else(|| {
            VerifyError::InvalidRecord("Blob signature requires the artifact contents".into())
        })
}

fn str_field<'v>(value: &'v Value, field: &str) -> Result<&'v str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::InvalidRecord(format!("Missing string field {}", field)))
}

fn decode_b64(field: &str, data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| VerifyError::InvalidRecord(format!("Failed to decode {}: {}", field, e)))
}

/// Accept both JSON numbers and the string-encoded integers used by
/// protobuf JSON.
fn value_as_i64(value: &Value, field: &str) -> Result<i64> {
    let parsed = match value.get(field) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| VerifyError::InvalidRecord(format!("Missing integer field {}", field)))
}

fn value_as_u64(value: &Value, field: &str) -> Result<u64> {
    u64::try_from(value_as_i64(value, field)?)
        .map_err(|_| VerifyError::InvalidRecord(format!("Negative value for {}", field)))
}

/// An in-toto attestation statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "_type")]
    pub statement_type: String,
    #[serde(rename = "predicateType")]
    pub predicate_type: String,
    #[serde(default)]
    pub subject: Vec<Subject>,
    #[serde(default)]
    pub predicate: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub digest: BTreeMap<String, String>,
}

impl Statement {
    /// Whether any subject carries `digest`, given as `algorithm:hex`.
    pub fn has_subject_digest(&self, digest: &str) -> bool {
        let (algorithm, value) = digest.split_once(':').unwrap_or(("sha256", digest));
        self.subject.iter().any(|s| {
            s.digest
                .get(algorithm)
                .is_some_and(|d| d.eq_ignore_ascii_case(value))
        })
    }
}

pub fn parse_statement(payload: &[u8]) -> Result<Statement> {
    let statement: Statement = serde_json::from_slice(payload)?;
    if !statement.statement_type.starts_with(INTOTO_STATEMENT_PREFIX) {
        return Err(VerifyError::InvalidRecord(format!(
            "Unsupported statement type: {}",
            statement.statement_type
        )));
    }
    Ok(statement)
}

/// Parse the in-toto statement of an attestation record.
pub fn record_statement(record: &VerificationRecord) -> Result<Statement> {
    match &record.payload {
        SignedPayload::Dsse {
            payload_type,
            payload,
        } if payload_type == INTOTO_PAYLOAD_TYPE => parse_statement(payload),
        SignedPayload::Dsse { payload_type, .. } => Err(VerifyError::InvalidRecord(format!(
            "Unsupported DSSE payload type: {}",
            payload_type
        ))),
        SignedPayload::Blob(_) => Err(VerifyError::InvalidRecord(
            "Blob signature carries no attestation".into(),
        )),
    }
}
