//! Signed certificate timestamps (RFC 6962): proof that a certificate was
//! submitted to a CT log at issuance.

use crate::keys::{PublicKey, SignatureVerifier};
use crate::trust::KeyMap;
use crate::{Result, VerifyError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::debug;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use x509_cert::der::asn1::OctetString;
use x509_cert::der::oid::ObjectIdentifier;
use x509_cert::der::{Decode, Encode};

const SCT_LIST_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.4.2");
const PRECERT_POISON_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.4.3");

/// What the CT log signed.
pub(crate) enum LogEntry<'a> {
    X509 { certificate: &'a [u8] },
    Precert {
        issuer_key_hash: [u8; 32],
        tbs: &'a [u8],
    },
}

struct Sct<'a> {
    log_id: &'a [u8],
    timestamp: [u8; 8],
    extensions: &'a [u8],
    hash_algorithm: u8,
    signature_algorithm: u8,
    signature: &'a [u8],
}

fn invalid(msg: impl Into<String>) -> VerifyError {
    VerifyError::CertificateValidation(msg.into())
}

/// Verify the SCT list embedded in `leaf_der`, issued by `issuer_der`.
pub fn verify_embedded_sct(leaf_der: &[u8], issuer_der: &[u8], ct_keys: &KeyMap) -> Result<()> {
    let cert = x509_cert::Certificate::from_der(leaf_der)
        .map_err(|e| invalid(format!("Failed to parse certificate: {}", e)))?;

    let sct_extension = cert
        .tbs_certificate
        .extensions
        .as_ref()
        .and_then(|exts| exts.iter().find(|ext| ext.extn_id == SCT_LIST_OID))
        .ok_or_else(|| invalid("certificate is missing an embedded SCT"))?;

    let list = OctetString::from_der(sct_extension.extn_value.as_bytes())
        .map_err(|e| invalid(format!("Failed to decode SCT extension: {}", e)))?;

    let tbs = precert_tbs(&cert)?;
    let (_, issuer) = x509_parser::parse_x509_certificate(issuer_der)
        .map_err(|e| invalid(format!("Failed to parse issuer certificate: {}", e)))?;
    let issuer_key_hash: [u8; 32] = Sha256::digest(issuer.public_key().raw).into();

    verify_sct_list(
        list.as_bytes(),
        &LogEntry::Precert {
            issuer_key_hash,
            tbs: &tbs,
        },
        ct_keys,
    )
}

/// The precertificate TBS: the leaf TBS without the SCT list and poison
/// extensions.
fn precert_tbs(cert: &x509_cert::Certificate) -> Result<Vec<u8>> {
    let mut tbs = cert.tbs_certificate.clone();
    if let Some(exts) = tbs.extensions.as_mut() {
        exts.retain(|ext| ext.extn_id != SCT_LIST_OID && ext.extn_id != PRECERT_POISON_OID);
        if exts.is_empty() {
            tbs.extensions = None;
        }
    }
    tbs.to_der()
        .map_err(|e| invalid(format!("Failed to encode precertificate TBS: {}", e)))
}

/// A detached SCT as returned by the CT log's add-chain endpoint.
#[derive(Debug, Deserialize)]
struct DetachedSct {
    sct_version: u8,
    id: String,
    timestamp: u64,
    #[serde(default)]
    extensions: String,
    signature: String,
}

/// Verify a detached SCT (JSON) over the full leaf certificate.
pub fn verify_detached_sct(leaf_der: &[u8], sct_json: &[u8], ct_keys: &KeyMap) -> Result<()> {
    let detached: DetachedSct = serde_json::from_slice(sct_json)
        .map_err(|e| invalid(format!("Failed to parse detached SCT: {}", e)))?;
    if detached.sct_version != 0 {
        return Err(invalid(format!("unsupported SCT version: {}", detached.sct_version)));
    }

    let decode = |field: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|e| invalid(format!("Failed to decode detached SCT {}: {}", field, e)))
    };
    let log_id = decode("id", &detached.id)?;
    let extensions = decode("extensions", &detached.extensions)?;
    let digitally_signed = decode("signature", &detached.signature)?;

    if digitally_signed.len() < 4 {
        return Err(invalid("detached SCT signature too short"));
    }
    let sig_len = u16::from_be_bytes([digitally_signed[2], digitally_signed[3]]) as usize;
    let signature = digitally_signed
        .get(4..4 + sig_len)
        .ok_or_else(|| invalid("detached SCT signature length mismatch"))?;

    let sct = Sct {
        log_id: &log_id,
        timestamp: detached.timestamp.to_be_bytes(),
        extensions: &extensions,
        hash_algorithm: digitally_signed[0],
        signature_algorithm: digitally_signed[1],
        signature,
    };
    verify_sct(&sct, &LogEntry::X509 { certificate: leaf_der }, ct_keys)
}

/// Verify a TLS-encoded SCT list; one SCT from a known log is enough.
pub(crate) fn verify_sct_list(list: &[u8], entry: &LogEntry<'_>, ct_keys: &KeyMap) -> Result<()> {
    if ct_keys.is_empty() {
        return Err(invalid("no CT log public keys configured"));
    }

    let mut reader = Reader::new(list);
    let scts = reader.vec16()?;
    let mut reader = Reader::new(scts);
    let mut last_error = invalid("SCT list is empty");

    while !reader.is_empty() {
        let sct = parse_sct(reader.vec16()?)?;
        match verify_sct(&sct, entry, ct_keys) {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("SCT from log {} did not verify: {}", hex::encode(sct.log_id), e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

fn parse_sct(bytes: &[u8]) -> Result<Sct<'_>> {
    let mut reader = Reader::new(bytes);
    let version = reader.take(1)?[0];
    if version != 0 {
        return Err(invalid(format!("unsupported SCT version: {}", version)));
    }
    let log_id = reader.take(32)?;
    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(reader.take(8)?);
    let extensions = reader.vec16()?;
    let algorithms = reader.take(2)?;
    let signature = reader.vec16()?;

    Ok(Sct {
        log_id,
        timestamp,
        extensions,
        hash_algorithm: algorithms[0],
        signature_algorithm: algorithms[1],
        signature,
    })
}

fn verify_sct(sct: &Sct<'_>, entry: &LogEntry<'_>, ct_keys: &KeyMap) -> Result<()> {
    let key = ct_keys
        .get(&hex::encode(sct.log_id))
        .ok_or_else(|| invalid(format!("SCT was issued by an unknown log {}", hex::encode(sct.log_id))))?;

    // SHA-256/ECDSA and SHA-384/ECDSA
    if !matches!((sct.hash_algorithm, sct.signature_algorithm), (4, 3) | (5, 3)) {
        return Err(invalid(format!(
            "unsupported SCT algorithm combination: hash={}, sig={}",
            sct.hash_algorithm, sct.signature_algorithm
        )));
    }

    let public_key = PublicKey::from_spki_der(key)
        .map_err(|e| invalid(format!("Invalid CT log key: {}", e)))?;
    public_key
        .verify(sct.signature, &signed_data(sct, entry))
        .map_err(|e| invalid(format!("SCT signature verification failed: {}", e)))
}

fn signed_data(sct: &Sct<'_>, entry: &LogEntry<'_>) -> Vec<u8> {
    let mut data = vec![0u8, 0u8];
    data.extend_from_slice(&sct.timestamp);
    match entry {
        LogEntry::X509 { certificate } => {
            data.extend_from_slice(&[0, 0]);
            push_u24(&mut data, certificate);
        }
        LogEntry::Precert {
            issuer_key_hash,
            tbs,
        } => {
            data.extend_from_slice(&[0, 1]);
            data.extend_from_slice(issuer_key_hash);
            push_u24(&mut data, tbs);
        }
    }
    data.extend_from_slice(&(sct.extensions.len() as u16).to_be_bytes());
    data.extend_from_slice(sct.extensions);
    data
}

fn push_u24(data: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len();
    data.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
    data.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(invalid("truncated SCT data"));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn vec16(&mut self) -> Result<&'a [u8]> {
        let len = self.take(2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        self.take(len)
    }
}
