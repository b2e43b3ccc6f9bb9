//! Public key material and the signature verifier capabilities built from it.

use crate::{Result, VerifyError};
use ed25519_dalek::{Signature as Ed25519Signature, VerifyingKey as Ed25519VerifyingKey};
use log::{debug, warn};
use p256::ecdsa::{Signature as P256Signature, VerifyingKey as P256VerifyingKey};
use p384::ecdsa::{Signature as P384Signature, VerifyingKey as P384VerifyingKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use x509_parser::prelude::*;

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";
const OID_ED25519: &str = "1.3.101.112";

/// Anything that can check a signature over a message.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signature: &[u8], message: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum PublicKey {
    P256(P256VerifyingKey),
    P384(P384VerifyingKey),
    Ed25519(Ed25519VerifyingKey),
}

impl PublicKey {
    /// Parse a DER-encoded SubjectPublicKeyInfo.
    pub fn from_spki_der(der: &[u8]) -> Result<Self> {
        let (_, spki) = SubjectPublicKeyInfo::from_der(der)
            .map_err(|e| VerifyError::KeyParse(format!("Invalid SubjectPublicKeyInfo: {}", e)))?;
        Self::from_spki(&spki)
    }

    /// Parse a PEM (`PUBLIC KEY`) or raw DER public key.
    pub fn from_pem_or_der(bytes: &[u8]) -> Result<Self> {
        match pem_blocks(bytes, "PUBLIC KEY")?.into_iter().next() {
            Some(der) => Self::from_spki_der(&der),
            None if looks_like_pem(bytes) => Err(VerifyError::KeyParse(
                "PEM input contains no PUBLIC KEY block".into(),
            )),
            None => Self::from_spki_der(bytes),
        }
    }

    pub fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self> {
        let key_bytes: &[u8] = spki.subject_public_key.data.as_ref();

        match spki.algorithm.algorithm.to_string().as_str() {
            OID_EC_PUBLIC_KEY => {
                let curve = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .ok_or_else(|| VerifyError::KeyParse("EC key is missing curve parameters".into()))?
                    .as_oid()
                    .map_err(|e| VerifyError::KeyParse(format!("Failed to parse curve OID: {}", e)))?;

                match curve.to_string().as_str() {
                    OID_CURVE_P256 => P256VerifyingKey::from_sec1_bytes(key_bytes)
                        .map(PublicKey::P256)
                        .map_err(|e| VerifyError::KeyParse(format!("Invalid P-256 key: {}", e))),
                    OID_CURVE_P384 => P384VerifyingKey::from_sec1_bytes(key_bytes)
                        .map(PublicKey::P384)
                        .map_err(|e| VerifyError::KeyParse(format!("Invalid P-384 key: {}", e))),
                    other => Err(VerifyError::KeyParse(format!("Unsupported curve: {}", other))),
                }
            }
            OID_ED25519 => {
                let bytes: [u8; 32] = key_bytes
                    .try_into()
                    .map_err(|_| VerifyError::KeyParse("Ed25519 key must be 32 bytes".into()))?;
                Ed25519VerifyingKey::from_bytes(&bytes)
                    .map(PublicKey::Ed25519)
                    .map_err(|e| VerifyError::KeyParse(format!("Invalid Ed25519 key: {}", e)))
            }
            other => Err(VerifyError::KeyParse(format!(
                "Unsupported public key algorithm: {}",
                other
            ))),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            PublicKey::P256(_) => "ecdsa-p256",
            PublicKey::P384(_) => "ecdsa-p384",
            PublicKey::Ed25519(_) => "ed25519",
        }
    }
}

impl SignatureVerifier for PublicKey {
    fn verify(&self, signature: &[u8], message: &[u8]) -> Result<()> {
        match self {
            PublicKey::P256(key) => {
                let signature = P256Signature::from_der(signature)
                    .or_else(|_| P256Signature::from_slice(signature))
                    .map_err(|e| VerifyError::Signature(format!("Failed to parse P-256 signature: {}", e)))?;
                p256::ecdsa::signature::Verifier::verify(key, message, &signature)
                    .map_err(|e| VerifyError::Signature(format!("P-256 signature verification failed: {}", e)))?;
            }
            PublicKey::P384(key) => {
                let signature = P384Signature::from_der(signature)
                    .or_else(|_| P384Signature::from_slice(signature))
                    .map_err(|e| VerifyError::Signature(format!("Failed to parse P-384 signature: {}", e)))?;
                p384::ecdsa::signature::Verifier::verify(key, message, &signature)
                    .map_err(|e| VerifyError::Signature(format!("P-384 signature verification failed: {}", e)))?;
            }
            PublicKey::Ed25519(key) => {
                let signature = Ed25519Signature::from_slice(signature)
                    .map_err(|e| VerifyError::Signature(format!("Failed to parse Ed25519 signature: {}", e)))?;
                ed25519_dalek::Verifier::verify(key, message, &signature)
                    .map_err(|e| VerifyError::Signature(format!("Ed25519 signature verification failed: {}", e)))?;
            }
        }

        debug!("{} signature verified successfully", self.algorithm());
        Ok(())
    }
}

/// Load a public key from a PEM or DER file.
pub async fn load_public_key(path: &Path) -> Result<PublicKey> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        VerifyError::KeyParse(format!("Failed to read public key file {}: {}", path.display(), e))
    })?;
    PublicKey::from_pem_or_der(&bytes)
}

/// Hex-encoded SHA-256 of a DER SubjectPublicKeyInfo; the id used by
/// transparency and CT logs.
pub fn key_id(spki_der: &[u8]) -> String {
    hex::encode(Sha256::digest(spki_der))
}

/// Decode every `CERTIFICATE` block of a PEM input, or treat the input as a
/// single DER certificate.
pub fn decode_certificates(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    if looks_like_pem(bytes) {
        let certs = pem_blocks(bytes, "CERTIFICATE")?;
        if certs.is_empty() {
            return Err(VerifyError::Configuration(
                "PEM input contains no CERTIFICATE block".into(),
            ));
        }
        Ok(certs)
    } else {
        Ok(vec![bytes.to_vec()])
    }
}

/// Decode every PEM block carrying `label`.
pub fn pem_blocks(bytes: &[u8], label: &str) -> Result<Vec<Vec<u8>>> {
    if std::str::from_utf8(bytes).is_err() {
        return Ok(Vec::new());
    }

    let mut blocks = Vec::new();
    for pem in Pem::iter_from_buffer(bytes) {
        let pem = pem.map_err(|e| VerifyError::Configuration(format!("Invalid PEM block: {}", e)))?;
        if pem.label == label {
            blocks.push(pem.contents);
        }
    }
    Ok(blocks)
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .is_some_and(|start| bytes[start..].starts_with(b"-----BEGIN "))
}

/// A hardware-backed key opened for the duration of one verification.
pub trait KeyHandle: Send {
    fn verifier(&self) -> Result<Box<dyn SignatureVerifier>>;
    fn close(&mut self) -> Result<()>;
}

pub trait KeyProvider: Send + Sync {
    fn open(&self, slot: Option<&str>) -> Result<Box<dyn KeyHandle>>;
}

/// Closes the wrapped handle when dropped, on success and error paths alike.
pub struct ScopedKey {
    handle: Option<Box<dyn KeyHandle>>,
}

impl ScopedKey {
    pub fn open(provider: &dyn KeyProvider, slot: Option<&str>) -> Result<Self> {
        let handle = provider.open(slot)?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    pub fn verify(&self, signature: &[u8], message: &[u8]) -> Result<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| VerifyError::Configuration("hardware key handle already closed".into()))?;
        handle.verifier()?.verify(signature, message)
    }
}

impl Drop for ScopedKey {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close() {
                warn!("Failed to close hardware key handle: {}", e);
            }
        }
    }
}
