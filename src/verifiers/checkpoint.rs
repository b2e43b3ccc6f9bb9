//! Transparency log checkpoints: the signed note a log publishes for each
//! tree head.
//!
//! ```text
//! rekor.sigstore.dev - 1193050959916656506
//! 2605736
//! <base64 root hash>
//!
//! <U+2014> rekor.sigstore.dev <base64(key hint || signature)>
//! ```

use crate::keys::{PublicKey, SignatureVerifier};
use crate::trust::KeyMap;
use crate::{Result, VerifyError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::debug;
use sha2::{Digest, Sha256};

const SIGNATURE_LINE_PREFIX: &str = "\u{2014} ";

/// A tree head whose note signature has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub origin: String,
    pub tree_size: u64,
    pub root_hash: Vec<u8>,
}

struct NoteSignature<'a> {
    name: &'a str,
    key_hint: [u8; 4],
    signature: Vec<u8>,
}

fn invalid(msg: impl Into<String>) -> VerifyError {
    VerifyError::TlogVerification(format!("checkpoint: {}", msg.into()))
}

/// Verify `note` against the trusted log keys and return the tree head it
/// commits to. One signature from a trusted key is enough.
pub fn verify_checkpoint(note: &str, keys: &KeyMap) -> Result<Checkpoint> {
    let (text, signatures) = note
        .split_once("\n\n")
        .ok_or_else(|| invalid("note has no signature block"))?;
    // The signed text includes its final newline.
    let signed = &note[..text.len() + 1];
    let checkpoint = parse_body(text)?;

    let mut last_error = invalid("note carries no signatures");
    for line in signatures.lines().filter(|l| !l.is_empty()) {
        let signature = parse_signature(line)?;
        match verify_signature(&signature, signed.as_bytes(), keys) {
            Ok(()) => {
                debug!(
                    "Checkpoint for {} at tree size {} signed by {}",
                    checkpoint.origin, checkpoint.tree_size, signature.name
                );
                return Ok(checkpoint);
            }
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

fn parse_body(text: &str) -> Result<Checkpoint> {
    let mut lines = text.lines();
    let origin = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| invalid("missing origin line"))?;
    let tree_size = lines
        .next()
        .ok_or_else(|| invalid("missing tree size"))?
        .parse::<u64>()
        .map_err(|e| invalid(format!("invalid tree size: {}", e)))?;
    let root_hash = lines
        .next()
        .ok_or_else(|| invalid("missing root hash"))
        .and_then(|l| BASE64.decode(l).map_err(|e| invalid(format!("invalid root hash: {}", e))))?;

    Ok(Checkpoint {
        origin: origin.to_string(),
        tree_size,
        root_hash,
    })
}

fn parse_signature(line: &str) -> Result<NoteSignature<'_>> {
    let (name, encoded) = line
        .strip_prefix(SIGNATURE_LINE_PREFIX)
        .and_then(|rest| rest.rsplit_once(' '))
        .ok_or_else(|| invalid(format!("malformed signature line {:?}", line)))?;
    let decoded = BASE64
        .decode(encoded)
        .map_err(|e| invalid(format!("invalid signature encoding: {}", e)))?;
    if decoded.len() <= 4 {
        return Err(invalid("signature is too short"));
    }

    let (hint, signature) = decoded.split_at(4);
    let mut key_hint = [0u8; 4];
    key_hint.copy_from_slice(hint);
    Ok(NoteSignature {
        name,
        key_hint,
        signature: signature.to_vec(),
    })
}

/// The key hint is the first four bytes of the SHA-256 of the log's DER
/// public key.
fn verify_signature(signature: &NoteSignature<'_>, signed: &[u8], keys: &KeyMap) -> Result<()> {
    let der = keys
        .values()
        .find(|der| Sha256::digest(der)[..4] == signature.key_hint)
        .ok_or_else(|| {
            invalid(format!(
                "signature from {} uses an unknown key {}",
                signature.name,
                hex::encode(signature.key_hint)
            ))
        })?;

    PublicKey::from_spki_der(der)
        .map_err(|e| invalid(format!("invalid log key: {}", e)))?
        .verify(&signature.signature, signed)
        .map_err(|e| invalid(format!("signature from {} did not verify: {}", signature.name, e)))
}
