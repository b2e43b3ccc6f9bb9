//! RFC3161 signed timestamps over record signatures.

use super::certificate::build_path;
use crate::record::VerificationRecord;
use crate::trust::TsaCertificates;
use crate::{Result, VerifyError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::debug;
use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_parser::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImprintAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl ImprintAlgorithm {
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ImprintAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            ImprintAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            ImprintAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// The parts of a timestamp token the verifier needs once its CMS
/// signature has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampToken {
    /// Generation time, unix seconds.
    pub gen_time: i64,
    pub algorithm: ImprintAlgorithm,
    pub message_imprint: Vec<u8>,
    /// DER signer certificate embedded in the token, if any.
    pub signer_certificate: Option<Vec<u8>>,
}

/// Parses an RFC3161 response and checks its CMS signature.
pub trait TimestampAuthority: Send + Sync {
    fn verify_token(
        &self,
        token: &[u8],
        signature: &[u8],
        certs: &TsaCertificates,
    ) -> Result<TimestampToken>;
}

fn invalid(msg: impl Into<String>) -> VerifyError {
    VerifyError::TimestampVerification(msg.into())
}

pub struct TimestampVerifier<'a> {
    certs: Option<&'a TsaCertificates>,
    authority: Option<&'a dyn TimestampAuthority>,
}

impl<'a> TimestampVerifier<'a> {
    pub fn new(
        certs: Option<&'a TsaCertificates>,
        authority: Option<&'a dyn TimestampAuthority>,
    ) -> Self {
        Self { certs, authority }
    }

    pub fn verify(&self, record: &VerificationRecord) -> Result<TimestampToken> {
        let raw = record
            .rfc3161_timestamp()
            .ok_or_else(|| invalid("record has no RFC3161 timestamp"))?;
        let certs = self
            .certs
            .filter(|c| !c.is_empty())
            .ok_or_else(|| invalid("no timestamp authority certificates available"))?;
        let authority = self
            .authority
            .ok_or_else(|| invalid("no timestamp authority configured"))?;

        let token = authority
            .verify_token(raw, &record.signature, certs)
            .map_err(|e| match e {
                VerifyError::TimestampVerification(_) => e,
                other => invalid(other.to_string()),
            })?;

        check_imprint(&token, &record.signature)?;

        let signer = token
            .signer_certificate
            .as_deref()
            .or(certs.leaf.as_deref())
            .ok_or_else(|| invalid("no timestamp signing certificate available"))?;
        let path = build_path(signer, &certs.intermediates, &certs.roots)
            .map_err(|e| invalid(format!("signing certificate does not chain to a TSA root: {}", e)))?;

        let (_, leaf) = &path[0];
        let validity = leaf.validity();
        if token.gen_time < validity.not_before.timestamp()
            || token.gen_time > validity.not_after.timestamp()
        {
            return Err(invalid(format!(
                "timestamp {} is outside the TSA certificate validity ({} to {})",
                token.gen_time, validity.not_before, validity.not_after
            )));
        }

        debug!("RFC3161 timestamp verified, generated at {}", token.gen_time);
        Ok(token)
    }
}

/// Blob signers timestamp the base64 text of the signature rather than the
/// raw bytes; both are accepted.
fn check_imprint(token: &TimestampToken, signature: &[u8]) -> Result<()> {
    let raw = token.algorithm.digest(signature);
    let encoded = token.algorithm.digest(BASE64.encode(signature).as_bytes());
    if token.message_imprint != raw && token.message_imprint != encoded {
        return Err(invalid("message imprint does not match the signature"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BundleMaterial, SignedPayload};
    use rcgen::{
        date_time_ymd, BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose,
        IsCa, KeyPair, KeyUsagePurpose,
    };

    struct Tsa {
        root: Vec<u8>,
        leaf: Vec<u8>,
    }

    fn tsa(name: &str) -> Tsa {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(2040, 1, 1);
        let root_key = KeyPair::generate().unwrap();
        let root = params.self_signed(&root_key).unwrap();

        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "tsa signer");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::TimeStamping];
        params.not_before = date_time_ymd(2023, 1, 1);
        params.not_after = date_time_ymd(2030, 1, 1);
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = params.signed_by(&leaf_key, &root, &root_key).unwrap();

        Tsa {
            root: root.der().to_vec(),
            leaf: leaf.der().to_vec(),
        }
    }

    struct StaticAuthority(TimestampToken);

    impl TimestampAuthority for StaticAuthority {
        fn verify_token(&self, _token: &[u8], _signature: &[u8], _certs: &TsaCertificates) -> Result<TimestampToken> {
            Ok(self.0.clone())
        }
    }

    fn record() -> VerificationRecord {
        VerificationRecord::new(b"signature".to_vec(), SignedPayload::Blob(b"data".to_vec())).with_bundle(
            BundleMaterial {
                tlog_entry: None,
                rfc3161_timestamp: Some(b"token".to_vec()),
            },
        )
    }

    fn token(tsa: &Tsa, imprint: Vec<u8>) -> TimestampToken {
        TimestampToken {
            gen_time: 1_720_000_000,
            algorithm: ImprintAlgorithm::Sha256,
            message_imprint: imprint,
            signer_certificate: Some(tsa.leaf.clone()),
        }
    }

    fn certs(tsa: &Tsa) -> TsaCertificates {
        TsaCertificates::from_chain(vec![tsa.leaf.clone(), tsa.root.clone()])
    }

    #[test]
    fn test_raw_and_base64_imprints_verify() {
        let tsa = tsa("tsa root");
        let certs = certs(&tsa);

        for imprint in [
            Sha256::digest(b"signature").to_vec(),
            Sha256::digest(BASE64.encode(b"signature").as_bytes()).to_vec(),
        ] {
            let authority = StaticAuthority(token(&tsa, imprint));
            let verified = TimestampVerifier::new(Some(&certs), Some(&authority))
                .verify(&record())
                .unwrap();
            assert_eq!(verified.gen_time, 1_720_000_000);
        }
    }

    #[test]
    fn test_imprint_over_other_data_fails() {
        let tsa = tsa("tsa root");
        let certs = certs(&tsa);
        let authority = StaticAuthority(token(&tsa, Sha256::digest(b"other").to_vec()));

        let err = TimestampVerifier::new(Some(&certs), Some(&authority))
            .verify(&record())
            .unwrap_err();
        assert!(err.to_string().contains("message imprint"));
    }

    #[test]
    fn test_gen_time_outside_signer_validity() {
        let tsa = tsa("tsa root");
        let certs = certs(&tsa);
        let mut token = token(&tsa, Sha256::digest(b"signature").to_vec());
        // 2035, after the signer expired
        token.gen_time = 2_050_000_000;
        let authority = StaticAuthority(token);

        let err = TimestampVerifier::new(Some(&certs), Some(&authority))
            .verify(&record())
            .unwrap_err();
        assert!(matches!(err, VerifyError::TimestampVerification(_)));
    }

    #[test]
    fn test_signer_from_other_tsa_fails() {
        let trusted = tsa("tsa root");
        let rogue = tsa("tsa root");
        let certs = certs(&trusted);
        let authority = StaticAuthority(token(&rogue, Sha256::digest(b"signature").to_vec()));

        let err = TimestampVerifier::new(Some(&certs), Some(&authority))
            .verify(&record())
            .unwrap_err();
        assert!(err.to_string().contains("does not chain"));
    }

    #[test]
    fn test_missing_token_or_certificates() {
        let tsa = tsa("tsa root");
        let certs = certs(&tsa);
        let authority = StaticAuthority(token(&tsa, Vec::new()));

        let bare = VerificationRecord::new(b"signature".to_vec(), SignedPayload::Blob(b"data".to_vec()));
        let err = TimestampVerifier::new(Some(&certs), Some(&authority))
            .verify(&bare)
            .unwrap_err();
        assert!(err.to_string().contains("no RFC3161 timestamp"));

        let err = TimestampVerifier::new(None, Some(&authority))
            .verify(&record())
            .unwrap_err();
        assert!(err.to_string().contains("certificates"));
    }
}
