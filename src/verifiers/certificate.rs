//! Certificate chain, X.509 profile, SCT and identity checks for
//! certificate-based trust anchors.

use super::sct::{verify_detached_sct, verify_embedded_sct};
use crate::identity::{matches_any, CertificateIdentity, Identity};
use crate::keys::{PublicKey, SignatureVerifier};
use crate::trust::{TrustAnchor, TrustContext};
use crate::{Result, VerifyError};
use log::debug;
use std::time::{SystemTime, UNIX_EPOCH};
use x509_parser::prelude::*;

const MAX_CHAIN_DEPTH: usize = 8;

fn invalid(msg: impl Into<String>) -> VerifyError {
    VerifyError::CertificateValidation(msg.into())
}

/// Per-run settings for certificate validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertificateCheck<'a> {
    pub identities: &'a [Identity],
    pub ignore_sct: bool,
    /// Detached SCT (JSON) used instead of the embedded SCT list.
    pub detached_sct: Option<&'a [u8]>,
}

pub struct CertificateValidator<'a> {
    ctx: &'a TrustContext,
    check: CertificateCheck<'a>,
}

impl<'a> CertificateValidator<'a> {
    pub fn new(ctx: &'a TrustContext, check: CertificateCheck<'a>) -> Self {
        Self { ctx, check }
    }

    /// Validate `leaf_der` and return a verifier bound to its public key.
    ///
    /// `record_chain` holds certificates shipped with the record; they are
    /// only ever used as untrusted intermediates. Validity windows are not
    /// checked here: the signing time is only trustworthy once the log entry
    /// or timestamp carrying it has been verified, so callers finish with
    /// [`CertificateVerifier::check_validity`].
    pub fn validate(
        &self,
        leaf_der: &[u8],
        record_chain: Option<&[Vec<u8>]>,
    ) -> Result<CertificateVerifier> {
        let (roots, mut intermediates) = match self.ctx.anchor() {
            TrustAnchor::ExplicitCertificateWithChain { chain, .. } => {
                let (root, rest) = chain
                    .split_last()
                    .ok_or_else(|| invalid("certificate chain is empty"))?;
                (vec![root.clone()], rest.to_vec())
            }
            _ => (
                self.ctx.root_certificates().to_vec(),
                self.ctx.intermediate_certificates().to_vec(),
            ),
        };
        if roots.is_empty() {
            return Err(invalid("no trusted root certificates available"));
        }
        if let Some(extra) = record_chain {
            intermediates.extend(
                extra
                    .iter()
                    .filter(|der| der.as_slice() != leaf_der && !roots.contains(*der))
                    .cloned(),
            );
        }

        let path = build_path(leaf_der, &intermediates, &roots)?;
        debug!("Built certificate path of length {}", path.len());

        let validity = path.iter().map(|(_, cert)| ValidityWindow::of(cert)).collect();

        let (_, leaf) = &path[0];
        check_leaf_profile(leaf)?;

        if self.check.ignore_sct {
            debug!("Skipping SCT verification");
        } else {
            let ct_keys = self
                .ctx
                .ct_log_keys()
                .ok_or_else(|| invalid("no CT log public keys available to verify the SCT"))?;
            match self.check.detached_sct {
                Some(sct) => verify_detached_sct(leaf_der, sct, ct_keys)?,
                None => {
                    let (issuer_der, _) = path
                        .get(1)
                        .ok_or_else(|| invalid("cannot verify embedded SCT without an issuer certificate"))?;
                    verify_embedded_sct(leaf_der, issuer_der, ct_keys)?;
                }
            }
        }

        let identity = CertificateIdentity::from_certificate(leaf);
        if !matches_any(self.check.identities, &identity) {
            return Err(VerifyError::IdentityMismatch {
                found: identity.to_string(),
            });
        }

        let key = PublicKey::from_spki(leaf.public_key())
            .map_err(|e| invalid(format!("Unusable certificate key: {}", e)))?;

        Ok(CertificateVerifier {
            key,
            identity,
            validity,
        })
    }
}

#[derive(Debug, Clone)]
struct ValidityWindow {
    subject: String,
    not_before: i64,
    not_after: i64,
}

impl ValidityWindow {
    fn of(cert: &X509Certificate<'_>) -> Self {
        let validity = cert.validity();
        Self {
            subject: cert.subject().to_string(),
            not_before: validity.not_before.timestamp(),
            not_after: validity.not_after.timestamp(),
        }
    }
}

/// A signature verifier bound to a validated certificate.
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    key: PublicKey,
    identity: CertificateIdentity,
    /// Leaf first, root last.
    validity: Vec<ValidityWindow>,
}

impl CertificateVerifier {
    /// Every certificate in the path must be valid at `signing_time` (unix
    /// seconds), or now when no verified signing time is known.
    pub fn check_validity(&self, signing_time: Option<i64>) -> Result<()> {
        let at = signing_time.unwrap_or_else(now);
        for window in &self.validity {
            if at < window.not_before || at > window.not_after {
                return Err(invalid(format!(
                    "certificate {} is not valid at {} (valid {} to {})",
                    window.subject, at, window.not_before, window.not_after
                )));
            }
        }
        Ok(())
    }

    pub fn identity(&self) -> &CertificateIdentity {
        &self.identity
    }

    pub fn into_identity(self) -> CertificateIdentity {
        self.identity
    }
}

impl SignatureVerifier for CertificateVerifier {
    fn verify(&self, signature: &[u8], message: &[u8]) -> Result<()> {
        self.key.verify(signature, message)
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| invalid(format!("Failed to parse certificate: {}", e)))
}

fn parse_all(ders: &[Vec<u8>]) -> Result<Vec<(&[u8], X509Certificate<'_>)>> {
    ders.iter()
        .map(|der| Ok((der.as_slice(), parse(der)?)))
        .collect()
}

fn issued_by(child: &X509Certificate<'_>, parent: &X509Certificate<'_>) -> bool {
    child.issuer().as_raw() == parent.subject().as_raw()
        && child.verify_signature(Some(parent.public_key())).is_ok()
}

fn is_ca(cert: &X509Certificate<'_>) -> bool {
    matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca)
}

/// Build a path from `leaf` to one of `roots`, verifying the signature of
/// every link. The returned path starts at the leaf and ends at the root.
pub(crate) fn build_path<'a>(
    leaf: &'a [u8],
    intermediates: &'a [Vec<u8>],
    roots: &'a [Vec<u8>],
) -> Result<Vec<(&'a [u8], X509Certificate<'a>)>> {
    let roots = parse_all(roots)?;
    let intermediates = parse_all(intermediates)?;
    let mut path = vec![(leaf, parse(leaf)?)];

    if roots.iter().any(|(der, _)| *der == leaf) {
        return Ok(path);
    }

    for _ in 0..MAX_CHAIN_DEPTH {
        let Some((_, current)) = path.last() else {
            break;
        };

        if let Some(root) = roots.iter().find(|(_, root)| issued_by(current, root)) {
            let root = root.clone();
            path.push(root);
            return Ok(path);
        }

        let next = intermediates
            .iter()
            .filter(|(der, cert)| is_ca(cert) && !path.iter().any(|(seen, _)| seen == der))
            .find(|(_, cert)| issued_by(current, cert))
            .cloned();

        match next {
            Some(intermediate) => path.push(intermediate),
            None => {
                return Err(invalid(format!(
                    "no trusted issuer found for {}",
                    current.subject()
                )))
            }
        }
    }

    Err(invalid("certificate chain exceeds the maximum depth"))
}

fn check_leaf_profile(leaf: &X509Certificate<'_>) -> Result<()> {
    match leaf.key_usage() {
        Ok(Some(ku)) if ku.value.digital_signature() => {}
        _ => return Err(invalid("certificate key usage does not include digitalSignature")),
    }
    match leaf.extended_key_usage() {
        Ok(Some(eku)) if eku.value.code_signing => {}
        _ => return Err(invalid("certificate extended key usage does not include codeSigning")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::KeyMap;
    use rcgen::{
        date_time_ymd, BasicConstraints, CertificateParams, CustomExtension, DnType,
        ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
    };

    const ISSUER: &str = "https://token.actions.githubusercontent.com";
    const SUBJECT: &str = "https://github.com/acme/tool/.github/workflows/release.yml@refs/tags/v1.0.0";

    struct Chain {
        root: Vec<u8>,
        intermediate: Vec<u8>,
        leaf: Vec<u8>,
    }

    fn ca(name: &str) -> CertificateParams {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(2040, 1, 1);
        params
    }

    fn chain(code_signing: bool) -> Chain {
        let root_key = KeyPair::generate().unwrap();
        let root = ca("root").self_signed(&root_key).unwrap();

        let intermediate_key = KeyPair::generate().unwrap();
        let intermediate = ca("intermediate")
            .signed_by(&intermediate_key, &root, &root_key)
            .unwrap();

        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.subject_alt_names = vec![SanType::URI(SUBJECT.try_into().unwrap())];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        if code_signing {
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::CodeSigning];
        }
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            &[1, 3, 6, 1, 4, 1, 57264, 1, 1],
            ISSUER.as_bytes().to_vec(),
        )];
        params.not_before = date_time_ymd(2024, 1, 1);
        params.not_after = date_time_ymd(2034, 1, 1);
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = params
            .signed_by(&leaf_key, &intermediate, &intermediate_key)
            .unwrap();

        Chain {
            root: root.der().to_vec(),
            intermediate: intermediate.der().to_vec(),
            leaf: leaf.der().to_vec(),
        }
    }

    fn context(chain: &Chain) -> TrustContext {
        TrustContext::new(TrustAnchor::CertificateAuthorityRoots)
            .with_certificates(vec![chain.root.clone()], vec![chain.intermediate.clone()])
    }

    const SIGNED_AT: i64 = 1_720_000_000;

    fn no_sct<'a>(identities: &'a [Identity]) -> CertificateCheck<'a> {
        CertificateCheck {
            identities,
            ignore_sct: true,
            detached_sct: None,
        }
    }

    #[test]
    fn test_valid_chain_and_identity() {
        let chain = chain(true);
        let ctx = context(&chain);
        let identities = [Identity::oidc(ISSUER, SUBJECT)];

        let verifier = CertificateValidator::new(&ctx, no_sct(&identities))
            .validate(&chain.leaf, None)
            .unwrap();
        assert_eq!(verifier.identity().issuer.as_deref(), Some(ISSUER));
        assert_eq!(verifier.identity().subjects, vec![SUBJECT.to_string()]);
    }

    #[test]
    fn test_intermediate_from_record_chain() {
        let chain = chain(true);
        let ctx = TrustContext::new(TrustAnchor::CertificateAuthorityRoots)
            .with_certificates(vec![chain.root.clone()], Vec::new());

        let validator = CertificateValidator::new(&ctx, no_sct(&[]));
        assert!(validator.validate(&chain.leaf, None).is_err());

        let shipped = vec![chain.intermediate.clone(), chain.root.clone()];
        validator
            .validate(&chain.leaf, Some(&shipped))
            .unwrap();
    }

    #[test]
    fn test_untrusted_root_is_rejected() {
        let chain = chain(true);
        let other = self::chain(true);
        let ctx = TrustContext::new(TrustAnchor::CertificateAuthorityRoots)
            .with_certificates(vec![other.root.clone()], vec![chain.intermediate.clone()]);

        let err = CertificateValidator::new(&ctx, no_sct(&[]))
            .validate(&chain.leaf, None)
            .unwrap_err();
        assert!(matches!(err, VerifyError::CertificateValidation(_)));
    }

    #[test]
    fn test_explicit_chain_anchor() {
        let chain = chain(true);
        let ctx = TrustContext::new(TrustAnchor::ExplicitCertificateWithChain {
            certificate: chain.leaf.clone(),
            chain: vec![chain.intermediate.clone(), chain.root.clone()],
        });

        CertificateValidator::new(&ctx, no_sct(&[]))
            .validate(&chain.leaf, None)
            .unwrap();
    }

    #[test]
    fn test_validity_at_signing_time() {
        let chain = chain(true);
        let ctx = context(&chain);
        let verifier = CertificateValidator::new(&ctx, no_sct(&[]))
            .validate(&chain.leaf, None)
            .unwrap();

        verifier.check_validity(Some(SIGNED_AT)).unwrap();
        verifier.check_validity(None).unwrap();
        // 2040-06-01, after every certificate expired
        let err = verifier.check_validity(Some(2_222_000_000)).unwrap_err();
        assert!(err.to_string().contains("not valid at"));
        // 2020-09-13, before the leaf was issued
        assert!(verifier.check_validity(Some(1_600_000_000)).is_err());
    }

    #[test]
    fn test_leaf_without_code_signing() {
        let chain = chain(false);
        let ctx = context(&chain);
        let err = CertificateValidator::new(&ctx, no_sct(&[]))
            .validate(&chain.leaf, None)
            .unwrap_err();
        assert!(err.to_string().contains("codeSigning"));
    }

    #[test]
    fn test_identity_mismatch() {
        let chain = chain(true);
        let ctx = context(&chain);
        let identities = [Identity::oidc("https://accounts.google.com", "someone@example.com")];

        let err = CertificateValidator::new(&ctx, no_sct(&identities))
            .validate(&chain.leaf, None)
            .unwrap_err();
        match err {
            VerifyError::IdentityMismatch { found } => assert!(found.contains(SUBJECT)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sct_required_by_default() {
        let chain = chain(true);
        let check = CertificateCheck {
            identities: &[],
            ignore_sct: false,
            detached_sct: None,
        };

        let ctx = context(&chain);
        let err = CertificateValidator::new(&ctx, check)
            .validate(&chain.leaf, None)
            .unwrap_err();
        assert!(err.to_string().contains("no CT log public keys"));

        let mut keys = KeyMap::new();
        keys.insert("00".repeat(32), vec![0u8; 4]);
        let ctx = context(&chain).with_ct_log_keys(keys);
        let err = CertificateValidator::new(&ctx, check)
            .validate(&chain.leaf, None)
            .unwrap_err();
        assert!(err.to_string().contains("missing an embedded SCT"));
    }
}
