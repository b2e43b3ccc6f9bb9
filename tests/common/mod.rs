#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, CustomExtension, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use sigstore_verdict::record::INTOTO_PAYLOAD_TYPE;
use sigstore_verdict::trust::root::TrustRootBundle;
use sigstore_verdict::trust::{KeyMap, TsaCertificates};
use sigstore_verdict::{
    ArtifactRef, ArtifactSource, BundleMaterial, FetchedRecords, InclusionProof, MetadataClient,
    PolicyEngine, Result, SignedPayload, TimestampAuthority, TimestampToken, TlogEntry,
    TransparencyLogClient, VerificationRecord, VerifyError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use x509_cert::der::asn1::OctetString;
use x509_cert::der::{Decode, Encode};

pub const INTEGRATED_TIME: i64 = 1_720_000_000;
pub const OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";
pub const WORKFLOW: &str = "https://github.com/acme/tool/.github/workflows/release.yml@refs/tags/v1.0.0";

pub fn write(dir: &Path, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// The key artifacts are signed with.
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn new(seed: u8) -> Self {
        Self {
            key: SigningKey::from_slice(&[seed; 32]).unwrap(),
        }
    }

    pub fn public_key_pem(&self) -> String {
        self.key.verifying_key().to_public_key_pem(LineEnding::LF).unwrap()
    }

    pub fn public_key_der(&self) -> Vec<u8> {
        self.key.verifying_key().to_public_key_der().unwrap().as_bytes().to_vec()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.key.sign(message);
        signature.to_der().as_bytes().to_vec()
    }

    /// A TLS-encoded SCT list for the precertificate `tbs`, naming the CT log
    /// whose key is `log_key_der` and signed with this key.
    pub fn sct_list(&self, log_key_der: &[u8], tbs: &[u8], issuer_spki: &[u8]) -> Vec<u8> {
        let timestamp = (INTEGRATED_TIME as u64 * 1000).to_be_bytes();

        let mut signed = vec![0u8, 0];
        signed.extend_from_slice(&timestamp);
        signed.extend_from_slice(&[0, 1]);
        signed.extend_from_slice(&Sha256::digest(issuer_spki));
        let len = tbs.len();
        signed.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        signed.extend_from_slice(tbs);
        signed.extend_from_slice(&[0, 0]);
        let signature = self.sign(&signed);

        let mut sct = vec![0u8];
        sct.extend_from_slice(&Sha256::digest(log_key_der));
        sct.extend_from_slice(&timestamp);
        sct.extend_from_slice(&[0, 0, 4, 3]);
        sct.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        sct.extend_from_slice(&signature);

        let mut list = ((sct.len() + 2) as u16).to_be_bytes().to_vec();
        list.extend_from_slice(&(sct.len() as u16).to_be_bytes());
        list.extend_from_slice(&sct);
        list
    }

    /// A signature over a simple-signing payload naming `manifest_digest`.
    pub fn sign_image(&self, manifest_digest: &str) -> VerificationRecord {
        let payload = json!({
            "critical": {
                "identity": {"docker-reference": "registry.example/img"},
                "image": {"docker-manifest-digest": manifest_digest},
                "type": "cosign container image signature"
            },
            "optional": null
        })
        .to_string()
        .into_bytes();
        VerificationRecord::new(self.sign(&payload), SignedPayload::Blob(payload))
    }

    /// A DSSE-signed in-toto statement about `subject_digest`.
    pub fn attest(&self, predicate_type: &str, subject_digest: &str) -> VerificationRecord {
        let (_, hex) = subject_digest.split_once(':').unwrap();
        let statement = json!({
            "_type": "https://in-toto.io/Statement/v1",
            "predicateType": predicate_type,
            "subject": [{"name": "registry.example/img", "digest": {"sha256": hex}}],
            "predicate": {"builder": {"id": "https://github.com/acme/tool"}}
        })
        .to_string()
        .into_bytes();
        let payload = SignedPayload::Dsse {
            payload_type: INTOTO_PAYLOAD_TYPE.to_string(),
            payload: statement,
        };
        let signature = self.sign(&payload.signed_bytes());
        VerificationRecord::new(signature, payload)
    }
}

fn leaf_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    hasher.finalize().into()
}

fn node_hash(left: &[u8], right: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// A transparency log that countersigns entries with a fixed key.
pub struct FakeLog {
    key: SigningKey,
    der: Vec<u8>,
    pub log_id: String,
}

impl FakeLog {
    pub fn new() -> Self {
        let key = SigningKey::from_slice(&[0x44; 32]).unwrap();
        let der = key.verifying_key().to_public_key_der().unwrap().as_bytes().to_vec();
        let log_id = hex::encode(Sha256::digest(&der));
        Self { key, der, log_id }
    }

    pub fn public_key_pem(&self) -> String {
        self.key.verifying_key().to_public_key_pem(LineEnding::LF).unwrap()
    }

    pub fn public_key_der(&self) -> Vec<u8> {
        self.der.clone()
    }

    pub fn keys(&self) -> KeyMap {
        let mut keys = KeyMap::new();
        keys.insert(self.log_id.clone(), self.der.clone());
        keys
    }

    /// An entry for `record`, with a signed entry timestamp and an inclusion
    /// proof in a two-leaf tree.
    pub fn entry_for(&self, record: &VerificationRecord) -> TlogEntry {
        let signature = BASE64.encode(&record.signature);
        let content_hash = hex::encode(record.payload.sha256());
        let body = match &record.payload {
            SignedPayload::Blob(_) => json!({
                "apiVersion": "0.0.1",
                "kind": "hashedrekord",
                "spec": {
                    "signature": {"content": signature},
                    "data": {"hash": {"algorithm": "sha256", "value": content_hash}}
                }
            }),
            SignedPayload::Dsse { .. } => json!({
                "apiVersion": "0.0.1",
                "kind": "dsse",
                "spec": {
                    "signatures": [{"signature": signature}],
                    "payloadHash": {"algorithm": "sha256", "value": content_hash}
                }
            }),
        }
        .to_string()
        .into_bytes();

        let neighbour = leaf_hash(b"neighbouring entry");
        let root_hash = node_hash(&leaf_hash(&body), &neighbour);

        let log_index = 7;
        let set_payload = format!(
            r#"{{"body":"{}","integratedTime":{},"logID":"{}","logIndex":{}}}"#,
            BASE64.encode(&body),
            INTEGRATED_TIME,
            self.log_id,
            log_index
        );
        let set: Signature = self.key.sign(set_payload.as_bytes());
        let checkpoint = self.checkpoint(2, &root_hash);

        TlogEntry {
            body,
            integrated_time: INTEGRATED_TIME,
            log_index,
            log_id: self.log_id.clone(),
            signed_entry_timestamp: Some(set.to_der().as_bytes().to_vec()),
            inclusion_proof: Some(InclusionProof {
                log_index: 0,
                tree_size: 2,
                root_hash: root_hash.to_vec(),
                hashes: vec![neighbour.to_vec()],
                checkpoint: Some(checkpoint),
            }),
        }
    }

    /// A signed note committing to a tree head.
    pub fn checkpoint(&self, tree_size: u64, root_hash: &[u8]) -> String {
        let text = format!("rekor.example - 42\n{}\n{}\n", tree_size, BASE64.encode(root_hash));
        let signature: Signature = self.key.sign(text.as_bytes());
        let mut blob = Sha256::digest(&self.der)[..4].to_vec();
        blob.extend_from_slice(signature.to_der().as_bytes());
        format!("{}\n\u{2014} rekor.example {}\n", text, BASE64.encode(blob))
    }

    /// `record` with its log entry embedded, as in a sigstore bundle.
    pub fn embed(&self, record: VerificationRecord) -> VerificationRecord {
        let entry = self.entry_for(&record);
        record.with_bundle(BundleMaterial {
            tlog_entry: Some(entry),
            rfc3161_timestamp: None,
        })
    }
}

/// Answers every lookup with one fixed entry.
pub struct FixedLog {
    pub entry: Option<TlogEntry>,
    pub lookups: AtomicUsize,
}

impl FixedLog {
    pub fn new(entry: Option<TlogEntry>) -> Self {
        Self {
            entry,
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TransparencyLogClient for FixedLog {
    async fn lookup_entry(&self, _payload_sha256: &[u8; 32]) -> Result<Option<TlogEntry>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.entry.clone())
    }
}

/// Serves records per artifact name.
#[derive(Default)]
pub struct FakeSource {
    records: HashMap<String, Vec<VerificationRecord>>,
    delay: Option<Duration>,
    pub fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, artifact: &str, records: Vec<VerificationRecord>) -> Self {
        self.records.insert(artifact.to_string(), records);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for FakeSource {
    async fn fetch_records(&self, artifact: &ArtifactRef) -> Result<FetchedRecords> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let records = self.records.get(&artifact.name).cloned().unwrap_or_default();
        Ok(FetchedRecords::new(records))
    }

    fn source_type(&self) -> &'static str {
        "Fake"
    }
}

/// Records every call and never returns material.
#[derive(Default)]
pub struct CountingMetadata {
    pub calls: AtomicUsize,
}

impl CountingMetadata {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn unavailable<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VerifyError::TrustResolution("unreachable in tests".into()))
    }
}

#[async_trait]
impl MetadataClient for CountingMetadata {
    async fn fetch_trusted_root(&self) -> Result<TrustRootBundle> {
        self.unavailable()
    }

    async fn fetch_ca_roots(&self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        self.unavailable()
    }

    async fn fetch_ct_log_keys(&self) -> Result<KeyMap> {
        self.unavailable()
    }

    async fn fetch_tlog_keys(&self) -> Result<KeyMap> {
        self.unavailable()
    }

    async fn fetch_tsa_certificates(&self) -> Result<TsaCertificates> {
        self.unavailable()
    }
}

/// Rejects every payload checked against a policy whose file name contains
/// `deny`.
pub struct DenyingEngine;

impl PolicyEngine for DenyingEngine {
    fn evaluate(&self, _payload: &[u8], policies: &[PathBuf]) -> Vec<String> {
        policies
            .iter()
            .filter(|p| p.to_string_lossy().contains("deny"))
            .map(|p| format!("{} denied the attestation", p.display()))
            .collect()
    }
}

pub struct StaticAuthority(pub TimestampToken);

impl TimestampAuthority for StaticAuthority {
    fn verify_token(&self, _token: &[u8], _signature: &[u8], _certs: &TsaCertificates) -> Result<TimestampToken> {
        Ok(self.0.clone())
    }
}

/// A CT log as named in an SCT, and the key that actually signs it.
pub struct CtLog<'a> {
    pub named: &'a Signer,
    pub signing: &'a Signer,
}

/// Root, intermediate and a code-signing leaf carrying a workflow identity.
pub struct CertificateChain {
    pub root_pem: String,
    pub intermediate_pem: String,
    pub root: Vec<u8>,
    pub intermediate: Vec<u8>,
    pub leaf: Vec<u8>,
    /// Holds the leaf's private key.
    pub leaf_signer: Signer,
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

fn leaf_params(from: i32, until: i32) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.serial_number = Some(SerialNumber::from(vec![0x0f, 0x1e, 0x2d, 0x3c]));
    params.subject_alt_names = vec![SanType::URI(WORKFLOW.try_into().unwrap())];
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::CodeSigning];
    params.custom_extensions = vec![CustomExtension::from_oid_content(
        &[1, 3, 6, 1, 4, 1, 57264, 1, 1],
        OIDC_ISSUER.as_bytes().to_vec(),
    )];
    params.not_before = date_time_ymd(from, 1, 1);
    params.not_after = date_time_ymd(until, 1, 1);
    params
}

impl CertificateChain {
    /// A leaf valid 2024 to 2034 with no SCT.
    pub fn generate() -> Self {
        Self::issue(2024, 2034, None)
    }

    /// A leaf valid from January 1st of `from` to January 1st of `until`,
    /// with an embedded SCT when `ct_log` is given.
    pub fn issue(from: i32, until: i32, ct_log: Option<CtLog<'_>>) -> Self {
        let root_key = KeyPair::generate().unwrap();
        let root = ca("sigstore-test-root").self_signed(&root_key).unwrap();

        let intermediate_key = KeyPair::generate().unwrap();
        let intermediate = ca("sigstore-test-intermediate")
            .signed_by(&intermediate_key, &root, &root_key)
            .unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut params = leaf_params(from, until);
        let mut leaf = params
            .clone()
            .signed_by(&leaf_key, &intermediate, &intermediate_key)
            .unwrap();

        if let Some(ct_log) = ct_log {
            // The precertificate is the same leaf without the SCT list.
            let tbs = x509_cert::Certificate::from_der(leaf.der())
                .unwrap()
                .tbs_certificate
                .to_der()
                .unwrap();
            let issuer_spki = x509_cert::Certificate::from_der(intermediate.der())
                .unwrap()
                .tbs_certificate
                .subject_public_key_info
                .to_der()
                .unwrap();
            let list = ct_log
                .signing
                .sct_list(&ct_log.named.public_key_der(), &tbs, &issuer_spki);
            params.custom_extensions.push(CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 11129, 2, 4, 2],
                OctetString::new(list).unwrap().to_der().unwrap(),
            ));
            leaf = params
                .signed_by(&leaf_key, &intermediate, &intermediate_key)
                .unwrap();
        }

        Self {
            root_pem: root.pem(),
            intermediate_pem: intermediate.pem(),
            root: root.der().to_vec(),
            intermediate: intermediate.der().to_vec(),
            leaf: leaf.der().to_vec(),
            leaf_signer: Signer {
                key: SigningKey::from_pkcs8_der(&leaf_key.serialize_der()).unwrap(),
            },
        }
    }
}

/// A `trusted_root.json` carrying the chain's CA, a CT log and `log`.
pub fn trusted_root_json(chain: &CertificateChain, ct_log_key: &[u8], log: &FakeLog) -> String {
    json!({
        "mediaType": "application/vnd.dev.sigstore.trustedroot+json;version=0.1",
        "tlogs": [{
            "baseUrl": "https://rekor.example",
            "hashAlgorithm": "SHA2_256",
            "publicKey": {"rawBytes": BASE64.encode(log.public_key_der())}
        }],
        "ctlogs": [{
            "baseUrl": "https://ct.example",
            "hashAlgorithm": "SHA2_256",
            "publicKey": {"rawBytes": BASE64.encode(ct_log_key)}
        }],
        "certificateAuthorities": [{
            "uri": "https://fulcio.example",
            "certChain": {"certificates": [
                {"rawBytes": BASE64.encode(&chain.intermediate)},
                {"rawBytes": BASE64.encode(&chain.root)}
            ]}
        }],
        "timestampAuthorities": []
    })
    .to_string()
}
