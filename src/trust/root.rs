//! The sigstore `trusted_root.json` document and the clients that fetch trust
//! material from the distribution service.

use super::{KeyMap, TsaCertificates};
use crate::keys::key_id;
use crate::{Result, VerifyError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::debug;
use serde::Deserialize;
use sigstore::trust::sigstore::SigstoreTrustRoot;
use sigstore::trust::TrustRoot;
use std::path::{Path, PathBuf};
use x509_parser::prelude::*;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustedRootDocument {
    #[serde(default)]
    tlogs: Vec<TransparencyLogInstance>,
    #[serde(default)]
    certificate_authorities: Vec<CertificateAuthority>,
    #[serde(default)]
    ctlogs: Vec<TransparencyLogInstance>,
    #[serde(default)]
    timestamp_authorities: Vec<CertificateAuthority>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransparencyLogInstance {
    #[serde(default)]
    base_url: String,
    public_key: PublicKeyMaterial,
    #[serde(default)]
    log_id: Option<LogId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyMaterial {
    raw_bytes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogId {
    key_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateAuthority {
    #[serde(default)]
    uri: String,
    cert_chain: CertChain,
}

#[derive(Debug, Deserialize)]
struct CertChain {
    #[serde(default)]
    certificates: Vec<RawCertificate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCertificate {
    raw_bytes: String,
}

/// Trust material extracted from a `trusted_root.json` document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustRootBundle {
    pub ca_roots: Vec<Vec<u8>>,
    pub ca_intermediates: Vec<Vec<u8>>,
    pub ct_log_keys: KeyMap,
    pub tlog_keys: KeyMap,
    pub tsa: TsaCertificates,
}

impl TrustRootBundle {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let doc: TrustedRootDocument = serde_json::from_slice(bytes)?;
        let mut bundle = TrustRootBundle::default();

        for ca in doc.certificate_authorities {
            debug!("Loading certificate authority {}", ca.uri);
            let mut chain = decode_chain(&ca.cert_chain)?;
            if let Some(root) = chain.pop() {
                bundle.ca_roots.push(root);
            }
            bundle.ca_intermediates.extend(chain);
        }

        bundle.tlog_keys = key_map(&doc.tlogs)?;
        bundle.ct_log_keys = key_map(&doc.ctlogs)?;

        for tsa in doc.timestamp_authorities {
            debug!("Loading timestamp authority {}", tsa.uri);
            let certs = TsaCertificates::from_chain(decode_chain(&tsa.cert_chain)?);
            if bundle.tsa.leaf.is_none() {
                bundle.tsa.leaf = certs.leaf;
            }
            bundle.tsa.intermediates.extend(certs.intermediates);
            bundle.tsa.roots.extend(certs.roots);
        }

        Ok(bundle)
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_json(&bytes)
    }
}

fn decode_chain(chain: &CertChain) -> Result<Vec<Vec<u8>>> {
    chain
        .certificates
        .iter()
        .map(|c| decode_raw("certificate", &c.raw_bytes))
        .collect()
}

fn key_map(logs: &[TransparencyLogInstance]) -> Result<KeyMap> {
    let mut keys = KeyMap::new();
    for log in logs {
        let der = decode_raw("public key", &log.public_key.raw_bytes)?;
        let id = match &log.log_id {
            Some(log_id) => hex::encode(decode_raw("log id", &log_id.key_id)?),
            None => key_id(&der),
        };
        debug!("Loaded log key {} for {}", id, log.base_url);
        keys.insert(id, der);
    }
    Ok(keys)
}

fn decode_raw(what: &str, data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| VerifyError::Configuration(format!("Invalid {} in trusted root: {}", what, e)))
}

/// Client for the trust-material distribution service. Every call is
/// independent and best-effort; callers degrade on failure.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn fetch_trusted_root(&self) -> Result<TrustRootBundle>;

    /// Returns `(roots, intermediates)`.
    async fn fetch_ca_roots(&self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)>;

    async fn fetch_ct_log_keys(&self) -> Result<KeyMap>;

    async fn fetch_tlog_keys(&self) -> Result<KeyMap>;

    async fn fetch_tsa_certificates(&self) -> Result<TsaCertificates>;
}

/// Fetches the public-good Sigstore trust root through TUF.
#[derive(Debug, Clone, Default)]
pub struct SigstoreTufClient {
    cache_dir: Option<PathBuf>,
}

impl SigstoreTufClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sigstore-verdict-tuf"))
    }

    /// Refresh `trusted_root.json` in the cache directory. The TUF client
    /// checks the target against the signed metadata before writing it.
    async fn load(&self) -> Result<(SigstoreTrustRoot, PathBuf)> {
        let dir = self.cache_dir();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("Fetching Sigstore trust root into {}", dir.display());
        let root = SigstoreTrustRoot::new(Some(&dir))
            .await
            .map_err(|e| VerifyError::TrustResolution(format!("Failed to fetch Sigstore trust root: {}", e)))?;
        Ok((root, dir.join(TRUSTED_ROOT_TARGET)))
    }
}

const TRUSTED_ROOT_TARGET: &str = "trusted_root.json";

pub(crate) fn is_self_signed(der: &[u8]) -> bool {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert.subject().as_raw() == cert.issuer().as_raw())
        .unwrap_or(false)
}

fn ids_for(keys: impl IntoIterator<Item = Vec<u8>>) -> KeyMap {
    keys.into_iter().map(|der| (key_id(&der), der)).collect()
}

#[async_trait]
impl MetadataClient for SigstoreTufClient {
    async fn fetch_trusted_root(&self) -> Result<TrustRootBundle> {
        let (root, target) = self.load().await?;
        match TrustRootBundle::from_path(&target).await {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                debug!("Reading {} failed, using the TUF client accessors: {}", target.display(), e);
                bundle_from_accessors(&root)
            }
        }
    }

    async fn fetch_ca_roots(&self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let bundle = self.fetch_trusted_root().await?;
        Ok((bundle.ca_roots, bundle.ca_intermediates))
    }

    async fn fetch_ct_log_keys(&self) -> Result<KeyMap> {
        Ok(self.fetch_trusted_root().await?.ct_log_keys)
    }

    async fn fetch_tlog_keys(&self) -> Result<KeyMap> {
        Ok(self.fetch_trusted_root().await?.tlog_keys)
    }

    async fn fetch_tsa_certificates(&self) -> Result<TsaCertificates> {
        let tsa = self.fetch_trusted_root().await?.tsa;
        if tsa.is_empty() {
            return Err(VerifyError::TrustResolution(
                "the Sigstore trust root lists no timestamp authorities".into(),
            ));
        }
        Ok(tsa)
    }
}

/// Everything but the timestamp authorities, which the accessors do not expose.
fn bundle_from_accessors(root: &SigstoreTrustRoot) -> Result<TrustRootBundle> {
    let (ca_roots, ca_intermediates) = split_authorities(root)?;
    let tlog_keys = root
        .rekor_keys()
        .map_err(|e| VerifyError::TrustResolution(format!("Failed to get Rekor keys: {}", e)))?;
    let ct_log_keys = root
        .ctfe_keys()
        .map_err(|e| VerifyError::TrustResolution(format!("Failed to get CT log keys: {}", e)))?;

    Ok(TrustRootBundle {
        ca_roots,
        ca_intermediates,
        ct_log_keys: ids_for(ct_log_keys.into_iter().map(<[u8]>::to_vec)),
        tlog_keys: ids_for(tlog_keys.into_iter().map(<[u8]>::to_vec)),
        tsa: TsaCertificates::default(),
    })
}

fn split_authorities(root: &SigstoreTrustRoot) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let certs = root
        .fulcio_certs()
        .map_err(|e| VerifyError::TrustResolution(format!("Failed to get Fulcio certs: {}", e)))?;

    Ok(certs
        .iter()
        .map(|c| c.as_ref().to_vec())
        .partition(|der| is_self_signed(der)))
}

/// A metadata client for runs that must never touch the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineMetadataClient;

impl OfflineMetadataClient {
    fn unavailable<T>() -> Result<T> {
        Err(VerifyError::TrustResolution("trust material fetching is disabled".into()))
    }
}

#[async_trait]
impl MetadataClient for OfflineMetadataClient {
    async fn fetch_trusted_root(&self) -> Result<TrustRootBundle> {
        Self::unavailable()
    }

    async fn fetch_ca_roots(&self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        Self::unavailable()
    }

    async fn fetch_ct_log_keys(&self) -> Result<KeyMap> {
        Self::unavailable()
    }

    async fn fetch_tlog_keys(&self) -> Result<KeyMap> {
        Self::unavailable()
    }

    async fn fetch_tsa_certificates(&self) -> Result<TsaCertificates> {
        Self::unavailable()
    }
}
