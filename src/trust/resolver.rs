//! Resolves the trust anchor and every piece of corroboration material for a
//! run. Each component walks its own ordered list of sources once: explicit
//! file, environment-indicated file, trusted root bundle, individual fetch.

use super::root::{is_self_signed, MetadataClient, TrustRootBundle};
use super::{
    KeyMap, MaterialSource, TrustAnchor, TrustContext, TrustRootOrigin, TrustRootState,
    TsaCertificates,
};
use crate::control::RunControl;
use crate::keys::{self, PublicKey};
use crate::{Result, VerifyError};
use log::{debug, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const ENV_CT_LOG_PUBLIC_KEY_FILE: &str = "SIGSTORE_CT_LOG_PUBLIC_KEY_FILE";
pub const ENV_ROOT_FILE: &str = "SIGSTORE_ROOT_FILE";
pub const ENV_REKOR_PUBLIC_KEY: &str = "SIGSTORE_REKOR_PUBLIC_KEY";
pub const ENV_TSA_CERTIFICATE_FILE: &str = "SIGSTORE_TSA_CERTIFICATE_FILE";

/// Trust overrides taken from the process environment, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub ct_log_public_key_file: Option<PathBuf>,
    pub root_file: Option<PathBuf>,
    pub rekor_public_key: Option<PathBuf>,
    pub tsa_certificate_file: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty()).map(PathBuf::from);
        Self {
            ct_log_public_key_file: get(ENV_CT_LOG_PUBLIC_KEY_FILE),
            root_file: get(ENV_ROOT_FILE),
            rekor_public_key: get(ENV_REKOR_PUBLIC_KEY),
            tsa_certificate_file: get(ENV_TSA_CERTIFICATE_FILE),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == EnvOverrides::default()
    }
}

/// Where trust material may come from.
#[derive(Debug, Clone, Default)]
pub struct TrustConfig {
    pub key_ref: Option<PathBuf>,
    pub hardware_key: bool,
    pub hardware_slot: Option<String>,
    pub cert_ref: Option<PathBuf>,
    pub cert_chain: Option<PathBuf>,
    pub ca_roots: Option<PathBuf>,
    pub ca_intermediates: Option<PathBuf>,
    pub tsa_cert_chain: Option<PathBuf>,
    pub trusted_root: Option<PathBuf>,
    pub use_signed_timestamps: bool,
    pub ignore_sct: bool,
    pub ignore_tlog: bool,
    pub offline: bool,
    pub new_bundle_format: bool,
    pub env: EnvOverrides,
}

impl TrustConfig {
    pub fn signed_timestamps_enabled(&self) -> bool {
        self.use_signed_timestamps || self.tsa_cert_chain.is_some()
    }

    /// Checks that need no I/O.
    pub fn validate(&self) -> Result<()> {
        if self.key_ref.is_some() && self.hardware_key {
            return Err(VerifyError::Configuration(
                "a public key and a hardware security key cannot be used together".into(),
            ));
        }

        if self.new_bundle_format {
            let unsupported = [
                ("certificate", self.cert_ref.is_some(), "cert must be in bundle"),
                ("certificate-chain", self.cert_chain.is_some(), "chain must be in trusted root"),
                ("ca-roots", self.ca_roots.is_some(), "CA roots must be in trusted root"),
                ("ca-intermediates", self.ca_intermediates.is_some(), "CA intermediates must be in trusted root"),
                ("timestamp-certificate-chain", self.tsa_cert_chain.is_some(), "TSA certificates must be in trusted root"),
            ];
            if let Some((option, _, reason)) = unsupported.iter().find(|(_, set, _)| *set) {
                return Err(VerifyError::UnsupportedOption {
                    option: *option,
                    reason: format!("not supported with the new bundle format, {}", reason),
                });
            }
        }

        if (self.key_ref.is_some() || self.hardware_key) && self.cert_ref.is_some() {
            return Err(VerifyError::Configuration(
                "a public key cannot be combined with a certificate".into(),
            ));
        }
        if self.cert_chain.is_some() && self.ca_roots.is_some() {
            return Err(VerifyError::Configuration(
                "a certificate chain and CA roots cannot be used together".into(),
            ));
        }
        if self.ca_intermediates.is_some() && self.ca_roots.is_none() {
            return Err(VerifyError::Configuration(
                "CA intermediates require CA roots".into(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    Certificates,
    CtLogKeys,
    TlogKeys,
    TsaCertificates,
}

impl Component {
    fn name(self) -> &'static str {
        match self {
            Component::Certificates => "CA certificates",
            Component::CtLogKeys => "CT log keys",
            Component::TlogKeys => "transparency log keys",
            Component::TsaCertificates => "TSA certificates",
        }
    }
}

enum Material {
    Certificates {
        roots: Vec<Vec<u8>>,
        intermediates: Vec<Vec<u8>>,
    },
    CtLogKeys(KeyMap),
    TlogKeys(KeyMap),
    Tsa(TsaCertificates),
}

impl Material {
    fn is_empty(&self) -> bool {
        match self {
            Material::Certificates { roots, .. } => roots.is_empty(),
            Material::CtLogKeys(keys) | Material::TlogKeys(keys) => keys.is_empty(),
            Material::Tsa(certs) => certs.is_empty(),
        }
    }

    fn from_bundle(component: Component, bundle: &TrustRootBundle) -> Self {
        match component {
            Component::Certificates => Material::Certificates {
                roots: bundle.ca_roots.clone(),
                intermediates: bundle.ca_intermediates.clone(),
            },
            Component::CtLogKeys => Material::CtLogKeys(bundle.ct_log_keys.clone()),
            Component::TlogKeys => Material::TlogKeys(bundle.tlog_keys.clone()),
            Component::TsaCertificates => Material::Tsa(bundle.tsa.clone()),
        }
    }
}

pub struct TrustResolver<'a> {
    client: &'a dyn MetadataClient,
    control: &'a RunControl,
}

impl<'a> TrustResolver<'a> {
    pub fn new(client: &'a dyn MetadataClient, control: &'a RunControl) -> Self {
        Self { client, control }
    }

    pub async fn resolve(&self, config: &TrustConfig) -> Result<TrustContext> {
        config.validate()?;

        let anchor = select_anchor(config).await?;
        info!("Using trust anchor: {}", anchor);

        let needed = needed_components(config, &anchor);
        let (bundle, trust_root) = self.load_trust_root(config, &needed).await?;
        if config.new_bundle_format && bundle.is_none() {
            return Err(VerifyError::MissingTrustRoot);
        }
        let origin = match &trust_root {
            TrustRootState::Loaded(origin) => Some(origin.clone()),
            _ => None,
        };

        let mut ctx = TrustContext::new(anchor);
        ctx.trust_root = trust_root;

        for component in needed {
            let Some((material, source)) = self
                .resolve_component(component, config, bundle.as_ref(), origin.as_ref())
                .await?
            else {
                warn!("No {} available; dependent checks will fail", component.name());
                continue;
            };
            debug!("Resolved {} from {:?}", component.name(), source);

            match material {
                Material::Certificates {
                    roots,
                    intermediates,
                } => {
                    ctx.root_certificates = roots;
                    ctx.intermediate_certificates = intermediates;
                    ctx.provenance.certificates = Some(source);
                }
                Material::CtLogKeys(keys) => {
                    ctx.ct_log_keys = Some(keys);
                    ctx.provenance.ct_log_keys = Some(source);
                }
                Material::TlogKeys(keys) => {
                    ctx.tlog_keys = Some(keys);
                    ctx.provenance.tlog_keys = Some(source);
                }
                Material::Tsa(certs) => {
                    ctx.tsa_certificates = Some(certs);
                    ctx.provenance.tsa_certificates = Some(source);
                }
            }
        }

        Ok(ctx)
    }

    async fn load_trust_root(
        &self,
        config: &TrustConfig,
        needed: &[Component],
    ) -> Result<(Option<TrustRootBundle>, TrustRootState)> {
        if let Some(path) = &config.trusted_root {
            let bundle = TrustRootBundle::from_path(path).await.map_err(|e| {
                VerifyError::Configuration(format!(
                    "Failed to load trusted root {}: {}",
                    path.display(),
                    e
                ))
            })?;
            return Ok((Some(bundle), TrustRootState::Loaded(TrustRootOrigin::File(path.clone()))));
        }

        if config.offline {
            debug!("Offline run, not fetching the trusted root");
            return Ok((None, TrustRootState::NotRequested));
        }

        if needed.iter().all(|c| has_override(*c, config)) {
            return Ok((None, TrustRootState::NotRequested));
        }

        match self
            .control
            .run("fetching the trusted root", self.client.fetch_trusted_root())
            .await
        {
            Ok(bundle) => Ok((Some(bundle), TrustRootState::Loaded(TrustRootOrigin::Online))),
            Err(VerifyError::Cancelled) => Err(VerifyError::Cancelled),
            Err(e) => {
                warn!("Unable to fetch the trusted root, falling back to individual fetches: {}", e);
                Ok((None, TrustRootState::Unavailable(e.to_string())))
            }
        }
    }

    async fn resolve_component(
        &self,
        component: Component,
        config: &TrustConfig,
        bundle: Option<&TrustRootBundle>,
        origin: Option<&TrustRootOrigin>,
    ) -> Result<Option<(Material, MaterialSource)>> {
        for source in ordered_sources(component, config, origin) {
            let material = match &source {
                MaterialSource::ExplicitFile(path) | MaterialSource::Environment { path, .. } => {
                    Some(load_file(component, path, config).await?)
                }
                MaterialSource::TrustedRoot(_) => bundle
                    .map(|b| Material::from_bundle(component, b))
                    .filter(|m| !m.is_empty()),
                MaterialSource::Fetched => self.fetch(component).await?,
                MaterialSource::Caller => None,
            };
            if let Some(material) = material {
                return Ok(Some((material, source)));
            }
        }
        Ok(None)
    }

    async fn fetch(&self, component: Component) -> Result<Option<Material>> {
        let result = match component {
            Component::Certificates => self
                .control
                .run("fetching CA roots", self.client.fetch_ca_roots())
                .await
                .map(|(roots, intermediates)| Material::Certificates {
                    roots,
                    intermediates,
                }),
            Component::CtLogKeys => self
                .control
                .run("fetching CT log keys", self.client.fetch_ct_log_keys())
                .await
                .map(Material::CtLogKeys),
            Component::TlogKeys => self
                .control
                .run("fetching transparency log keys", self.client.fetch_tlog_keys())
                .await
                .map(Material::TlogKeys),
            Component::TsaCertificates => self
                .control
                .run("fetching TSA certificates", self.client.fetch_tsa_certificates())
                .await
                .map(Material::Tsa),
        };

        match result {
            Ok(material) if !material.is_empty() => Ok(Some(material)),
            Ok(_) => {
                warn!("Fetched {} but the set was empty", component.name());
                Ok(None)
            }
            Err(VerifyError::Cancelled) => Err(VerifyError::Cancelled),
            Err(e) => {
                warn!("Unable to fetch {}: {}", component.name(), e);
                Ok(None)
            }
        }
    }
}

async fn select_anchor(config: &TrustConfig) -> Result<TrustAnchor> {
    if let Some(path) = &config.key_ref {
        return Ok(TrustAnchor::ExplicitKey(keys::load_public_key(path).await?));
    }
    if config.hardware_key {
        return Ok(TrustAnchor::HardwareKey {
            slot: config.hardware_slot.clone(),
        });
    }
    if let Some(path) = &config.cert_ref {
        let certificate = load_certificates(path)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VerifyError::Configuration(format!("No certificate in {}", path.display())))?;
        return Ok(match &config.cert_chain {
            Some(chain_path) => TrustAnchor::ExplicitCertificateWithChain {
                certificate,
                chain: load_certificates(chain_path).await?,
            },
            None => TrustAnchor::ExplicitCertificate { certificate },
        });
    }
    if config.ca_roots.is_some() || config.cert_chain.is_some() {
        return Ok(TrustAnchor::CertificateAuthorityRoots);
    }
    Ok(TrustAnchor::DistributedTrustRoot)
}

fn needed_components(config: &TrustConfig, anchor: &TrustAnchor) -> Vec<Component> {
    let mut needed = Vec::new();
    if anchor.is_certificate_based() {
        needed.push(Component::Certificates);
        if !config.ignore_sct {
            needed.push(Component::CtLogKeys);
        }
    }
    if !config.ignore_tlog {
        needed.push(Component::TlogKeys);
    }
    if config.signed_timestamps_enabled() {
        needed.push(Component::TsaCertificates);
    }
    needed
}

/// Explicit and environment sources, highest precedence first.
fn overrides(component: Component, config: &TrustConfig) -> Vec<MaterialSource> {
    let explicit = match component {
        Component::Certificates => config.cert_chain.as_ref().or(config.ca_roots.as_ref()),
        Component::TsaCertificates => config.tsa_cert_chain.as_ref(),
        Component::CtLogKeys | Component::TlogKeys => None,
    };
    let env = match component {
        Component::Certificates => config.env.root_file.as_ref().map(|p| (ENV_ROOT_FILE, p)),
        Component::CtLogKeys => config
            .env
            .ct_log_public_key_file
            .as_ref()
            .map(|p| (ENV_CT_LOG_PUBLIC_KEY_FILE, p)),
        Component::TlogKeys => config
            .env
            .rekor_public_key
            .as_ref()
            .map(|p| (ENV_REKOR_PUBLIC_KEY, p)),
        Component::TsaCertificates => config
            .env
            .tsa_certificate_file
            .as_ref()
            .map(|p| (ENV_TSA_CERTIFICATE_FILE, p)),
    };

    explicit
        .map(|p| MaterialSource::ExplicitFile(p.clone()))
        .into_iter()
        .chain(env.map(|(variable, path)| MaterialSource::Environment {
            variable,
            path: path.clone(),
        }))
        .collect()
}

fn has_override(component: Component, config: &TrustConfig) -> bool {
    !overrides(component, config).is_empty()
}

fn ordered_sources(
    component: Component,
    config: &TrustConfig,
    origin: Option<&TrustRootOrigin>,
) -> Vec<MaterialSource> {
    let mut sources = overrides(component, config);
    if let Some(origin) = origin {
        sources.push(MaterialSource::TrustedRoot(origin.clone()));
    }
    if !config.offline {
        sources.push(MaterialSource::Fetched);
    }
    sources
}

async fn load_file(component: Component, path: &Path, config: &TrustConfig) -> Result<Material> {
    debug!("Loading {} from {}", component.name(), path.display());
    match component {
        Component::Certificates => {
            let certs = load_certificates(path).await?;
            if config.cert_chain.as_deref() == Some(path) {
                let mut chain = certs;
                let root = chain.pop().into_iter().collect();
                Ok(Material::Certificates {
                    roots: root,
                    intermediates: chain,
                })
            } else if config.ca_roots.as_deref() == Some(path) {
                let intermediates = match &config.ca_intermediates {
                    Some(p) => load_certificates(p).await?,
                    None => Vec::new(),
                };
                Ok(Material::Certificates {
                    roots: certs,
                    intermediates,
                })
            } else {
                let (roots, intermediates) = certs.into_iter().partition(|der| is_self_signed(der));
                Ok(Material::Certificates {
                    roots,
                    intermediates,
                })
            }
        }
        Component::CtLogKeys => Ok(Material::CtLogKeys(load_key_map(path).await?)),
        Component::TlogKeys => Ok(Material::TlogKeys(load_key_map(path).await?)),
        Component::TsaCertificates => Ok(Material::Tsa(TsaCertificates::from_chain(
            load_certificates(path).await?,
        ))),
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| VerifyError::Configuration(format!("Failed to read {}: {}", path.display(), e)))
}

async fn load_certificates(path: &Path) -> Result<Vec<Vec<u8>>> {
    keys::decode_certificates(&read_file(path).await?)
}

/// Load one or more PEM public keys (or a single DER key), keyed by id.
async fn load_key_map(path: &Path) -> Result<KeyMap> {
    let bytes = read_file(path).await?;
    let mut ders = keys::pem_blocks(&bytes, "PUBLIC KEY")?;
    if ders.is_empty() {
        ders.push(bytes);
    }

    let mut map = KeyMap::new();
    for der in ders {
        PublicKey::from_spki_der(&der)?;
        map.insert(keys::key_id(&der), der);
    }
    Ok(map)
}
