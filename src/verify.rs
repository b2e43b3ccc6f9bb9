use crate::control::RunControl;
use crate::identity::CertificateIdentity;
use crate::keys::{KeyProvider, ScopedKey, SignatureVerifier};
use crate::options::VerifyOptions;
use crate::policy::{self, verify_subject_claim, PolicyEngine, PolicyGate, PolicyResult, PolicySet};
use crate::record::VerificationRecord;
use crate::rekor::RekorClient;
use crate::sources::{ArtifactRef, ArtifactSource};
use crate::trust::resolver::TrustResolver;
use crate::trust::root::MetadataClient;
use crate::trust::{TrustAnchor, TrustContext};
use crate::verifiers::certificate::{CertificateCheck, CertificateValidator, CertificateVerifier};
use crate::verifiers::timestamp::{TimestampAuthority, TimestampToken, TimestampVerifier};
use crate::verifiers::tlog::{TlogMode, TlogVerifier, TransparencyLogClient, VerifiedLogEntry};
use crate::{Result, VerifyError};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// External services a run depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ArtifactSource>,
    pub metadata: Arc<dyn MetadataClient>,
    /// Log lookups; a Rekor client is created when unset and lookups are
    /// allowed.
    pub tlog_client: Option<Arc<dyn TransparencyLogClient>>,
    pub timestamp_authority: Option<Arc<dyn TimestampAuthority>>,
    pub key_provider: Option<Arc<dyn KeyProvider>>,
    pub cue_engine: Option<Arc<dyn PolicyEngine>>,
    pub rego_engine: Option<Arc<dyn PolicyEngine>>,
}

impl Collaborators {
    pub fn new(source: Arc<dyn ArtifactSource>, metadata: Arc<dyn MetadataClient>) -> Self {
        Self {
            source,
            metadata,
            tlog_client: None,
            timestamp_authority: None,
            key_provider: None,
            cue_engine: None,
            rego_engine: None,
        }
    }

    pub fn with_tlog_client(mut self, client: Arc<dyn TransparencyLogClient>) -> Self {
        self.tlog_client = Some(client);
        self
    }

    pub fn with_timestamp_authority(mut self, authority: Arc<dyn TimestampAuthority>) -> Self {
        self.timestamp_authority = Some(authority);
        self
    }

    pub fn with_key_provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.key_provider = Some(provider);
        self
    }

    pub fn with_cue_engine(mut self, engine: Arc<dyn PolicyEngine>) -> Self {
        self.cue_engine = Some(engine);
        self
    }

    pub fn with_rego_engine(mut self, engine: Arc<dyn PolicyEngine>) -> Self {
        self.rego_engine = Some(engine);
        self
    }
}

/// A record that passed every configured check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRecord {
    /// Position of the record in the source's record list.
    pub index: usize,
    pub record: VerificationRecord,
    /// Signer identity, for certificate-based anchors.
    pub identity: Option<CertificateIdentity>,
    pub log_entry: Option<VerifiedLogEntry>,
    pub timestamp: Option<TimestampToken>,
}

#[derive(Debug)]
pub struct RecordFailure {
    pub index: usize,
    pub error: VerifyError,
}

/// Outcome of verifying one artifact.
#[derive(Debug)]
pub struct Verdict {
    pub artifact: ArtifactRef,
    pub verified_records: Vec<VerifiedRecord>,
    /// Every verified record was corroborated by a self-contained bundle.
    pub bundle_verified: bool,
    /// The anchor was certificate-based rather than a key.
    pub fulcio_verified: bool,
    pub policy_result: Option<PolicyResult>,
    pub record_errors: Vec<RecordFailure>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        !self.verified_records.is_empty()
            && self.policy_result.as_ref().map_or(true, PolicyResult::is_pass)
    }

    /// Why the artifact failed, or `None` when it passed.
    pub fn failure(&self) -> Option<VerifyError> {
        if self.verified_records.is_empty() {
            return Some(VerifyError::NoVerifiedRecords {
                reference: self.artifact.to_string(),
            });
        }
        match &self.policy_result {
            Some(PolicyResult::Fail { errors }) => {
                Some(VerifyError::ClaimVerification(format!("policy gate failed:\n{}", errors)))
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ArtifactOutcome {
    pub artifact: ArtifactRef,
    pub result: Result<Verdict>,
}

impl ArtifactOutcome {
    pub fn passed(&self) -> bool {
        self.result.as_ref().is_ok_and(Verdict::passed)
    }
}

/// Outcomes in the order the artifacts were given.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<ArtifactOutcome>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(ArtifactOutcome::passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ArtifactOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }
}

/// Drives certificate, signature, log, timestamp, claim and policy checks
/// for every record of every artifact.
pub struct Verifier {
    options: VerifyOptions,
    trust: Arc<TrustContext>,
    policies: PolicySet,
    detached_sct: Option<Vec<u8>>,
    collaborators: Collaborators,
    control: RunControl,
}

impl Verifier {
    pub async fn new(options: VerifyOptions, collaborators: Collaborators) -> Result<Self> {
        let control = RunControl::new(options.timeout);
        Self::with_control(options, collaborators, control).await
    }

    /// Option and collaborator checks come first; nothing is read or fetched
    /// until they pass.
    pub async fn with_control(
        options: VerifyOptions,
        mut collaborators: Collaborators,
        control: RunControl,
    ) -> Result<Self> {
        let policies = match &options.attestation {
            Some(attestation) => PolicySet::partition(&attestation.policies)?,
            None => PolicySet::default(),
        };
        options.trust.validate()?;

        if options.trust.hardware_key && collaborators.key_provider.is_none() {
            return Err(VerifyError::Configuration(
                "a hardware key was requested but no key provider is available".into(),
            ));
        }
        if !policies.cue.is_empty() && collaborators.cue_engine.is_none() {
            return Err(VerifyError::Configuration("no engine available for .cue policies".into()));
        }
        if !policies.rego.is_empty() && collaborators.rego_engine.is_none() {
            return Err(VerifyError::Configuration("no engine available for .rego policies".into()));
        }
        if options.trust.signed_timestamps_enabled() && collaborators.timestamp_authority.is_none() {
            return Err(VerifyError::Configuration(
                "signed timestamps were requested but no timestamp authority is available".into(),
            ));
        }

        let trust = TrustResolver::new(collaborators.metadata.as_ref(), &control)
            .resolve(&options.trust)
            .await?;

        let detached_sct = match &options.sct_ref {
            Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
                VerifyError::Configuration(format!("Failed to read SCT {}: {}", path.display(), e))
            })?),
            None => None,
        };

        if collaborators.tlog_client.is_none()
            && !options.trust.ignore_tlog
            && options.allows_tlog_lookup()
        {
            let client = RekorClient::new(options.rekor_url.as_deref())?;
            collaborators.tlog_client = Some(Arc::new(client));
        }

        Ok(Self {
            options,
            trust: Arc::new(trust),
            policies,
            detached_sct,
            collaborators,
            control,
        })
    }

    pub fn trust_context(&self) -> &TrustContext {
        &self.trust
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Verify every artifact, at most `max_workers` at a time. One
    /// artifact's failure never affects another's outcome.
    pub async fn verify_all(self: &Arc<Self>, artifacts: Vec<ArtifactRef>) -> RunReport {
        let semaphore = Arc::new(Semaphore::new(self.options.max_workers));
        let mut tasks = JoinSet::new();

        for (index, artifact) in artifacts.iter().cloned().enumerate() {
            let verifier = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let step = format!("verifying {}", artifact);
                let result = verifier
                    .control
                    .run(&step, async {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|e| VerifyError::TaskFailed(e.to_string()))?;
                        verifier.verify_artifact(&artifact).await
                    })
                    .await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<Verdict>>> = artifacts.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("Verification task failed: {}", e),
            }
        }

        let outcomes = artifacts
            .into_iter()
            .zip(results)
            .map(|(artifact, result)| ArtifactOutcome {
                result: result.unwrap_or_else(|| {
                    Err(VerifyError::TaskFailed(format!("verification of {} did not complete", artifact)))
                }),
                artifact,
            })
            .collect();

        RunReport { outcomes }
    }

    /// Verify every record of one artifact. Record-level failures exclude
    /// the record; any other error aborts the artifact.
    pub async fn verify_artifact(&self, artifact: &ArtifactRef) -> Result<Verdict> {
        let fetched = self
            .control
            .run(
                "fetching signatures",
                self.collaborators.source.fetch_records(artifact),
            )
            .await?;
        info!(
            "Verifying {} records for {} from {}",
            fetched.records.len(),
            artifact,
            self.collaborators.source.source_type()
        );

        let mut verified_records = Vec::new();
        let mut record_errors = Vec::new();
        for (index, record) in fetched.records.into_iter().enumerate() {
            match self.verify_record(&record, artifact).await {
                Ok((identity, log_entry, timestamp)) => {
                    debug!("Record {} of {} verified", index, artifact);
                    verified_records.push(VerifiedRecord {
                        index,
                        record,
                        identity,
                        log_entry,
                        timestamp,
                    });
                }
                Err(error) if error.is_record_level() => {
                    debug!("Record {} of {} rejected: {}", index, artifact, error);
                    record_errors.push(RecordFailure { index, error });
                }
                Err(error) => return Err(error),
            }
        }

        let bundle_verified = fetched.bundle_verified
            || (!verified_records.is_empty()
                && verified_records.iter().all(|r| {
                    r.log_entry
                        .as_ref()
                        .is_some_and(|entry| entry.mode == TlogMode::Bundle)
                }));

        let policy_result = self.options.attestation.as_ref().map(|attestation| {
            let extraction = policy::extract(
                verified_records.iter().map(|r| (r.index, &r.record)),
                &attestation.predicate_type,
            );
            PolicyGate::new(
                &self.policies,
                self.collaborators.cue_engine.as_deref(),
                self.collaborators.rego_engine.as_deref(),
            )
            .evaluate(extraction, &attestation.predicate_type)
        });

        Ok(Verdict {
            artifact: artifact.clone(),
            verified_records,
            bundle_verified,
            fulcio_verified: self.trust.anchor().is_certificate_based(),
            policy_result,
            record_errors,
        })
    }

    async fn verify_record(
        &self,
        record: &VerificationRecord,
        artifact: &ArtifactRef,
    ) -> Result<(
        Option<CertificateIdentity>,
        Option<VerifiedLogEntry>,
        Option<TimestampToken>,
    )> {
        let signed = record.payload.signed_bytes();

        let certificate = match self.trust.anchor() {
            TrustAnchor::ExplicitKey(key) => {
                key.verify(&record.signature, &signed)?;
                None
            }
            TrustAnchor::HardwareKey { slot } => {
                let provider = self.collaborators.key_provider.as_deref().ok_or_else(|| {
                    VerifyError::Configuration("no key provider is available".into())
                })?;
                let key = ScopedKey::open(provider, slot.as_deref())?;
                key.verify(&record.signature, &signed)?;
                None
            }
            TrustAnchor::ExplicitCertificate { certificate }
            | TrustAnchor::ExplicitCertificateWithChain { certificate, .. } => {
                Some(self.verify_with_certificate(certificate, record)?)
            }
            TrustAnchor::CertificateAuthorityRoots | TrustAnchor::DistributedTrustRoot => {
                let certificate = record.certificate.as_deref().ok_or_else(|| {
                    VerifyError::CertificateValidation("record carries no signing certificate".into())
                })?;
                Some(self.verify_with_certificate(certificate, record)?)
            }
        };

        let log_entry = if self.options.trust.ignore_tlog {
            None
        } else {
            let verifier = TlogVerifier::new(
                self.trust.tlog_keys(),
                self.collaborators.tlog_client.as_deref(),
                self.options.allows_tlog_lookup(),
            );
            match verifier.verify(record, &self.control).await {
                Ok(entry) => Some(entry),
                Err(e @ VerifyError::TlogVerification(_)) if self.options.continue_on_tlog_error => {
                    warn!("Keeping record of {} despite transparency log failure: {}", artifact, e);
                    None
                }
                Err(e) => return Err(e),
            }
        };

        let timestamp = if self.options.trust.signed_timestamps_enabled() {
            let verifier = TimestampVerifier::new(
                self.trust.tsa_certificates(),
                self.collaborators.timestamp_authority.as_deref(),
            );
            Some(verifier.verify(record)?)
        } else {
            None
        };

        let identity = match certificate {
            Some(verifier) => {
                verifier.check_validity(verified_signing_time(log_entry.as_ref(), timestamp.as_ref()))?;
                Some(verifier.into_identity())
            }
            None => None,
        };

        if self.options.check_claims {
            if let Some(digest) = &artifact.digest {
                verify_subject_claim(record, digest)?;
            }
        }

        Ok((identity, log_entry, timestamp))
    }

    fn verify_with_certificate(
        &self,
        certificate: &[u8],
        record: &VerificationRecord,
    ) -> Result<CertificateVerifier> {
        let check = CertificateCheck {
            identities: &self.options.identities,
            ignore_sct: self.options.trust.ignore_sct,
            detached_sct: self.detached_sct.as_deref(),
        };
        let verifier = CertificateValidator::new(&self.trust, check)
            .validate(certificate, record.certificate_chain.as_deref())?;
        verifier.verify(&record.signature, &record.payload.signed_bytes())?;
        Ok(verifier)
    }
}

/// The signing time vouched for by a verified log entry, else by a verified
/// timestamp. Times carried by unverified bundle material never count.
fn verified_signing_time(
    log_entry: Option<&VerifiedLogEntry>,
    timestamp: Option<&TimestampToken>,
) -> Option<i64> {
    log_entry
        .map(|verified| verified.entry.integrated_time)
        .or_else(|| timestamp.map(|token| token.gen_time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ValidationErrors;
    use crate::record::SignedPayload;

    fn verdict(verified: usize, policy_result: Option<PolicyResult>) -> Verdict {
        let record = VerificationRecord::new(b"sig".to_vec(), SignedPayload::Blob(b"data".to_vec()));
        Verdict {
            artifact: ArtifactRef::named("img:v1"),
            verified_records: (0..verified)
                .map(|index| VerifiedRecord {
                    index,
                    record: record.clone(),
                    identity: None,
                    log_entry: None,
                    timestamp: None,
                })
                .collect(),
            bundle_verified: false,
            fulcio_verified: false,
            policy_result,
            record_errors: Vec::new(),
        }
    }

    #[test]
    fn test_verdict_without_records_fails() {
        let verdict = verdict(0, None);
        assert!(!verdict.passed());
        assert!(matches!(
            verdict.failure(),
            Some(VerifyError::NoVerifiedRecords { reference }) if reference == "img:v1"
        ));
    }

    #[test]
    fn test_policy_failure_fails_the_verdict() {
        let mut errors = ValidationErrors::default();
        errors.push(VerifyError::PolicyValidation {
            policy: "deny.rego".into(),
            record: 0,
            messages: vec!["denied".into()],
        });
        let verdict = verdict(1, Some(PolicyResult::Fail { errors }));
        assert!(!verdict.passed());
        assert!(verdict.failure().unwrap().to_string().contains("deny.rego"));

        let verdict = self::verdict(1, Some(PolicyResult::Pass { matches: Vec::new() }));
        assert!(verdict.passed());
        assert!(verdict.failure().is_none());
    }

    #[test]
    fn test_signing_time_comes_from_verified_material() {
        use crate::record::TlogEntry;
        use crate::verifiers::timestamp::ImprintAlgorithm;

        let log_entry = VerifiedLogEntry {
            entry: TlogEntry {
                body: Vec::new(),
                integrated_time: 1_720_000_000,
                log_index: 0,
                log_id: String::new(),
                signed_entry_timestamp: None,
                inclusion_proof: None,
            },
            mode: TlogMode::Bundle,
            inclusion_proven: false,
        };
        let token = TimestampToken {
            gen_time: 1_710_000_000,
            algorithm: ImprintAlgorithm::Sha256,
            message_imprint: Vec::new(),
            signer_certificate: None,
        };

        assert_eq!(verified_signing_time(Some(&log_entry), Some(&token)), Some(1_720_000_000));
        assert_eq!(verified_signing_time(None, Some(&token)), Some(1_710_000_000));
        assert_eq!(verified_signing_time(None, None), None);
    }

    #[test]
    fn test_report_passes_only_when_every_artifact_passes() {
        let report = RunReport {
            outcomes: vec![
                ArtifactOutcome {
                    artifact: ArtifactRef::named("a"),
                    result: Ok(verdict(1, None)),
                },
                ArtifactOutcome {
                    artifact: ArtifactRef::named("b"),
                    result: Err(VerifyError::Cancelled),
                },
            ],
        };
        assert!(!report.passed());
        assert_eq!(report.failed().map(|o| o.artifact.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
    }
}
