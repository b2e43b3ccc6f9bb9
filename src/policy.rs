//! Attestation extraction by predicate type and the policy gate.

use crate::bundle::record_statement;
use crate::record::{SignedPayload, VerificationRecord};
use crate::{Result, VerifyError};
use log::debug;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

const PREDICATE_ALIASES: &[(&str, &str)] = &[
    ("custom", "https://cosign.sigstore.dev/attestation/v1"),
    ("slsaprovenance", "https://slsa.dev/provenance/v0.2"),
    ("slsaprovenance02", "https://slsa.dev/provenance/v0.2"),
    ("slsaprovenance1", "https://slsa.dev/provenance/v1"),
    ("spdx", "https://spdx.dev/Document"),
    ("spdxjson", "https://spdx.dev/Document"),
    ("cyclonedx", "https://cyclonedx.org/bom"),
    ("link", "https://in-toto.io/Link/v1"),
    ("vuln", "https://cosign.sigstore.dev/attestation/vuln/v1"),
    ("openvex", "https://openvex.dev/ns"),
];

/// Map a cosign predicate alias to its URI; anything else is taken as a URI.
pub fn resolve_predicate_alias(name: &str) -> &str {
    PREDICATE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, uri)| *uri)
        .unwrap_or(name)
}

/// The predicate type an attestation run asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateSelector {
    Any,
    Type(String),
}

impl PredicateSelector {
    pub fn parse(value: &str) -> Self {
        match value {
            "any" => PredicateSelector::Any,
            other => PredicateSelector::Type(resolve_predicate_alias(other).to_string()),
        }
    }

    pub fn matches(&self, predicate_type: &str) -> bool {
        match self {
            PredicateSelector::Any => true,
            PredicateSelector::Type(expected) => expected == predicate_type,
        }
    }

    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl Default for PredicateSelector {
    fn default() -> Self {
        PredicateSelector::parse("custom")
    }
}

impl fmt::Display for PredicateSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredicateSelector::Any => f.write_str("any"),
            PredicateSelector::Type(uri) => f.write_str(uri),
        }
    }
}

/// A rule-evaluation engine. Returns one message per violation; empty means
/// the payload satisfies every given policy.
pub trait PolicyEngine: Send + Sync {
    fn evaluate(&self, payload: &[u8], policies: &[PathBuf]) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyLanguage {
    Cue,
    Rego,
}

impl fmt::Display for PolicyLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyLanguage::Cue => f.write_str("cue"),
            PolicyLanguage::Rego => f.write_str("rego"),
        }
    }
}

/// Policies split by extension into the two engine sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    pub cue: Vec<PathBuf>,
    pub rego: Vec<PathBuf>,
}

impl PolicySet {
    pub fn partition(paths: &[PathBuf]) -> Result<Self> {
        let mut set = PolicySet::default();
        for path in paths {
            match language(path) {
                Some(PolicyLanguage::Cue) => set.cue.push(path.clone()),
                Some(PolicyLanguage::Rego) => set.rego.push(path.clone()),
                None => return Err(VerifyError::PolicyFormat(path.clone())),
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.cue.is_empty() && self.rego.is_empty()
    }
}

fn language(path: &Path) -> Option<PolicyLanguage> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("cue") => Some(PolicyLanguage::Cue),
        Some("rego") => Some(PolicyLanguage::Rego),
        _ => None,
    }
}

/// Errors collected across both policy engines.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    errors: Vec<VerifyError>,
}

impl ValidationErrors {
    pub fn push(&mut self, error: VerifyError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VerifyError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<VerifyError> {
        self.errors
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

/// A verified attestation whose predicate type was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationMatch {
    /// Index of the record in the artifact's record list.
    pub record: usize,
    pub predicate_type: String,
    /// The in-toto statement, as signed.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub matches: Vec<AttestationMatch>,
    /// Every predicate type seen, in first-seen order.
    pub observed: Vec<String>,
    /// Records whose payload is not an in-toto statement, with the reason.
    pub unreadable: Vec<(usize, String)>,
}

/// Select the attestations whose predicate type matches `selector`.
pub fn extract<'a>(
    records: impl IntoIterator<Item = (usize, &'a VerificationRecord)>,
    selector: &PredicateSelector,
) -> Extraction {
    let mut extraction = Extraction::default();

    for (index, record) in records {
        let statement = match record_statement(record) {
            Ok(statement) => statement,
            Err(e) => {
                debug!("Record {} is not an attestation: {}", index, e);
                extraction.unreadable.push((index, e.to_string()));
                continue;
            }
        };

        if !extraction.observed.contains(&statement.predicate_type) {
            extraction.observed.push(statement.predicate_type.clone());
        }
        if selector.matches(&statement.predicate_type) {
            extraction.matches.push(AttestationMatch {
                record: index,
                predicate_type: statement.predicate_type,
                payload: record.payload.content().to_vec(),
            });
        }
    }

    extraction
}

#[derive(Debug)]
pub enum PolicyResult {
    Pass { matches: Vec<AttestationMatch> },
    Fail { errors: ValidationErrors },
}

impl PolicyResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, PolicyResult::Pass { .. })
    }

    pub fn errors(&self) -> Option<&ValidationErrors> {
        match self {
            PolicyResult::Pass { .. } => None,
            PolicyResult::Fail { errors } => Some(errors),
        }
    }

    pub fn matched_predicate_types(&self) -> Vec<&str> {
        match self {
            PolicyResult::Pass { matches } => matches.iter().map(|m| m.predicate_type.as_str()).collect(),
            PolicyResult::Fail { .. } => Vec::new(),
        }
    }
}

pub struct PolicyGate<'a> {
    policies: &'a PolicySet,
    cue: Option<&'a dyn PolicyEngine>,
    rego: Option<&'a dyn PolicyEngine>,
}

impl<'a> PolicyGate<'a> {
    pub fn new(
        policies: &'a PolicySet,
        cue: Option<&'a dyn PolicyEngine>,
        rego: Option<&'a dyn PolicyEngine>,
    ) -> Self {
        Self {
            policies,
            cue,
            rego,
        }
    }

    /// Run every policy against every match. Nothing short-circuits: the
    /// result carries one error per failing (policy, record) pair, plus one
    /// per record that could not be read as a statement.
    pub fn evaluate(&self, extraction: Extraction, selector: &PredicateSelector) -> PolicyResult {
        let mut errors = ValidationErrors::default();

        for (record, reason) in &extraction.unreadable {
            errors.push(VerifyError::InvalidRecord(format!(
                "record {} cannot be converted to a policy payload: {}",
                record, reason
            )));
        }

        if extraction.matches.is_empty() {
            errors.push(VerifyError::PredicateTypeMismatch {
                requested: selector.describe(),
                observed: extraction.observed,
            });
            return PolicyResult::Fail { errors };
        }

        let mut accepted = Vec::new();
        for candidate in extraction.matches {
            let before = errors.len();
            self.apply(PolicyLanguage::Cue, &self.policies.cue, self.cue, &candidate, &mut errors);
            self.apply(PolicyLanguage::Rego, &self.policies.rego, self.rego, &candidate, &mut errors);
            if errors.len() == before {
                accepted.push(candidate);
            }
        }

        if errors.is_empty() && !accepted.is_empty() {
            PolicyResult::Pass { matches: accepted }
        } else {
            PolicyResult::Fail { errors }
        }
    }

    fn apply(
        &self,
        language: PolicyLanguage,
        policies: &[PathBuf],
        engine: Option<&dyn PolicyEngine>,
        candidate: &AttestationMatch,
        errors: &mut ValidationErrors,
    ) {
        for policy in policies {
            let messages = match engine {
                Some(engine) => engine.evaluate(&candidate.payload, std::slice::from_ref(policy)),
                None => vec![format!("no {} policy engine configured", language)],
            };
            if !messages.is_empty() {
                debug!(
                    "Policy {} rejected record {}: {}",
                    policy.display(),
                    candidate.record,
                    messages.join("; ")
                );
                errors.push(VerifyError::PolicyValidation {
                    policy: policy.clone(),
                    record: candidate.record,
                    messages,
                });
            }
        }
    }
}

/// Check that a verified record makes claims about `digest`
/// (`algorithm:hex`): the in-toto subject for attestations, the
/// `docker-manifest-digest` of a simple-signing payload otherwise.
pub fn verify_subject_claim(record: &VerificationRecord, digest: &str) -> Result<()> {
    if record.payload.is_attestation() {
        let statement = record_statement(record)
            .map_err(|e| VerifyError::ClaimVerification(e.to_string()))?;
        if !statement.has_subject_digest(digest) {
            return Err(VerifyError::ClaimVerification(format!(
                "attestation subject does not include {}",
                digest
            )));
        }
        return Ok(());
    }

    let SignedPayload::Blob(content) = &record.payload else {
        return Ok(());
    };
    let claimed = serde_json::from_slice::<Value>(content).ok().and_then(|v| {
        v.pointer("/critical/image/docker-manifest-digest")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    match claimed {
        Some(claimed) if !claimed.eq_ignore_ascii_case(digest) => Err(VerifyError::ClaimVerification(
            format!("signed digest {} does not match {}", claimed, digest),
        )),
        _ => Ok(()),
    }
}
