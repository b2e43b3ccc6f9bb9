//! Signing identities: what a certificate asserts about its subject, and the
//! matchers a verification run accepts.

use crate::{Result, VerifyError};
use regex::Regex;
use std::fmt;
use x509_parser::prelude::*;

const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";
const OID_ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";
const OID_WORKFLOW_TRIGGER: &str = "1.3.6.1.4.1.57264.1.2";
const OID_WORKFLOW_SHA: &str = "1.3.6.1.4.1.57264.1.3";
const OID_WORKFLOW_NAME: &str = "1.3.6.1.4.1.57264.1.4";
const OID_WORKFLOW_REPOSITORY: &str = "1.3.6.1.4.1.57264.1.5";
const OID_WORKFLOW_REF: &str = "1.3.6.1.4.1.57264.1.6";
const OID_ISSUER_V2: &str = "1.3.6.1.4.1.57264.1.8";
const OID_SOURCE_REPOSITORY_DIGEST: &str = "1.3.6.1.4.1.57264.1.13";
const OID_SOURCE_REPOSITORY_REF: &str = "1.3.6.1.4.1.57264.1.14";
const OID_BUILD_TRIGGER: &str = "1.3.6.1.4.1.57264.1.20";

const GITHUB_WORKFLOWS_SEGMENT: &str = "/.github/workflows/";

/// Exact string or unanchored regular expression.
#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn exact(value: impl Into<String>) -> Self {
        Matcher::Exact(value.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|e| VerifyError::Configuration(format!("Invalid identity pattern {}: {}", pattern, e)))
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expected) => expected == value,
            Matcher::Pattern(re) => re.is_match(value),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Exact(s) => write!(f, "{}", s),
            Matcher::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// CI workflow claims recorded by Fulcio. In an [`Identity`] every `Some`
/// field must equal the certificate's value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowClaims {
    pub trigger: Option<String>,
    pub sha: Option<String>,
    pub name: Option<String>,
    pub repository: Option<String>,
    pub git_ref: Option<String>,
}

impl WorkflowClaims {
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == WorkflowClaims::default()
    }

    fn satisfied_by(&self, actual: &WorkflowClaims) -> bool {
        fn claim(expected: &Option<String>, actual: &Option<String>) -> bool {
            expected.is_none() || expected == actual
        }

        !self.is_empty()
            && claim(&self.trigger, &actual.trigger)
            && claim(&self.sha, &actual.sha)
            && claim(&self.name, &actual.name)
            && claim(&self.repository, &actual.repository)
            && claim(&self.git_ref, &actual.git_ref)
    }
}

/// An identity a run is willing to accept.
#[derive(Debug, Clone)]
pub enum Identity {
    Oidc { issuer: Matcher, subject: Matcher },
    Workflow(WorkflowClaims),
}

impl Identity {
    pub fn oidc(issuer: impl Into<String>, subject: impl Into<String>) -> Self {
        Identity::Oidc {
            issuer: Matcher::exact(issuer),
            subject: Matcher::exact(subject),
        }
    }

    pub fn matches(&self, found: &CertificateIdentity) -> bool {
        match self {
            Identity::Oidc { issuer, subject } => {
                found.issuer.as_deref().is_some_and(|i| issuer.matches(i))
                    && found.subjects.iter().any(|s| subject.matches(s))
            }
            Identity::Workflow(claims) => claims.satisfied_by(&found.workflow),
        }
    }
}

/// An empty set accepts any identity.
pub fn matches_any(identities: &[Identity], found: &CertificateIdentity) -> bool {
    identities.is_empty() || identities.iter().any(|identity| identity.matches(found))
}

/// Identity claims extracted from a signing certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub issuer: Option<String>,
    /// SAN email addresses and URIs, in certificate order.
    pub subjects: Vec<String>,
    pub workflow: WorkflowClaims,
}

impl CertificateIdentity {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| {
            VerifyError::CertificateValidation(format!("Failed to parse certificate: {}", e))
        })?;
        Ok(Self::from_certificate(&cert))
    }

    pub fn from_certificate(cert: &X509Certificate<'_>) -> Self {
        let mut identity = CertificateIdentity::default();
        let mut issuer_v2 = None;
        let mut build_trigger = None;
        let mut source_digest = None;
        let mut source_ref = None;

        for ext in cert.extensions() {
            match ext.oid.to_string().as_str() {
                OID_SUBJECT_ALT_NAME => {
                    if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                        for name in &san.general_names {
                            match name {
                                GeneralName::RFC822Name(email) => identity.subjects.push(email.to_string()),
                                GeneralName::URI(uri) => identity.subjects.push(uri.to_string()),
                                _ => {}
                            }
                        }
                    }
                }
                OID_ISSUER_V1 => identity.issuer = raw_string(ext.value),
                OID_ISSUER_V2 => issuer_v2 = der_string(ext.value),
                OID_WORKFLOW_TRIGGER => identity.workflow.trigger = raw_string(ext.value),
                OID_WORKFLOW_SHA => identity.workflow.sha = raw_string(ext.value),
                OID_WORKFLOW_NAME => identity.workflow.name = raw_string(ext.value),
                OID_WORKFLOW_REPOSITORY => identity.workflow.repository = raw_string(ext.value),
                OID_WORKFLOW_REF => identity.workflow.git_ref = raw_string(ext.value),
                OID_BUILD_TRIGGER => build_trigger = der_string(ext.value),
                OID_SOURCE_REPOSITORY_DIGEST => source_digest = der_string(ext.value),
                OID_SOURCE_REPOSITORY_REF => source_ref = der_string(ext.value),
                _ => {}
            }
        }

        // Newer Fulcio certificates only carry the DER-encoded extensions.
        identity.issuer = identity.issuer.or(issuer_v2);
        identity.workflow.trigger = identity.workflow.trigger.or(build_trigger);
        identity.workflow.sha = identity.workflow.sha.or(source_digest);
        identity.workflow.git_ref = identity.workflow.git_ref.or(source_ref);
        identity
    }

    /// Workflow file path of a GitHub Actions signing identity, e.g.
    /// `release.yml` for `https://github.com/o/r/.github/workflows/release.yml@refs/tags/v1`.
    pub fn workflow_path(&self) -> Option<&str> {
        self.subjects.iter().find_map(|uri| {
            uri.split(GITHUB_WORKFLOWS_SEGMENT)
                .nth(1)
                .and_then(|rest| rest.split('@').next())
        })
    }
}

impl fmt::Display for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "issuer={}, subjects=[{}]",
            self.issuer.as_deref().unwrap_or("<none>"),
            self.subjects.join(", ")
        )?;
        if let Some(repo) = &self.workflow.repository {
            write!(f, ", repository={}", repo)?;
        }
        Ok(())
    }
}

fn raw_string(value: &[u8]) -> Option<String> {
    std::str::from_utf8(value).ok().map(str::to_string)
}

/// Decode a DER UTF8String, falling back to the raw bytes.
fn der_string(value: &[u8]) -> Option<String> {
    const UTF8_STRING_TAG: u8 = 0x0c;

    let Some((&UTF8_STRING_TAG, rest)) = value.split_first() else {
        return raw_string(value);
    };
    let (&first, rest) = rest.split_first()?;
    let (len, content) = match first {
        n if n < 0x80 => (n as usize, rest),
        0x81 => (*rest.first()? as usize, &rest[1..]),
        0x82 => {
            let bytes = rest.get(..2)?;
            (((bytes[0] as usize) << 8) | bytes[1] as usize, &rest[2..])
        }
        _ => return None,
    };
    content.get(..len).and_then(raw_string)
}
