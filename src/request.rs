use std::fmt;

use crate::error::IssuanceError;

/// Label prepended to the domain to form the DNS-01 record name.
const CHALLENGE_LABEL: &str = "_acme-challenge";

/// Input to a single issuance run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRequest {
    domain: String,
    contact_email: Option<String>,
}

impl IssuanceRequest {
    pub fn new(domain: impl Into<String>, contact_email: Option<&str>) -> Self {
        Self {
            domain: domain.into(),
            contact_email: contact_email.map(str::to_owned),
        }
    }

    /// Domain the certificate is requested for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Contact email for the ACME account, if one was provided.
    pub fn contact_email(&self) -> Option<&str> {
        self.contact_email.as_deref()
    }

    /// Checks the inputs that must be present before any network call is made.
    ///
    /// Returns the ACME contact list (`mailto:` URIs) on success.
    pub(crate) fn validate(&self) -> Result<Vec<String>, IssuanceError> {
        if self.domain.trim().is_empty() {
            return Err(IssuanceError::Configuration(
                "no domain provided (set DOMAIN)".to_owned(),
            ));
        }

        let email = match self.contact_email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => email,
            _ => {
                return Err(IssuanceError::Configuration(
                    "no contact email provided (set EMAIL)".to_owned(),
                ))
            }
        };

        Ok(vec![format!("mailto:{email}")])
    }
}

/// The `TXT` record the operator must publish for the DNS-01 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDnsRecord {
    host: String,
    value: String,
}

impl ExpectedDnsRecord {
    /// Record for `domain` carrying the challenge's key authorization `value`.
    pub fn new(domain: &str, value: impl Into<String>) -> Self {
        Self {
            host: format!("{CHALLENGE_LABEL}.{domain}"),
            value: value.into(),
        }
    }

    /// Fully qualified record name, `_acme-challenge.<domain>`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Always `TXT`.
    pub fn record_type(&self) -> &'static str {
        "TXT"
    }

    /// Expected record content.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// True if any of the observed record contents is exactly the expected value.
    pub fn is_satisfied_by<S: AsRef<str>>(&self, records: &[S]) -> bool {
        records.iter().any(|record| record.as_ref() == self.value)
    }
}

impl fmt::Display for ExpectedDnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {} \"{}\"", self.host, self.record_type(), self.value)
    }
}
