use thiserror::Error;

/// Terminal failure of an issuance run.
///
/// Every variant ends the run. Transient DNS lookup failures during propagation polling never
/// show up here; they are absorbed by the poll loop.
#[derive(Debug, Error)]
pub enum IssuanceError {
    /// Required input was missing or unusable. Raised before any ACME call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The ACME provider refused (or could not be reached for) account registration.
    #[error("account registration failed: {0:#}")]
    Registration(eyre::Report),

    /// The ACME provider answered with something the flow cannot continue from.
    #[error("ACME protocol error: {0:#}")]
    Protocol(eyre::Report),

    /// The authorization offers no `dns-01` challenge.
    #[error("no dns-01 challenge offered for '{domain}' (offered: {})", .offered.join(", "))]
    UnsupportedChallenge { domain: String, offered: Vec<String> },

    /// The challenge record never became visible in DNS.
    #[error("TXT record at '{host}' not observed after {attempts} attempts")]
    PropagationTimeout { host: String, attempts: u32 },

    /// The CA rejected the challenge.
    #[error("challenge validation failed: {0:#}")]
    ChallengeFailed(eyre::Report),

    /// CSR submission, order finalization or certificate download failed.
    #[error("order finalization failed: {0:#}")]
    Finalization(eyre::Report),

    /// The run was asked to stop.
    #[error("issuance cancelled")]
    Cancelled,
}

impl IssuanceError {
    /// Stable label for logs and exit reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            IssuanceError::Configuration(_) => "configuration",
            IssuanceError::Registration(_) => "registration",
            IssuanceError::Protocol(_) => "protocol",
            IssuanceError::UnsupportedChallenge { .. } => "unsupported_challenge",
            IssuanceError::PropagationTimeout { .. } => "propagation_timeout",
            IssuanceError::ChallengeFailed(_) => "challenge_failed",
            IssuanceError::Finalization(_) => "finalization",
            IssuanceError::Cancelled => "cancelled",
        }
    }
}
