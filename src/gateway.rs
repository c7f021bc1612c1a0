//! The ACME protocol as seen by the orchestrator.

use std::fmt;

use async_trait::async_trait;

use crate::cert::{self, CertificateRequest};

/// Challenge type as advertised by the ACME provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
    Other(String),
}

impl ChallengeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
            ChallengeKind::TlsAlpn01 => "tls-alpn-01",
            ChallengeKind::Other(kind) => kind,
        }
    }
}

impl From<&str> for ChallengeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "http-01" => ChallengeKind::Http01,
            "dns-01" => ChallengeKind::Dns01,
            "tls-alpn-01" => ChallengeKind::TlsAlpn01,
            other => ChallengeKind::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    /// True once the provider has reached a verdict.
    pub fn is_settled(self) -> bool {
        matches!(self, ChallengeStatus::Valid | ChallengeStatus::Invalid)
    }
}

/// One way of proving control over an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub status: ChallengeStatus,
    pub url: String,
    pub token: String,

    /// Problem reported by the provider when validation failed.
    pub error: Option<String>,
}

/// Proof-of-control requirement for one identifier of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub url: String,

    /// Domain name being authorized.
    pub identifier: String,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// Returns the `dns-01` challenge, if one is offered.
    pub fn dns_challenge(&self) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.kind == ChallengeKind::Dns01)
    }

    /// Names of all offered challenge types.
    pub fn offered_kinds(&self) -> Vec<String> {
        self.challenges
            .iter()
            .map(|c| c.kind.as_str().to_owned())
            .collect()
    }
}

/// ACME protocol operations, in the order an issuance run uses them.
///
/// Every call may be slow and may fail. The orchestrator awaits each one to completion before
/// issuing the next; nothing is pipelined.
#[async_trait]
pub trait Gateway: Send {
    /// Handle to an order created by [`create_order`](Gateway::create_order).
    type Order: Send + Sync;

    /// Registers an account, agreeing to the terms of service, with the given `mailto:` contacts.
    async fn create_account(&mut self, contact: &[String]) -> eyre::Result<()>;

    /// Creates an order for a single DNS identifier.
    async fn create_order(&mut self, domain: &str) -> eyre::Result<Self::Order>;

    /// Fetches the authorizations of an order, one per identifier.
    async fn authorizations(&mut self, order: &Self::Order) -> eyre::Result<Vec<Authorization>>;

    /// Computes the value that proves control for `challenge`.
    ///
    /// For `dns-01` this is the `TXT` record content.
    fn key_authorization(&self, challenge: &Challenge) -> eyre::Result<String>;

    /// Client-side check that the challenge proof is in place.
    async fn verify_challenge(
        &mut self,
        authz: &Authorization,
        challenge: &Challenge,
    ) -> eyre::Result<()>;

    /// Tells the provider the challenge is ready to be validated.
    async fn complete_challenge(&mut self, challenge: &Challenge) -> eyre::Result<()>;

    /// Waits until the provider settles the challenge and returns its final state.
    async fn wait_for_valid_status(&mut self, challenge: &Challenge) -> eyre::Result<Challenge>;

    /// Creates a certificate key and a CSR for `domain`.
    fn generate_csr_and_key(&self, domain: &str) -> eyre::Result<CertificateRequest> {
        CertificateRequest::generate(&cert::create_p256_key(), domain)
    }

    /// Submits the CSR and waits for the order to become valid.
    async fn finalize_order(
        &mut self,
        order: &mut Self::Order,
        csr: &CertificateRequest,
    ) -> eyre::Result<()>;

    /// Downloads the issued certificate chain as PEM.
    async fn certificate(&mut self, order: &Self::Order) -> eyre::Result<String>;
}
