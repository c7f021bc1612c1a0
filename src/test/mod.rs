//! Test doubles shared by the unit tests.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use der::EncodePem as _;
use parking_lot::Mutex;
use x509_cert::{
    builder::{Builder as _, CertificateBuilder, Profile},
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
};

use crate::{
    cancel::CancelHandle,
    cert::CertificateRequest,
    checkpoint::Checkpoint,
    dns::{TxtLookupError, TxtResolver},
    gateway::{Authorization, Challenge, ChallengeKind, ChallengeStatus, Gateway},
    request::ExpectedDnsRecord,
};


pub(crate) use self::acme_server::{
    with_directory_server, with_directory_server_opts, ServerOptions, TestServer,
};

/// PEM of a self-signed certificate for `domain`, valid from now for `days`.
pub(crate) fn self_signed_pem(signer: &p256::ecdsa::SigningKey, domain: &str, days: u64) -> String {
    let subject = format!("CN={domain}").parse::<Name>().unwrap();
    let spki = SubjectPublicKeyInfoOwned::from_key(signer.verifying_key().to_owned()).unwrap();
    let validity = Validity::from_now(Duration::from_secs(days * 24 * 60 * 60)).unwrap();

    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::new(&[0x01, 0x42]).unwrap(),
        validity,
        subject,
        spki,
        signer,
    )
    .unwrap();

    builder
        .build::<p256::ecdsa::DerSignature>()
        .unwrap()
        .to_pem(pem::LineEnding::LF)
        .unwrap()
}

/// One scripted answer of a [`ScriptedResolver`].
#[derive(Debug, Clone)]
pub(crate) enum Lookup {
    Records(Vec<&'static str>),
    Fail,
}

/// Resolver that replays a fixed sequence of answers and records every query.
///
/// Once the script runs out it answers with no records, or keeps repeating the answer given to
/// [`ScriptedResolver::repeating`].
#[derive(Debug, Default)]
pub(crate) struct ScriptedResolver {
    script: Mutex<VecDeque<Lookup>>,
    repeat: Option<Lookup>,
    hosts: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    pub(crate) fn new(script: impl IntoIterator<Item = Lookup>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    pub(crate) fn repeating(lookup: Lookup) -> Self {
        Self {
            repeat: Some(lookup),
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.hosts.lock().len()
    }

    pub(crate) fn hosts(&self) -> Vec<String> {
        self.hosts.lock().clone()
    }
}

#[async_trait]
impl TxtResolver for ScriptedResolver {
    async fn resolve_txt(&self, host: &str) -> Result<Vec<String>, TxtLookupError> {
        self.hosts.lock().push(host.to_owned());

        let next = self.script.lock().pop_front().or_else(|| self.repeat.clone());

        match next {
            Some(Lookup::Records(records)) => Ok(records.into_iter().map(str::to_owned).collect()),
            Some(Lookup::Fail) => Err(TxtLookupError::Resolve {
                host: host.to_owned(),
                message: "SERVFAIL".to_owned(),
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// A DNS zone the operator edits by hand.
///
/// As a [`Checkpoint`] it publishes the expected record when asked to confirm it; as a
/// [`TxtResolver`] it serves whatever has been published.
#[derive(Debug, Default)]
pub(crate) struct FakeZone {
    records: Mutex<Vec<(String, String)>>,
    confirmations: Mutex<usize>,
}

impl FakeZone {
    pub(crate) fn confirmations(&self) -> usize {
        *self.confirmations.lock()
    }
}

#[async_trait]
impl Checkpoint for FakeZone {
    async fn confirm_published(&self, record: &ExpectedDnsRecord) -> eyre::Result<()> {
        *self.confirmations.lock() += 1;
        self.records
            .lock()
            .push((record.host().to_owned(), record.value().to_owned()));
        Ok(())
    }
}

#[async_trait]
impl TxtResolver for FakeZone {
    async fn resolve_txt(&self, host: &str) -> Result<Vec<String>, TxtLookupError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, value)| value.clone())
            .collect())
    }
}

/// How a test [`Checkpoint`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Confirm {
    /// Returns at once.
    Immediately,

    /// Never returns.
    Never,

    /// Fails as if stdin was closed.
    InputClosed,
}

#[derive(Debug)]
pub(crate) struct TestCheckpoint {
    confirm: Confirm,
    seen: Mutex<Vec<ExpectedDnsRecord>>,
}

impl TestCheckpoint {
    pub(crate) fn new(confirm: Confirm) -> Self {
        Self {
            confirm,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn seen(&self) -> Vec<ExpectedDnsRecord> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Checkpoint for TestCheckpoint {
    async fn confirm_published(&self, record: &ExpectedDnsRecord) -> eyre::Result<()> {
        self.seen.lock().push(record.clone());

        match self.confirm {
            Confirm::Immediately => Ok(()),
            Confirm::Never => std::future::pending().await,
            Confirm::InputClosed => eyre::bail!("stdin closed before the DNS record was confirmed"),
        }
    }
}

/// Ordered names of the [`Gateway`] methods a [`MockGateway`] has seen.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    fn push(&self, call: &'static str) {
        self.0.lock().push(call);
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.0.lock().iter().filter(|c| **c == call).count()
    }
}

pub(crate) fn challenge(kind: &str, status: ChallengeStatus) -> Challenge {
    Challenge {
        kind: ChallengeKind::from(kind),
        status,
        url: format!("https://ca.test/chall/{kind}"),
        token: format!("token-{kind}"),
        error: None,
    }
}

pub(crate) fn authorization(domain: &str, kinds: &[&str]) -> Authorization {
    Authorization {
        url: "https://ca.test/authz/1".to_owned(),
        identifier: domain.to_owned(),
        challenges: kinds
            .iter()
            .map(|kind| challenge(kind, ChallengeStatus::Pending))
            .collect(),
    }
}

/// Scripted [`Gateway`] that records every call.
#[derive(Debug)]
pub(crate) struct MockGateway {
    pub log: CallLog,
    pub authorizations: Vec<Authorization>,
    pub key_authorization: String,

    /// Status returned by `wait_for_valid_status`.
    pub settled: ChallengeStatus,

    /// Name of the method that fails, if any.
    pub fail_on: Option<&'static str>,

    /// Method during which cancellation is requested; the call itself still succeeds.
    pub cancel_in: Option<(&'static str, CancelHandle)>,
    pub certificate: String,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            log: CallLog::default(),
            authorizations: vec![authorization("example.test", &["http-01", "dns-01"])],
            key_authorization: "abc123".to_owned(),
            settled: ChallengeStatus::Valid,
            fail_on: None,
            cancel_in: None,
            certificate: "-----BEGIN CERTIFICATE-----\nMOCK\n-----END CERTIFICATE-----\n".to_owned(),
        }
    }
}

impl MockGateway {
    fn call(&self, name: &'static str) -> eyre::Result<()> {
        self.log.push(name);

        if let Some((_, handle)) = self.cancel_in.as_ref().filter(|(call, _)| *call == name) {
            handle.cancel();
        }

        if self.fail_on == Some(name) {
            eyre::bail!("{name} failed");
        }

        Ok(())
    }
}

/// Order handle of a [`MockGateway`].
#[derive(Debug)]
pub(crate) struct MockOrder {
    pub domain: String,
    pub finalized: bool,
}

#[async_trait]
impl Gateway for MockGateway {
    type Order = MockOrder;

    async fn create_account(&mut self, _contact: &[String]) -> eyre::Result<()> {
        self.call("create_account")
    }

    async fn create_order(&mut self, domain: &str) -> eyre::Result<MockOrder> {
        self.call("create_order")?;
        Ok(MockOrder {
            domain: domain.to_owned(),
            finalized: false,
        })
    }

    async fn authorizations(&mut self, _order: &MockOrder) -> eyre::Result<Vec<Authorization>> {
        self.call("authorizations")?;
        Ok(self.authorizations.clone())
    }

    fn key_authorization(&self, _challenge: &Challenge) -> eyre::Result<String> {
        self.call("key_authorization")?;
        Ok(self.key_authorization.clone())
    }

    async fn verify_challenge(
        &mut self,
        _authz: &Authorization,
        _challenge: &Challenge,
    ) -> eyre::Result<()> {
        self.call("verify_challenge")
    }

    async fn complete_challenge(&mut self, _challenge: &Challenge) -> eyre::Result<()> {
        self.call("complete_challenge")
    }

    async fn wait_for_valid_status(&mut self, challenge: &Challenge) -> eyre::Result<Challenge> {
        self.call("wait_for_valid_status")?;

        let error = (self.settled == ChallengeStatus::Invalid)
            .then(|| "urn:ietf:params:acme:error:unauthorized: no TXT record".to_owned());

        Ok(Challenge {
            status: self.settled,
            error,
            ..challenge.clone()
        })
    }

    fn generate_csr_and_key(&self, domain: &str) -> eyre::Result<CertificateRequest> {
        self.call("generate_csr_and_key")?;
        CertificateRequest::generate(&crate::cert::create_p256_key(), domain)
    }

    async fn finalize_order(
        &mut self,
        order: &mut MockOrder,
        csr: &CertificateRequest,
    ) -> eyre::Result<()> {
        self.call("finalize_order")?;
        assert_eq!(csr.domain(), order.domain);
        order.finalized = true;
        Ok(())
    }

    async fn certificate(&mut self, order: &MockOrder) -> eyre::Result<String> {
        self.call("certificate")?;
        assert!(order.finalized, "certificate requested before finalization");
        Ok(self.certificate.clone())
    }
}
