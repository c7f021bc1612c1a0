//! Sequencing of one issuance run.

use std::sync::Arc;

use eyre::eyre;

use crate::{
    cancel::Cancellation,
    cert::IssuedCertificate,
    checkpoint::Checkpoint,
    dns::TxtResolver,
    error::IssuanceError,
    gateway::{ChallengeStatus, Gateway},
    propagation::{confirm_propagation, PropagationError, PropagationPolicy},
    request::{ExpectedDnsRecord, IssuanceRequest},
};

/// Progress of an issuance run.
///
/// States are ordered; a run only ever moves forward, or to [`Failed`](IssuanceState::Failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IssuanceState {
    Init,
    Registered,
    OrderCreated,
    ChallengeSelected,
    AwaitingOperator,
    Polling,
    PropagationVerified,
    ChallengeCompleted,
    Issued,
    Failed,
}

/// Drives a single-domain DNS-01 issuance from account registration to certificate download.
///
/// The CA is only asked to validate once the challenge record has been observed in DNS.
pub struct Orchestrator<G, R: ?Sized, C: ?Sized> {
    gateway: G,
    resolver: Arc<R>,
    checkpoint: Arc<C>,
    policy: PropagationPolicy,
    cancel: Cancellation,
    state: IssuanceState,
    history: Vec<IssuanceState>,
}

impl<G, R, C> Orchestrator<G, R, C>
where
    G: Gateway,
    R: TxtResolver + ?Sized,
    C: Checkpoint + ?Sized,
{
    pub fn new(gateway: G, resolver: Arc<R>, checkpoint: Arc<C>) -> Self {
        Self {
            gateway,
            resolver,
            checkpoint,
            policy: PropagationPolicy::default(),
            cancel: Cancellation::never(),
            state: IssuanceState::Init,
            history: vec![IssuanceState::Init],
        }
    }

    pub fn with_policy(mut self, policy: PropagationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// State reached by the last (or current) run.
    pub fn state(&self) -> IssuanceState {
        self.state
    }

    /// Every state the last run went through, starting with `Init`.
    pub fn history(&self) -> &[IssuanceState] {
        &self.history
    }

    /// Runs the whole flow for `request`.
    ///
    /// The checkpoint and the propagation poll are the only waits and both end early on
    /// cancellation. Cancellation is checked again before each call that asks the CA to act.
    pub async fn issue_certificate(
        &mut self,
        request: &IssuanceRequest,
    ) -> Result<IssuedCertificate, IssuanceError> {
        self.state = IssuanceState::Init;
        self.history = vec![IssuanceState::Init];

        let result = self.run(request).await;

        if let Err(err) = &result {
            log::error!("issuance for {} failed ({}): {err}", request.domain(), err.kind());
            self.transition(IssuanceState::Failed);
        }

        result
    }

    async fn run(&mut self, request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        let contact = request.validate()?;
        let domain = request.domain();

        if self.policy.max_attempts == 0 {
            return Err(IssuanceError::Configuration(
                "propagation max attempts must be at least 1".to_owned(),
            ));
        }

        self.ensure_not_cancelled()?;
        self.gateway
            .create_account(&contact)
            .await
            .map_err(IssuanceError::Registration)?;
        self.transition(IssuanceState::Registered);

        let mut order = self
            .gateway
            .create_order(domain)
            .await
            .map_err(IssuanceError::Protocol)?;
        self.transition(IssuanceState::OrderCreated);

        let authorizations = self
            .gateway
            .authorizations(&order)
            .await
            .map_err(IssuanceError::Protocol)?;

        if authorizations.len() > 1 {
            log::warn!(
                "order has {} authorizations, using the first",
                authorizations.len()
            );
        }

        let authz = authorizations
            .into_iter()
            .next()
            .ok_or_else(|| IssuanceError::Protocol(eyre!("order has no authorizations")))?;

        let challenge = authz
            .dns_challenge()
            .cloned()
            .ok_or_else(|| IssuanceError::UnsupportedChallenge {
                domain: domain.to_owned(),
                offered: authz.offered_kinds(),
            })?;
        self.transition(IssuanceState::ChallengeSelected);

        let value = self
            .gateway
            .key_authorization(&challenge)
            .map_err(IssuanceError::Protocol)?;
        let record = ExpectedDnsRecord::new(domain, value);

        self.transition(IssuanceState::AwaitingOperator);
        log::info!("waiting for operator to publish {record}");
        self.await_operator(&record).await?;

        self.transition(IssuanceState::Polling);
        let propagation = confirm_propagation(&*self.resolver, &record, &self.policy, &self.cancel)
            .await
            .map_err(|err| match err {
                PropagationError::Timeout { host, attempts } => {
                    IssuanceError::PropagationTimeout { host, attempts }
                }
                PropagationError::Cancelled => IssuanceError::Cancelled,
            })?;
        log::info!("DNS record observed after {} attempt(s)", propagation.attempt);
        self.transition(IssuanceState::PropagationVerified);

        self.ensure_not_cancelled()?;
        self.gateway
            .verify_challenge(&authz, &challenge)
            .await
            .map_err(IssuanceError::ChallengeFailed)?;

        self.ensure_not_cancelled()?;
        self.gateway
            .complete_challenge(&challenge)
            .await
            .map_err(IssuanceError::ChallengeFailed)?;

        let settled = self
            .gateway
            .wait_for_valid_status(&challenge)
            .await
            .map_err(IssuanceError::ChallengeFailed)?;

        if settled.status != ChallengeStatus::Valid {
            return Err(IssuanceError::ChallengeFailed(eyre!(
                "challenge ended {:?}: {}",
                settled.status,
                settled.error.as_deref().unwrap_or("no error reported")
            )));
        }
        self.transition(IssuanceState::ChallengeCompleted);

        let csr = self
            .gateway
            .generate_csr_and_key(domain)
            .map_err(IssuanceError::Finalization)?;

        self.ensure_not_cancelled()?;
        self.gateway
            .finalize_order(&mut order, &csr)
            .await
            .map_err(IssuanceError::Finalization)?;

        let certificate = self
            .gateway
            .certificate(&order)
            .await
            .map_err(IssuanceError::Finalization)?;
        self.transition(IssuanceState::Issued);

        Ok(csr.into_issued(certificate))
    }

    async fn await_operator(&self, record: &ExpectedDnsRecord) -> Result<(), IssuanceError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IssuanceError::Cancelled),
            res = self.checkpoint.confirm_published(record) => res.map_err(|err| {
                log::warn!("no confirmation from operator: {err:#}");
                IssuanceError::Cancelled
            }),
        }
    }

    fn ensure_not_cancelled(&self) -> Result<(), IssuanceError> {
        if self.cancel.is_cancelled() {
            Err(IssuanceError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: IssuanceState) {
        debug_assert!(next > self.state, "{:?} -> {next:?}", self.state);

        log::info!("{:?} -> {next:?}", self.state);
        self.state = next;
        self.history.push(next);
    }
}
