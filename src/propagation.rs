//! Polling DNS until the challenge record is observable.

use std::time::Duration;

use crate::{cancel::Cancellation, dns::TxtResolver, request::ExpectedDnsRecord};

/// How often, and how many times, to look for the challenge record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationPolicy {
    /// Number of lookups before giving up.
    pub max_attempts: u32,

    /// Fixed pause between two lookups.
    pub interval: Duration,
}

impl Default for PropagationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(30),
        }
    }
}

/// Progress of the poll loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationState {
    /// Number of lookups made so far.
    pub attempt: u32,
    pub verified: bool,
}

/// Why the poll loop stopped without seeing the record.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PropagationError {
    #[error("TXT record at '{host}' not observed after {attempts} attempts")]
    Timeout { host: String, attempts: u32 },

    #[error("propagation check cancelled")]
    Cancelled,
}

/// Looks up `record` until its value is observed or `policy.max_attempts` lookups have failed.
///
/// A lookup error counts as "not propagated yet" for that attempt. The loop sleeps
/// `policy.interval` between attempts, never after the last one, and stops early with
/// [`PropagationError::Cancelled`] if `cancel` fires.
pub async fn confirm_propagation<R>(
    resolver: &R,
    record: &ExpectedDnsRecord,
    policy: &PropagationPolicy,
    cancel: &Cancellation,
) -> Result<PropagationState, PropagationError>
where
    R: TxtResolver + ?Sized,
{
    let mut state = PropagationState::default();

    while state.attempt < policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(PropagationError::Cancelled);
        }

        state.attempt += 1;

        match resolver.resolve_txt(record.host()).await {
            Ok(records) if record.is_satisfied_by(&records) => {
                log::info!(
                    "attempt {}/{}: TXT record at {} found",
                    state.attempt,
                    policy.max_attempts,
                    record.host(),
                );
                state.verified = true;
                return Ok(state);
            }

            Ok(records) => {
                log::info!(
                    "attempt {}/{}: expected value not among {} TXT record(s) at {}",
                    state.attempt,
                    policy.max_attempts,
                    records.len(),
                    record.host(),
                );
            }

            Err(err) => {
                log::warn!(
                    "attempt {}/{}: DNS propagation not yet complete ({err})",
                    state.attempt,
                    policy.max_attempts,
                );
            }
        }

        if state.attempt < policy.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PropagationError::Cancelled),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    Err(PropagationError::Timeout {
        host: record.host().to_owned(),
        attempts: state.attempt,
    })
}
