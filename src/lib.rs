//! Issue a TLS certificate for a single domain using the ACME DNS-01 challenge.
//!
//! The flow is built for operators who publish the challenge `TXT` record by hand (or with a
//! script) and want the rest to happen unattended:
//!
//! 1. register an ACME account and create an order for one domain;
//! 2. show the `_acme-challenge.<domain>` record that must be published and wait for the operator;
//! 3. poll DNS at a fixed interval until the record is observable;
//! 4. only then ask the CA to validate, finalize the order, and download the certificate.
//!
//! The sequencing lives in [`Orchestrator`]. Everything it talks to sits behind a trait so it can
//! be swapped or mocked:
//!
//! - [`Gateway`] is the ACME protocol. [`AcmeGateway`] implements it against any RFC 8555
//!   directory, e.g. [`DirectoryUrl::LetsEncryptStaging`].
//! - [`TxtResolver`] answers `TXT` queries. [`HickoryResolver`] uses a resolver library,
//!   [`DigResolver`] shells out to `dig`.
//! - [`Checkpoint`] is where the run waits for a human. See [`ConsolePrompt`] and [`Unattended`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use acme_dns01::{
//!     AcmeGateway, ConsolePrompt, DirectoryUrl, HickoryResolver, IssuanceRequest, Orchestrator,
//! };
//!
//! async fn issue() -> eyre::Result<()> {
//!     let resolver = Arc::new(HickoryResolver::new(&[]));
//!     let gateway = AcmeGateway::new(DirectoryUrl::LetsEncryptStaging, resolver.clone());
//!
//!     let mut orchestrator = Orchestrator::new(gateway, resolver, Arc::new(ConsolePrompt));
//!
//!     let request = IssuanceRequest::new("example.org", Some("ops@example.org"));
//!     let cert = orchestrator.issue_certificate(&request).await?;
//!
//!     println!("{}", cert.certificate());
//!     Ok(())
//! }
//! ```
//!
//! # Rate Limits
//!
//! Let's Encrypt applies [rate limits], and a failed validation counts against them. This is why
//! the challenge is only completed after DNS propagation has been observed locally. Use the
//! staging directory while developing.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod acme;
mod cancel;
mod cert;
mod checkpoint;
mod dns;
mod error;
mod gateway;
mod orchestrator;
mod propagation;
mod request;

#[cfg(test)]
mod test;

pub use crate::{
    acme::{AcmeGateway, AcmeOrder, DirectoryUrl},
    cancel::{cancellation, CancelHandle, Cancellation},
    cert::{create_csr, create_p256_key, CertificateRequest, IssuedCertificate},
    checkpoint::{Checkpoint, ConsolePrompt, Unattended},
    dns::{DigResolver, HickoryResolver, TxtLookupError, TxtResolver},
    error::IssuanceError,
    gateway::{Authorization, Challenge, ChallengeKind, ChallengeStatus, Gateway},
    orchestrator::{IssuanceState, Orchestrator},
    propagation::{confirm_propagation, PropagationError, PropagationPolicy, PropagationState},
    request::{ExpectedDnsRecord, IssuanceRequest},
};
