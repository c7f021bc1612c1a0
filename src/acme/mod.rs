//! [`Gateway`] over an RFC 8555 directory.

use std::{sync::Arc, time::Duration};

use base64::prelude::*;
use eyre::{eyre, WrapErr as _};

use crate::{
    cert::CertificateRequest,
    dns::TxtResolver,
    gateway::{Authorization, Challenge, ChallengeKind, ChallengeStatus, Gateway},
    request::ExpectedDnsRecord,
};

mod api;
mod jws;
mod key;
mod transport;

use self::{
    key::AccountKey,
    transport::{expect_header, handle_error, http_client, NoncePool, Transport},
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Status polls before a challenge or order that does not settle is an error.
const MAX_POLLS: usize = 60;

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryUrl {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates. The root signing
    /// certificate is not supposed to be in any trust chains.
    LetsEncryptStaging,

    /// Provide an arbitrary directory URL to connect to.
    Other(String),
}

impl DirectoryUrl {
    pub fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// An order created through [`AcmeGateway`].
#[derive(Debug, Clone)]
pub struct AcmeOrder {
    url: String,
    api: api::Order,
}

impl AcmeOrder {
    /// The order URL, from the `Location` header of the newOrder response.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Registered account state, created by `create_account`.
#[derive(Debug)]
struct Session {
    transport: Transport,
    directory: api::Directory,
}

/// [`Gateway`] speaking to an ACME directory over HTTPS.
///
/// Nothing touches the network until [`Gateway::create_account`], which fetches the directory and
/// registers a fresh P-256 account key. The key lives only as long as the gateway.
pub struct AcmeGateway {
    directory_url: DirectoryUrl,
    verifier: Arc<dyn TxtResolver>,
    poll_delay: Duration,
    session: Option<Session>,
}

impl AcmeGateway {
    /// `verifier` answers the `TXT` lookup made by [`Gateway::verify_challenge`].
    pub fn new(directory_url: DirectoryUrl, verifier: Arc<dyn TxtResolver>) -> Self {
        Self {
            directory_url,
            verifier,
            poll_delay: Duration::from_secs(5),
            session: None,
        }
    }

    /// Pause between two status polls of a challenge or order. Defaults to 5 seconds.
    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    fn session(&self) -> eyre::Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| eyre!("no ACME account registered"))
    }

    async fn fetch_directory(&self) -> eyre::Result<(reqwest::Client, api::Directory)> {
        let url = self.directory_url.to_url();
        let client = http_client()?;

        log::debug!("fetching ACME directory {url}");

        let res = client
            .get(url)
            .send()
            .await
            .wrap_err_with(|| format!("GET {url}"))?;
        let directory = handle_error(res).await?.json::<api::Directory>().await?;

        Ok((client, directory))
    }

    /// POST-as-GET of an order.
    async fn refresh_order(&self, order: &mut AcmeOrder) -> eyre::Result<()> {
        let res = self
            .session()?
            .transport
            .call_kid(&order.url, &api::EmptyString)
            .await?;

        order.api = res.json().await?;
        Ok(())
    }

    async fn fetch_challenge(&self, url: &str) -> eyre::Result<api::Challenge> {
        let res = self
            .session()?
            .transport
            .call_kid(url, &api::EmptyString)
            .await?;

        Ok(res.json().await?)
    }
}

impl std::fmt::Debug for AcmeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeGateway")
            .field("directory_url", &self.directory_url)
            .field("poll_delay", &self.poll_delay)
            .field("registered", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

fn challenge_status(status: api::ChallengeStatus) -> ChallengeStatus {
    match status {
        api::ChallengeStatus::Pending => ChallengeStatus::Pending,
        api::ChallengeStatus::Processing => ChallengeStatus::Processing,
        api::ChallengeStatus::Valid => ChallengeStatus::Valid,
        api::ChallengeStatus::Invalid => ChallengeStatus::Invalid,
    }
}

impl From<api::Challenge> for Challenge {
    fn from(c: api::Challenge) -> Self {
        Challenge {
            kind: ChallengeKind::from(c._type.as_str()),
            status: challenge_status(c.status),
            url: c.url,
            token: c.token,
            error: c.error.map(|problem| problem.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl Gateway for AcmeGateway {
    type Order = AcmeOrder;

    async fn create_account(&mut self, contact: &[String]) -> eyre::Result<()> {
        let (client, directory) = self.fetch_directory().await?;
        let nonce_pool = Arc::new(NoncePool::new(&directory.new_nonce));
        let mut transport = Transport::new(client, nonce_pool, AccountKey::generate());

        let acc = api::Account {
            contact: Some(contact.to_vec()),
            terms_of_service_agreed: Some(true),
            ..Default::default()
        };

        let res = transport.call_jwk(&directory.new_account, &acc).await?;
        let kid = expect_header(&res, "location")?;
        let account = res.json::<api::Account>().await?;

        log::debug!("key ID is: {kid}");
        log::info!(
            "ACME account registered (status: {})",
            account.status.as_deref().unwrap_or("unknown")
        );

        transport.set_key_id(kid);
        self.session = Some(Session {
            transport,
            directory,
        });

        Ok(())
    }

    async fn create_order(&mut self, domain: &str) -> eyre::Result<AcmeOrder> {
        let session = self.session()?;

        let body = api::Order::new_for(vec![api::Identifier::dns(domain)]);
        let res = session
            .transport
            .call_kid(&session.directory.new_order, &body)
            .await?;

        let url = expect_header(&res, "location")?;
        let api = res.json::<api::Order>().await?;

        log::debug!("order created: {url}");

        Ok(AcmeOrder { url, api })
    }

    async fn authorizations(&mut self, order: &AcmeOrder) -> eyre::Result<Vec<Authorization>> {
        let session = self.session()?;
        let mut result = vec![];

        for url in order.api.authorizations.iter().flatten() {
            let res = session.transport.call_kid(url, &api::EmptyString).await?;
            let authz = res.json::<api::Authorization>().await?;

            result.push(Authorization {
                url: url.clone(),
                identifier: authz.identifier.value,
                challenges: authz.challenges.into_iter().map(Challenge::from).collect(),
            });
        }

        Ok(result)
    }

    fn key_authorization(&self, challenge: &Challenge) -> eyre::Result<String> {
        let key = self.session()?.transport.key();
        key::key_authorization(&challenge.token, key, challenge.kind == ChallengeKind::Dns01)
    }

    async fn verify_challenge(
        &mut self,
        authz: &Authorization,
        challenge: &Challenge,
    ) -> eyre::Result<()> {
        let record = ExpectedDnsRecord::new(&authz.identifier, self.key_authorization(challenge)?);

        let records = self.verifier.resolve_txt(record.host()).await?;

        if !record.is_satisfied_by(&records) {
            eyre::bail!(
                "expected value not among {} TXT record(s) at {}",
                records.len(),
                record.host()
            );
        }

        log::debug!("verified {record}");
        Ok(())
    }

    async fn complete_challenge(&mut self, challenge: &Challenge) -> eyre::Result<()> {
        let res = self
            .session()?
            .transport
            .call_kid(&challenge.url, &api::EmptyObject)
            .await?;

        let chall = res.json::<api::Challenge>().await?;
        log::debug!("challenge {} is {:?}", chall.url, chall.status);

        Ok(())
    }

    async fn wait_for_valid_status(&mut self, challenge: &Challenge) -> eyre::Result<Challenge> {
        for _ in 0..MAX_POLLS {
            let chall = Challenge::from(self.fetch_challenge(&challenge.url).await?);

            if chall.status.is_settled() {
                return Ok(chall);
            }

            tokio::time::sleep(self.poll_delay).await;
        }

        Err(eyre!(
            "challenge {} not settled after {MAX_POLLS} polls",
            challenge.url
        ))
    }

    async fn finalize_order(
        &mut self,
        order: &mut AcmeOrder,
        csr: &CertificateRequest,
    ) -> eyre::Result<()> {
        let finalize = api::Finalize {
            // not the same as PEM
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr.csr_der()),
        };

        // an unacceptable CSR comes back as a problem document
        self.session()?
            .transport
            .call_kid(&order.api.finalize, &finalize)
            .await?;

        let mut polls = 0;

        loop {
            self.refresh_order(order).await?;
            polls += 1;

            if !order.api.is_processing() {
                break;
            }

            if polls >= MAX_POLLS {
                eyre::bail!("order {} still processing after {MAX_POLLS} polls", order.url);
            }

            tokio::time::sleep(self.poll_delay).await;
        }

        match order.api.status {
            Some(api::OrderStatus::Valid) => Ok(()),
            status => Err(eyre!(
                "order {} is {status:?}{}",
                order.url,
                order
                    .api
                    .error
                    .as_ref()
                    .map(|problem| format!(": {problem}"))
                    .unwrap_or_default()
            )),
        }
    }

    async fn certificate(&mut self, order: &AcmeOrder) -> eyre::Result<String> {
        let url = order
            .api
            .certificate
            .as_deref()
            .ok_or_else(|| eyre!("order {} has no certificate URL", order.url))?;

        let res = self
            .session()?
            .transport
            .call_kid(url, &api::EmptyString)
            .await?;

        Ok(res.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cert::create_p256_key,
        checkpoint::Checkpoint as _,
        test::{self, FakeZone, Lookup, ScriptedResolver, ServerOptions},
    };

    fn gateway(server: &test::TestServer, verifier: Arc<dyn TxtResolver>) -> AcmeGateway {
        AcmeGateway::new(DirectoryUrl::Other(server.dir_url.clone()), verifier)
            .with_poll_delay(Duration::from_millis(1))
    }

    fn contact() -> Vec<String> {
        vec!["mailto:ops@example.test".to_owned()]
    }

    #[test]
    fn test_directory_urls() {
        assert_eq!(
            DirectoryUrl::LetsEncryptStaging.to_url(),
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        );
        assert_eq!(
            DirectoryUrl::Other("http://127.0.0.1:14000/dir".to_owned()).to_url(),
            "http://127.0.0.1:14000/dir"
        );
    }

    #[tokio::test]
    async fn test_calls_before_registration_fail() {
        let mut gw = AcmeGateway::new(
            DirectoryUrl::Other("http://127.0.0.1:9/directory".to_owned()),
            Arc::new(ScriptedResolver::default()),
        );

        assert!(gw.create_order("example.test").await.is_err());
        assert!(gw
            .key_authorization(&test::challenge("dns-01", ChallengeStatus::Pending))
            .is_err());
    }

    #[tokio::test]
    async fn test_create_account() {
        let server = test::with_directory_server();
        let mut gw = gateway(&server, Arc::new(ScriptedResolver::default()));

        gw.create_account(&contact()).await.unwrap();

        assert_eq!(
            server.requests(),
            vec!["GET /directory", "HEAD /acme/new-nonce", "POST /acme/new-acct"]
        );
    }

    #[tokio::test]
    async fn test_bad_nonce_is_retried() {
        let server = test::with_directory_server_opts(ServerOptions {
            bad_nonce_once: true,
            ..Default::default()
        });
        let mut gw = gateway(&server, Arc::new(ScriptedResolver::default()));

        gw.create_account(&contact()).await.unwrap();

        assert_eq!(server.count("POST /acme/new-acct"), 2);
        // the retry uses the nonce from the error response
        assert_eq!(server.count("HEAD /acme/new-nonce"), 1);
    }

    #[tokio::test]
    async fn test_order_and_authorizations() {
        let server = test::with_directory_server();
        let mut gw = gateway(&server, Arc::new(ScriptedResolver::default()));
        gw.create_account(&contact()).await.unwrap();

        let order = gw.create_order("example.test").await.unwrap();
        assert!(order.url().ends_with("/acme/order/YTqpYUthlVfwBncUufE8"));

        let authz = gw.authorizations(&order).await.unwrap();
        assert_eq!(authz.len(), 1);
        assert_eq!(authz[0].identifier, "example.test");
        assert_eq!(
            authz[0].offered_kinds(),
            vec!["http-01", "tls-alpn-01", "dns-01"]
        );

        let dns = authz[0].dns_challenge().unwrap();
        assert_eq!(dns.status, ChallengeStatus::Pending);
        assert_eq!(dns.token, "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8");

        let value = gw.key_authorization(dns).unwrap();
        assert_eq!(value.len(), 43);

        let http = &authz[0].challenges[0];
        let http_value = gw.key_authorization(http).unwrap();
        assert!(http_value.starts_with("MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w."));
    }

    #[tokio::test]
    async fn test_verify_challenge_looks_up_expected_record() {
        let server = test::with_directory_server();
        let resolver = Arc::new(ScriptedResolver::repeating(Lookup::Records(vec!["stale"])));
        let mut gw = gateway(&server, resolver.clone());
        gw.create_account(&contact()).await.unwrap();

        let order = gw.create_order("example.test").await.unwrap();
        let authz = gw.authorizations(&order).await.unwrap().remove(0);
        let dns = authz.dns_challenge().unwrap().clone();

        let err = gw.verify_challenge(&authz, &dns).await.unwrap_err();
        assert!(err.to_string().contains("_acme-challenge.example.test"));
        assert_eq!(resolver.hosts(), vec!["_acme-challenge.example.test"]);
    }

    #[tokio::test]
    async fn test_full_issuance() {
        let signer = create_p256_key();
        let server = test::with_directory_server_opts(ServerOptions {
            certificate: test::self_signed_pem(&signer, "example.test", 90),
            ..Default::default()
        });
        let zone = Arc::new(FakeZone::default());
        let mut gw = gateway(&server, zone.clone());

        gw.create_account(&contact()).await.unwrap();
        let mut order = gw.create_order("example.test").await.unwrap();
        let authz = gw.authorizations(&order).await.unwrap().remove(0);
        let dns = authz.dns_challenge().unwrap().clone();

        let value = gw.key_authorization(&dns).unwrap();
        zone.confirm_published(&ExpectedDnsRecord::new("example.test", value))
            .await
            .unwrap();

        gw.verify_challenge(&authz, &dns).await.unwrap();
        gw.complete_challenge(&dns).await.unwrap();

        let settled = gw.wait_for_valid_status(&dns).await.unwrap();
        assert_eq!(settled.status, ChallengeStatus::Valid);

        let csr = gw.generate_csr_and_key("example.test").unwrap();
        gw.finalize_order(&mut order, &csr).await.unwrap();

        let pem = gw.certificate(&order).await.unwrap();
        let cert = csr.into_issued(pem);
        assert_eq!(cert.valid_days_left().unwrap(), 89);

        assert_eq!(server.count("POST /acme/finalize/7738992/18234324"), 1);
        assert_eq!(server.count("POST /acme/cert/fae41c070f967713109028"), 1);
    }

    #[tokio::test]
    async fn test_invalid_challenge_carries_problem() {
        let server = test::with_directory_server_opts(ServerOptions {
            fail_challenge: true,
            ..Default::default()
        });
        let mut gw = gateway(&server, Arc::new(ScriptedResolver::default()));
        gw.create_account(&contact()).await.unwrap();
        let order = gw.create_order("example.test").await.unwrap();
        let authz = gw.authorizations(&order).await.unwrap().remove(0);
        let dns = authz.dns_challenge().unwrap().clone();

        gw.complete_challenge(&dns).await.unwrap();
        let settled = gw.wait_for_valid_status(&dns).await.unwrap();

        assert_eq!(settled.status, ChallengeStatus::Invalid);
        assert!(settled
            .error
            .unwrap()
            .contains("urn:ietf:params:acme:error:incorrectResponse"));
    }

    #[tokio::test]
    async fn test_certificate_requires_valid_order() {
        let server = test::with_directory_server();
        let mut gw = gateway(&server, Arc::new(ScriptedResolver::default()));
        gw.create_account(&contact()).await.unwrap();
        let order = gw.create_order("example.test").await.unwrap();

        let err = gw.certificate(&order).await.unwrap_err();
        assert!(err.to_string().contains("no certificate URL"));
    }

    #[tokio::test]
    async fn test_unreachable_directory() {
        let mut gw = AcmeGateway::new(
            DirectoryUrl::Other("http://127.0.0.1:9/directory".to_owned()),
            Arc::new(ScriptedResolver::default()),
        );

        assert!(gw.create_account(&contact()).await.is_err());
    }

    #[test]
    fn test_gateway_challenge_from_wire() {
        let chall = api::Challenge {
            _type: "dns-01".to_owned(),
            url: "https://ca.test/chall/1".to_owned(),
            status: api::ChallengeStatus::Processing,
            token: "tok".to_owned(),
            error: None,
        };

        let chall = Challenge::from(chall);
        assert_eq!(chall.kind, ChallengeKind::Dns01);
        assert_eq!(chall.status, ChallengeStatus::Processing);
    }
}
