use std::{collections::VecDeque, sync::Arc, time::Duration};

use eyre::{eyre, WrapErr as _};
use parking_lot::Mutex;
use reqwest::{header::CONTENT_TYPE, Client, Response};
use serde::Serialize;

use super::{
    api::Problem,
    jws::{self, ProtectedHeader},
    key::AccountKey,
};

/// Times a request is re-signed with a fresh nonce after a `badNonce` problem.
const BAD_NONCE_RETRIES: usize = 5;

/// Nonces kept from responses for later requests.
const NONCE_POOL_SIZE: usize = 10;

pub(crate) fn http_client() -> eyre::Result<Client> {
    Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(30))
        .build()
        .wrap_err("building HTTP client")
}

/// Turns a non-2xx response into the server's problem document.
pub(crate) async fn handle_error(res: Response) -> Result<Response, Problem> {
    let status = res.status();

    if status.is_success() {
        return Ok(res);
    }

    let is_problem = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    // the CA sometimes resets the connection after sending the body; keep what was read
    let body = res.text().await.unwrap_or_default();

    let problem = if is_problem {
        serde_json::from_str(&body).unwrap_or_else(|err| Problem {
            _type: "problemJsonFail".to_owned(),
            detail: Some(format!(
                "failed to deserialize application/problem+json ({err}) body: {body}"
            )),
            subproblems: None,
        })
    } else {
        Problem {
            _type: "httpReqError".to_owned(),
            detail: Some(format!("{status} body: {body}")),
            subproblems: None,
        }
    };

    Err(problem)
}

pub(crate) fn expect_header(res: &Response, name: &str) -> eyre::Result<String> {
    let value = res
        .headers()
        .get(name)
        .ok_or_else(|| eyre!("response to {} is missing the {name} header", res.url()))?;

    Ok(value.to_str().wrap_err_with(|| format!("{name} header"))?.to_owned())
}

/// Signed requests with nonce bookkeeping.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against the newAccount URL
/// 3. `set_key_id()` from the returned `Location` header
/// 4. `call_kid()` for everything after that
#[derive(Debug)]
pub(crate) struct Transport {
    client: Client,
    key: AccountKey,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub(crate) fn new(client: Client, nonce_pool: Arc<NoncePool>, key: AccountKey) -> Self {
        Self {
            client,
            key,
            nonce_pool,
        }
    }

    pub(crate) fn key(&self) -> &AccountKey {
        &self.key
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key.set_key_id(kid);
    }

    /// Signs with the full public key. Only for newAccount.
    pub(crate) async fn call_jwk<T>(&self, url: &str, body: &T) -> eyre::Result<Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, |nonce| {
            let header = ProtectedHeader::with_jwk(self.key.jwk()?, url, nonce);
            jws::sign(&header, &self.key, body)
        })
        .await
    }

    /// Signs with the account URL as key ID.
    pub(crate) async fn call_kid<T>(&self, url: &str, body: &T) -> eyre::Result<Response>
    where
        T: Serialize + ?Sized,
    {
        let kid = self.key.key_id()?;

        self.do_call(url, |nonce| {
            let header = ProtectedHeader::with_kid(kid, url, nonce);
            jws::sign(&header, &self.key, body)
        })
        .await
    }

    async fn do_call<F>(&self, url: &str, make_body: F) -> eyre::Result<Response>
    where
        F: Fn(String) -> eyre::Result<String>,
    {
        let mut retries = 0;

        loop {
            let nonce = self.nonce_pool.get_nonce(&self.client).await?;
            let body = make_body(nonce)?;

            log::debug!("call endpoint: {url}");
            log::trace!("{body}");

            let res = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/jose+json")
                .body(body)
                .send()
                .await
                .wrap_err_with(|| format!("POST {url}"))?;

            // error responses carry a fresh nonce too
            self.nonce_pool.extract_nonce(&res);

            match handle_error(res).await {
                Err(problem) if problem.is_bad_nonce() && retries < BAD_NONCE_RETRIES => {
                    retries += 1;
                    log::debug!("retrying on bad nonce ({retries}/{BAD_NONCE_RETRIES})");
                }
                res => return Ok(res?),
            }
        }
    }
}

/// Shared pool of nonces.
#[derive(Debug, Default)]
pub(crate) struct NoncePool {
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub(crate) fn new(nonce_url: &str) -> Self {
        Self {
            nonce_url: nonce_url.to_owned(),
            ..Default::default()
        }
    }

    fn extract_nonce(&self, res: &Response) {
        let Some(nonce) = res.headers().get("replay-nonce") else {
            return;
        };

        // see https://datatracker.ietf.org/doc/html/rfc8555#section-6.5.1
        let Ok(nonce) = nonce.to_str() else {
            log::debug!("ignoring non-ASCII replay-nonce");
            return;
        };

        log::trace!("extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce.to_owned());

        if pool.len() > NONCE_POOL_SIZE {
            pool.pop_front();
        }
    }

    async fn get_nonce(&self, client: &Client) -> eyre::Result<String> {
        let pooled = self.pool.lock().pop_front();

        if let Some(nonce) = pooled {
            log::trace!("use previous nonce");
            return Ok(nonce);
        }

        log::debug!("request new nonce");

        let res = client
            .head(&self.nonce_url)
            .send()
            .await
            .wrap_err("requesting new nonce")?;
        let res = handle_error(res).await?;

        expect_header(&res, "replay-nonce")
    }
}
