use base64::prelude::*;
use eyre::eyre;
use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::cert::create_p256_key;

/// The account key pair, plus the account URL once the server has assigned one.
#[derive(Clone, Debug)]
pub(crate) struct AccountKey {
    signing_key: p256::ecdsa::SigningKey,

    /// Set from the `Location` header of the newAccount response.
    key_id: Option<String>,
}

impl AccountKey {
    pub(crate) fn generate() -> Self {
        Self {
            signing_key: create_p256_key(),
            key_id: None,
        }
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }

    pub(crate) fn key_id(&self) -> eyre::Result<&str> {
        self.key_id
            .as_deref()
            .ok_or_else(|| eyre!("account key has no key ID; register the account first"))
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid);
    }

    pub(crate) fn jwk(&self) -> eyre::Result<Jwk> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);

        let x = point.x().ok_or_else(|| eyre!("public key has no x coordinate"))?;
        let y = point.y().ok_or_else(|| eyre!("public key has no y coordinate"))?;

        Ok(Jwk {
            alg: "ES256".to_owned(),
            crv: "P-256".to_owned(),
            kty: "EC".to_owned(),
            _use: "sig".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }

    /// JWK thumbprint ([RFC 7638]), base64url encoded.
    ///
    /// [RFC 7638]: https://datatracker.ietf.org/doc/html/rfc7638
    pub(crate) fn thumbprint(&self) -> eyre::Result<String> {
        let jwk = self.jwk()?;
        let thumb = JwkThumb {
            crv: &jwk.crv,
            kty: &jwk.kty,
            x: &jwk.x,
            y: &jwk.y,
        };

        let json = serde_json::to_string(&thumb)?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(json)))
    }
}

/// Public half of the account key, as sent in the newAccount JWS header.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

// field order is lexical, the thumbprint hashes this exact serialization
#[derive(Serialize)]
struct JwkThumb<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

/// Key authorization for `token` ([RFC 8555 §8.1]).
///
/// With `dns_digest` set, returns the `TXT` record content of a `dns-01` challenge
/// ([RFC 8555 §8.4]): the base64url SHA-256 digest of the key authorization.
///
/// [RFC 8555 §8.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.1
/// [RFC 8555 §8.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.4
pub(crate) fn key_authorization(
    token: &str,
    key: &AccountKey,
    dns_digest: bool,
) -> eyre::Result<String> {
    let key_auth = format!("{token}.{}", key.thumbprint()?);

    if dns_digest {
        Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth)))
    } else {
        Ok(key_auth)
    }
}
