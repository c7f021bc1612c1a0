//! Request signing, see [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use serde::Serialize;

use super::key::{AccountKey, Jwk};

/// Protected header of a request JWS.
///
/// newAccount requests carry the public key in `jwk`. Every later request carries the account URL
/// in `kid` instead. The two are mutually exclusive.
#[derive(Debug, Serialize)]
pub(crate) struct ProtectedHeader<'a> {
    alg: &'static str,
    nonce: String,
    url: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

impl<'a> ProtectedHeader<'a> {
    pub(crate) fn with_jwk(jwk: Jwk, url: &'a str, nonce: String) -> Self {
        Self {
            alg: "ES256",
            nonce,
            url,
            jwk: Some(jwk),
            kid: None,
        }
    }

    pub(crate) fn with_kid(kid: &'a str, url: &'a str, nonce: String) -> Self {
        Self {
            alg: "ES256",
            nonce,
            url,
            jwk: None,
            kid: Some(kid),
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize)]
struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Signs `payload` and returns the flattened JSON serialization.
///
/// A payload that serializes to `""` is sent as an empty string, which marks a POST-as-GET.
pub(crate) fn sign<T: Serialize + ?Sized>(
    protected: &ProtectedHeader<'_>,
    key: &AccountKey,
    payload: &T,
) -> eyre::Result<String> {
    let protected = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(protected)?);

    let payload = match serde_json::to_string(payload)?.as_str() {
        "\"\"" => String::new(),
        json => BASE64_URL_SAFE_NO_PAD.encode(json),
    };

    let to_sign = format!("{protected}.{payload}");
    let (signature, _rec_id) = key.signing_key().sign_recoverable(to_sign.as_bytes())?;

    let jws = FlattenedJsonJws {
        protected,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    };

    Ok(serde_json::to_string(&jws)?)
}
