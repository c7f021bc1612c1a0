use std::io::{BufReader, Cursor};

use der::{asn1::Ia5String, Decode as _, Encode as _};
use eyre::{eyre, WrapErr as _};
use pkcs8::EncodePrivateKey as _;
use time::{OffsetDateTime, PrimitiveDateTime};
use x509_cert::{
    builder::{Builder as _, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};
use zeroize::Zeroizing;

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Creates a CSR for `domain` and signs it with `signer`.
///
/// The domain is the CSR's Common Name (CN) and the only entry of its Subject Alternative Name
/// (SAN) extension.
pub fn create_csr(
    signer: &p256::ecdsa::SigningKey,
    domain: &str,
) -> eyre::Result<x509_cert::request::CertReq> {
    let subject = format!("CN={domain}")
        .parse::<Name>()
        .wrap_err_with(|| format!("invalid common name: {domain}"))?;

    let mut csr = CsrBuilder::new(subject, signer).wrap_err("csr builder")?;

    let san = Ia5String::new(domain).wrap_err_with(|| format!("invalid dns name: {domain}"))?;
    csr.add_extension(&SubjectAltName(vec![GeneralName::DnsName(san)]))
        .wrap_err("csr san extension")?;

    csr.build::<p256::ecdsa::DerSignature>()
        .wrap_err("build csr")
}

/// A CSR together with the private key it was signed with.
pub struct CertificateRequest {
    domain: String,
    csr_der: Vec<u8>,
    private_key_pem: Zeroizing<String>,
}

impl CertificateRequest {
    /// Builds the CSR for `domain` from `signing_key`.
    pub fn generate(signing_key: &p256::ecdsa::SigningKey, domain: &str) -> eyre::Result<Self> {
        let csr = create_csr(signing_key, domain)?;

        // this is not the same as PEM.
        let csr_der = csr.to_der()?;

        let private_key_pem = signing_key
            .to_pkcs8_pem(pem::LineEnding::LF)
            .wrap_err("private key to pem")?;

        Ok(Self {
            domain: domain.to_owned(),
            csr_der,
            private_key_pem,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The CSR in DER encoding.
    pub fn csr_der(&self) -> &[u8] {
        &self.csr_der
    }

    /// The certificate's private key in PKCS #8 PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    /// Pairs the key with the certificate issued for this request.
    pub(crate) fn into_issued(self, certificate: String) -> IssuedCertificate {
        IssuedCertificate::new(self.private_key_pem, certificate)
    }
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("domain", &self.domain)
            .field("csr_der", &format_args!("{} bytes", self.csr_der.len()))
            .finish_non_exhaustive()
    }
}

/// Issued certificate chain and its private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    private_key_pem: Zeroizing<String>,
    certificate: String,
}

impl IssuedCertificate {
    pub(crate) fn new(private_key_pem: Zeroizing<String>, certificate: String) -> Self {
        IssuedCertificate {
            private_key_pem,
            certificate,
        }
    }

    /// The private key in PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    /// The issued certificate file in PEM format.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// The issued certificate chain in DER format.
    pub fn certificate_chain(&self) -> eyre::Result<Vec<Vec<u8>>> {
        let mut rdr = BufReader::new(Cursor::new(self.certificate()));

        rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Inspect the certificate to count the number of (whole) valid days left.
    ///
    /// Let's Encrypt sets the validity to 90 days, so a freshly issued certificate reports 89.
    /// Expired certificates report negative days.
    pub fn valid_days_left(&self) -> eyre::Result<i64> {
        let cert_chain = self.certificate_chain()?;
        let cert_ee = cert_chain
            .first() // EE cert is first
            .ok_or_else(|| eyre!("no certificates in chain"))?;

        let cert = x509_cert::Certificate::from_der(cert_ee)?;

        let not_after = cert.tbs_certificate.validity.not_after.to_date_time();
        let not_after = PrimitiveDateTime::try_from(not_after)?.assume_utc();

        let diff = not_after - OffsetDateTime::now_utc();

        Ok(diff.whole_days())
    }
}
