//! Per-session worker identities.

use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("key generation failed: {0}")]
    KeyGen(String),

    #[error("certificate generation failed: {0}")]
    Cert(String),
}

/// Key size for production identities.
const IDENTITY_BITS: usize = 4096;

/// Certificate validity window.
const CERT_VALIDITY_HOURS: i64 = 12;

/// Secret payload keys, as mounted into the worker pod.
pub const SECRET_TLS_KEY: &str = "srvkey";
pub const SECRET_CERT: &str = "cert";
pub const SECRET_AUTH: &str = "auth";

/// A freshly minted worker identity: a short-lived TLS server identity
/// plus an independent request-authentication keypair.
pub struct WorkerIdentity {
    /// TLS private key, PKCS#1 PEM. Goes into the secret.
    pub tls_key_pem: String,

    /// Self-signed certificate, PEM. Goes into the secret.
    pub cert_pem: String,

    /// The same certificate in DER, for exact-match pinning.
    pub cert_der: Vec<u8>,

    /// Private half of the request-authentication keypair. Stays with
    /// the session; only its public half enters the secret.
    pub auth_key: RsaPrivateKey,

    /// Public auth key, PKCS#1 PEM.
    pub auth_public_pem: String,
}

impl WorkerIdentity {
    /// Mint a production identity (two fresh 4096-bit keys).
    ///
    /// Key generation is CPU-heavy; call from a blocking context.
    pub fn mint() -> Result<Self, IdentityError> {
        Self::mint_with_bits(IDENTITY_BITS)
    }

    /// Mint with an explicit key size. Tests use smaller keys.
    pub fn mint_with_bits(bits: usize) -> Result<Self, IdentityError> {
        let mut rng = rand::thread_rng();

        let tls_key =
            RsaPrivateKey::new(&mut rng, bits).map_err(|e| IdentityError::KeyGen(e.to_string()))?;

        let pkcs8 = tls_key
            .to_pkcs8_der()
            .map_err(|e| IdentityError::KeyGen(e.to_string()))?;
        let key_pair = KeyPair::try_from(pkcs8.as_bytes())
            .map_err(|e| IdentityError::Cert(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "fab build worker");
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::hours(CERT_VALIDITY_HOURS);

        let mut serial = [0u8; 16];
        rng.fill_bytes(&mut serial);
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| IdentityError::Cert(e.to_string()))?;

        let auth_key =
            RsaPrivateKey::new(&mut rng, bits).map_err(|e| IdentityError::KeyGen(e.to_string()))?;

        Ok(WorkerIdentity {
            tls_key_pem: tls_key
                .to_pkcs1_pem(LineEnding::LF)
                .map_err(|e| IdentityError::KeyGen(e.to_string()))?
                .to_string(),
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            auth_public_pem: auth_key
                .to_public_key()
                .to_pkcs1_pem(LineEnding::LF)
                .map_err(|e| IdentityError::KeyGen(e.to_string()))?,
            auth_key,
        })
    }

    /// The payload of the cluster secret for this identity.
    pub fn secret_data(&self) -> BTreeMap<String, Vec<u8>> {
        let mut data = BTreeMap::new();
        data.insert(SECRET_TLS_KEY.to_string(), self.tls_key_pem.clone().into_bytes());
        data.insert(SECRET_CERT.to_string(), self.cert_pem.clone().into_bytes());
        data.insert(
            SECRET_AUTH.to_string(),
            self.auth_public_pem.clone().into_bytes(),
        );
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_identity_is_complete() {
        let identity = WorkerIdentity::mint_with_bits(2048).unwrap();
        assert!(identity.tls_key_pem.contains("RSA PRIVATE KEY"));
        assert!(identity.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(identity.auth_public_pem.contains("RSA PUBLIC KEY"));
        assert!(!identity.cert_der.is_empty());

        let data = identity.secret_data();
        assert_eq!(
            data.keys().collect::<Vec<_>>(),
            vec!["auth", "cert", "srvkey"]
        );
    }

    #[test]
    fn identities_are_unique() {
        let a = WorkerIdentity::mint_with_bits(2048).unwrap();
        let b = WorkerIdentity::mint_with_bits(2048).unwrap();
        assert_ne!(a.cert_der, b.cert_der);
        assert_ne!(a.auth_public_pem, b.auth_public_pem);
    }
}
