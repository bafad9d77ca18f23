//! Signed request envelope.
//!
//! A request is serialized to JSON, signed with PKCS#1 v1.5 over its
//! SHA-256 digest, and shipped as `{dat, pubkey, sig}`. The signer's
//! public key also appears inside the signed body; the decoder verifies
//! the signature and then checks both copies agree, so an envelope cannot
//! be re-signed around a foreign body.

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProtoError;

/// Protocol revision carried in every signed request.
pub const API_VERSION: u32 = 1;

/// The outer, signed form of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Raw JSON of the [`SignedRequest`] body.
    #[serde(with = "hex")]
    pub dat: Vec<u8>,

    /// PKCS#1 DER public key of the signer.
    #[serde(with = "hex")]
    pub pubkey: Vec<u8>,

    /// PKCS#1 v1.5 SHA-256 signature over `dat`.
    #[serde(with = "hex")]
    pub sig: Vec<u8>,
}

/// The signed request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest<T> {
    #[serde(rename = "apiVersion")]
    pub api_version: u32,

    pub request: T,

    /// PKCS#1 DER public key, bound into the signed bytes.
    #[serde(rename = "PublicKey", with = "hex")]
    pub public_key: Vec<u8>,
}

impl SignedEnvelope {
    /// Sign `request` with `key` and encode the envelope as JSON.
    pub fn sign<T: Serialize>(request: &T, key: &RsaPrivateKey) -> Result<String, ProtoError> {
        let pub_der = key
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| ProtoError::Crypto(e.to_string()))?
            .into_vec();

        let body = SignedRequest {
            api_version: API_VERSION,
            request,
            public_key: pub_der.clone(),
        };
        let dat = serde_json::to_vec(&body)?;

        let digest = Sha256::digest(&dat);
        let sig = key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| ProtoError::Crypto(e.to_string()))?;

        let envelope = SignedEnvelope {
            dat,
            pubkey: pub_der,
            sig,
        };
        Ok(serde_json::to_string(&envelope).expect("envelope always encodes"))
    }

    /// Decode and verify an envelope, returning the request body.
    ///
    /// Verifies the signature against the envelope key, then checks the key
    /// embedded in the signed body matches it. Authorization against an
    /// allow-list is a separate step ([`KeyAllowList::check`]).
    pub fn verify<T: DeserializeOwned>(raw: &str) -> Result<SignedRequest<T>, ProtoError> {
        let envelope: SignedEnvelope = serde_json::from_str(raw)?;

        let pubkey = RsaPublicKey::from_pkcs1_der(&envelope.pubkey)
            .map_err(|e| ProtoError::Crypto(e.to_string()))?;

        let digest = Sha256::digest(&envelope.dat);
        pubkey
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &envelope.sig)
            .map_err(|_| ProtoError::Unauthorised("bad signature".to_string()))?;

        let body: SignedRequest<T> = serde_json::from_slice(&envelope.dat)?;
        if body.public_key != envelope.pubkey {
            return Err(ProtoError::KeyMismatch);
        }
        Ok(body)
    }
}

/// The set of public keys allowed to issue requests.
///
/// Loaded once at process start and never mutated.
#[derive(Debug, Clone, Default)]
pub struct KeyAllowList {
    keys: Vec<Vec<u8>>,
}

impl KeyAllowList {
    /// Allow a single key, given in DER.
    pub fn single(der: Vec<u8>) -> Self {
        KeyAllowList { keys: vec![der] }
    }

    /// Parse one or more `RSA PUBLIC KEY` PEM blocks.
    pub fn from_pem(pem: &str) -> Result<Self, ProtoError> {
        let mut keys = Vec::new();
        let mut rest = pem;
        while let Some(start) = rest.find("-----BEGIN") {
            let block = &rest[start..];
            let end = block
                .find("-----END")
                .and_then(|i| block[i..].find('\n').map(|j| i + j + 1))
                .unwrap_or(block.len());
            let one = &block[..end];
            let key = RsaPublicKey::from_pkcs1_pem(one)
                .map_err(|e| ProtoError::Crypto(e.to_string()))?;
            keys.push(
                key.to_pkcs1_der()
                    .map_err(|e| ProtoError::Crypto(e.to_string()))?
                    .into_vec(),
            );
            rest = &block[end..];
        }
        if keys.is_empty() {
            return Err(ProtoError::Crypto("no public keys in PEM".to_string()));
        }
        Ok(KeyAllowList { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Absorb another list's keys.
    pub fn merge(&mut self, other: KeyAllowList) {
        self.keys.extend(other.keys);
    }

    /// Check a request's key against the list.
    pub fn check(&self, der: &[u8]) -> Result<(), ProtoError> {
        if self.keys.iter().any(|k| k == der) {
            Ok(())
        } else {
            Err(ProtoError::Unauthorised("key not in allow list".to_string()))
        }
    }
}
