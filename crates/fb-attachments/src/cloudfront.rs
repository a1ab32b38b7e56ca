//! CloudFront signed URLs
//!
//! Canned-policy signing: the policy statement is signed with RSA-SHA1,
//! base64 encoded and made URL safe with CloudFront's substitution table
//! (`+` → `-`, `=` → `_`, `/` → `~`).

use std::fmt;
use std::path::Path;

use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha1::Sha1;
use thiserror::Error;

/// Signing errors
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("Signing failed: {0}")]
    Sign(String),
    #[error("Unable to read private key: {0}")]
    Io(#[from] std::io::Error),
}

/// Expiry and signature for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrlGrant {
    /// Epoch seconds
    pub expires: i64,
    /// URL-safe signature
    pub signature: String,
}

/// Signs resource URLs with a CloudFront key pair
#[derive(Clone)]
pub struct CloudFrontSigner {
    key_pair_id: String,
    signing_key: SigningKey<Sha1>,
}

impl fmt::Debug for CloudFrontSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudFrontSigner")
            .field("key_pair_id", &self.key_pair_id)
            .finish_non_exhaustive()
    }
}

impl CloudFrontSigner {
    pub fn new(key_pair_id: impl Into<String>, private_key: RsaPrivateKey) -> Self {
        Self {
            key_pair_id: key_pair_id.into(),
            signing_key: SigningKey::<Sha1>::new(private_key),
        }
    }

    /// Parse a PKCS#1 (`BEGIN RSA PRIVATE KEY`) or PKCS#8 (`BEGIN PRIVATE KEY`) PEM
    pub fn from_pem(key_pair_id: impl Into<String>, pem: &str) -> Result<Self, SigningError> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;

        Ok(Self::new(key_pair_id, private_key))
    }

    /// Accept either inline PEM text or a path to a PEM file
    pub fn from_setting(key_pair_id: impl Into<String>, setting: &str) -> Result<Self, SigningError> {
        if setting.trim_start().starts_with("-----BEGIN") {
            Self::from_pem(key_pair_id, setting)
        } else {
            let pem = std::fs::read_to_string(Path::new(setting))?;
            Self::from_pem(key_pair_id, &pem)
        }
    }

    pub fn key_pair_id(&self) -> &str {
        &self.key_pair_id
    }

    /// Canned policy statement for a resource
    pub fn policy(resource: &str, expires: i64) -> String {
        format!(
            r#"{{"Statement":[{{"Resource":"{}","Condition":{{"DateLessThan":{{"AWS:EpochTime":{}}}}}}}]}}"#,
            resource, expires
        )
    }

    pub fn grant(&self, resource: &str, expires: i64) -> Result<SignedUrlGrant, SigningError> {
        let policy = Self::policy(resource, expires);
        let signature = self
            .signing_key
            .try_sign(policy.as_bytes())
            .map_err(|e| SigningError::Sign(e.to_string()))?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        Ok(SignedUrlGrant {
            expires,
            signature: url_safe(&encoded),
        })
    }

    /// `<resource>?Expires=<expires>&Signature=<signature>&Key-Pair-Id=<id>`
    pub fn signed_url(&self, resource: &str, expires: i64) -> Result<String, SigningError> {
        let grant = self.grant(resource, expires)?;
        Ok(format!(
            "{}?Expires={}&Signature={}&Key-Pair-Id={}",
            resource, grant.expires, grant.signature, self.key_pair_id
        ))
    }
}

/// Apply CloudFront's URL-safe base64 substitutions and drop newlines
pub fn url_safe(encoded: &str) -> String {
    encoded
        .chars()
        .filter(|c| *c != '\n')
        .map(|c| match c {
            '+' => '-',
            '=' => '_',
            '/' => '~',
            other => other,
        })
        .collect()
}
