//! Ed25519 identity keys and their canonical textual encoding

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of an identity public key in bytes
pub const IDENTITY_LEN: usize = 32;

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid identity encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid identity length: expected {IDENTITY_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("Not a valid Ed25519 public key")]
    InvalidKey,
}

/// A public identity: a 32-byte Ed25519 verifying key.
///
/// The canonical textual form is unpadded URL-safe base64 of the raw key
/// bytes; `Display` and `FromStr` round-trip through it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Verify an Ed25519 signature made by this identity's secret key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| IdentityError::InvalidKey)?;
        let sig = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| IdentityError::InvalidKey)?;
        key.verify_strict(message, &sig)
            .map_err(|_| IdentityError::InvalidKey)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// A private identity key.
///
/// Long-term secrets live in a vault; the only secrets this core creates
/// itself are ephemeral per-connection keys.
#[derive(Clone)]
pub struct Secret(SigningKey);

impl Secret {
    /// Generate a fresh key from OS randomness
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(SigningKey::from_bytes(&bytes))
    }

    pub fn identity(&self) -> Identity {
        Identity(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.0.sign(message).to_vec()
    }

    pub fn as_bytes(&self) -> [u8; IDENTITY_LEN] {
        self.0.to_bytes()
    }

    /// Canonical textual form, same encoding as [`Identity`]
    pub fn to_text(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_bytes())
    }

    pub fn from_text(s: &str) -> Result<Self, IdentityError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        let arr: [u8; IDENTITY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self::from_bytes(arr))
    }

    /// PKCS#8 DER encoding, the form TLS private keys are handed around in
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, IdentityError> {
        use ed25519_dalek::pkcs8::EncodePrivateKey;
        let der = self
            .0
            .to_pkcs8_der()
            .map_err(|_| IdentityError::InvalidKey)?;
        Ok(der.as_bytes().to_vec())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.identity())
    }
}
