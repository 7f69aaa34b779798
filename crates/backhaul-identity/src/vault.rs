//! The vault: owner of a long-term identity key that can issue certificates
//!
//! A vault signs X.509 shells around public keys. The subject key does not
//! have to be held locally: to trust a peer purely by its public key, the
//! caller asks the vault to mint a certificate embedding that key and drops
//! it into a root pool. Nothing ever checks the signature on a trust anchor,
//! so the vault's own key is a valid issuer for it.

use crate::key::{Identity, Secret};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, KeyPair, RemoteKeyPair, SignatureAlgorithm,
};
use std::time::SystemTime;
use thiserror::Error;

/// Vault errors
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    #[error("Vault key unavailable: {0}")]
    KeyUnavailable(String),
}

/// The shape of a certificate requested from a vault.
///
/// Only the fields the trust core actually varies: subject alternative names
/// and the validity window. Everything else is fixed convention — the subject
/// and issuer common names are the textual identity encodings.
#[derive(Debug, Clone)]
pub struct CertTemplate {
    pub dns_names: Vec<String>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl CertTemplate {
    pub fn new(dns_names: Vec<String>, not_before: SystemTime, not_after: SystemTime) -> Self {
        Self {
            dns_names,
            not_before,
            not_after,
        }
    }
}

/// Identity-signing capability, safe for concurrent use across simultaneous
/// dial attempts.
pub trait Vault: Send + Sync {
    /// The vault's public identity
    fn identity(&self) -> Result<Identity, VaultError>;

    /// Issue a DER certificate binding `subject` to `template`, signed by
    /// the vault's long-term key.
    fn sign_certificate(
        &self,
        template: &CertTemplate,
        subject: &Identity,
    ) -> Result<Vec<u8>, VaultError>;
}

/// A vault holding its key in process memory
pub struct MemoryVault {
    secret: Secret,
}

impl MemoryVault {
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }

    /// Fresh vault with a newly generated key, for tests and provisioning
    pub fn generate() -> Self {
        Self::new(Secret::generate())
    }
}

impl Vault for MemoryVault {
    fn identity(&self) -> Result<Identity, VaultError> {
        Ok(self.secret.identity())
    }

    fn sign_certificate(
        &self,
        template: &CertTemplate,
        subject: &Identity,
    ) -> Result<Vec<u8>, VaultError> {
        let issuer_id = self.secret.identity();

        let issuer_key = KeyPair::from_remote(Box::new(SigningRemote {
            public: *issuer_id.as_bytes(),
            secret: self.secret.clone(),
        }))
        .map_err(|e| VaultError::KeyUnavailable(e.to_string()))?;

        // The issuer certificate itself; only its name and key matter here.
        let mut issuer_params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| VaultError::Issuance(e.to_string()))?;
        issuer_params.distinguished_name = common_name(&issuer_id);
        let issuer_cert = issuer_params
            .self_signed(&issuer_key)
            .map_err(|e| VaultError::Issuance(e.to_string()))?;

        // Subject key is public-only; rcgen uses it for the SPKI alone.
        let subject_key = KeyPair::from_remote(Box::new(PublicOnlyRemote {
            public: *subject.as_bytes(),
        }))
        .map_err(|e| VaultError::Issuance(e.to_string()))?;

        let mut params = CertificateParams::new(template.dns_names.clone())
            .map_err(|e| VaultError::Issuance(e.to_string()))?;
        params.distinguished_name = common_name(subject);
        params.not_before = template.not_before.into();
        params.not_after = template.not_after.into();

        let cert = params
            .signed_by(&subject_key, &issuer_cert, &issuer_key)
            .map_err(|e| VaultError::Issuance(e.to_string()))?;

        Ok(cert.der().to_vec())
    }
}

fn common_name(id: &Identity) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, id.to_string());
    dn
}

/// Remote key backed by the vault's Ed25519 secret
struct SigningRemote {
    public: [u8; 32],
    secret: Secret,
}

impl RemoteKeyPair for SigningRemote {
    fn public_key(&self) -> &[u8] {
        &self.public
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Ok(self.secret.sign(msg))
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ED25519
    }
}

/// Remote key with no signing half; embedding a peer's key in a certificate
/// never requires their cooperation.
struct PublicOnlyRemote {
    public: [u8; 32],
}

impl RemoteKeyPair for PublicOnlyRemote {
    fn public_key(&self) -> &[u8] {
        &self.public
    }

    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Err(rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ED25519
    }
}
