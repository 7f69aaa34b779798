//! Identity keys and the certificate-signing vault boundary
//!
//! All trust in backhaul is identity-based: a party *is* its 32-byte Ed25519
//! public key. Certificates exist only as carriers for those keys across the
//! TLS layer, so the vault interface is deliberately small — it owns the
//! long-term private key and can issue a certificate binding any public key
//! to a requested shape.

mod key;
mod vault;

pub use key::{Identity, IdentityError, Secret, IDENTITY_LEN};
pub use vault::{CertTemplate, MemoryVault, Vault, VaultError};
