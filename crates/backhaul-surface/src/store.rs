//! Persisted surface documents
//!
//! The authoring workflow writes two files next to each other: the binary
//! document, and a `<path>.secret` companion holding the sequencer secret in
//! its canonical textual form. The secret never travels with the document.

use crate::codec::SurfaceError;
use crate::document::Surface;
use backhaul_identity::Secret;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Document persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Format(#[from] SurfaceError),

    #[error("Precedent {precedent} must be lower than serial {serial}")]
    BadPrecedent { serial: u64, precedent: u64 },
}

impl Surface {
    /// Read and decode a document from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Surface, StoreError> {
        let bytes = std::fs::read(path)?;
        Ok(Surface::parse(&bytes)?)
    }

    /// Validate ordering invariants and write the document, plus the
    /// companion `<path>.secret` file for the sequencer secret.
    ///
    /// The sequencer must be freshly generated for every document; callers
    /// pass the secret in so its identity provably matches the document.
    pub fn save(&self, path: impl AsRef<Path>, sequencer: &Secret) -> Result<(), StoreError> {
        if self.precedent >= self.serial {
            return Err(StoreError::BadPrecedent {
                serial: self.serial,
                precedent: self.precedent,
            });
        }
        debug_assert_eq!(self.sequencer, sequencer.identity());

        let path = path.as_ref();
        std::fs::write(path, self.serialize())?;

        let mut secret_path = path.as_os_str().to_owned();
        secret_path.push(".secret");
        std::fs::write(&secret_path, sequencer.to_text())?;

        info!(path = %path.display(), serial = self.serial, "wrote surface document");
        Ok(())
    }
}
