//! The listener-shaped accept loop

use crate::handshake::{await_reverse, upgrade};
use crate::stream::TunnelStream;
use backhaul_dialer::{DialError, Dialer};
use backhaul_identity::{Identity, Vault, VaultError};
use backhaul_surface::Surface;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Pause between failed tunnel attempts
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Tunnel handshake errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Broker data arrived before the upgrade completed")]
    HandshakeRace,

    #[error("Canceled")]
    Canceled,
}

/// Accepts broker-mediated reverse connections.
///
/// `accept` retries the whole dial/upgrade/wait cycle with a fixed backoff
/// until a stream arrives or the listener is closed; transient trust and
/// network failures only ever show up as log lines.
pub struct TunnelListener {
    dialer: Dialer,
    local: Identity,
    cancel: CancellationToken,
}

impl TunnelListener {
    pub fn new(vault: Arc<dyn Vault>, surface: Arc<Surface>) -> Result<Self, TunnelError> {
        let local = vault.identity()?;
        Ok(Self {
            dialer: Dialer::new(vault, surface),
            local,
            cancel: CancellationToken::new(),
        })
    }

    /// Token observing (and controlling) this listener's lifetime
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop retrying; a blocked `accept` returns [`TunnelError::Canceled`]
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Block until the broker hands over a reverse stream
    pub async fn accept(&self) -> Result<TunnelStream, TunnelError> {
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TunnelError::Canceled),
                r = self.accept_once() => r,
            };

            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    error!(error = %e, "tunnel attempt failed, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TunnelError::Canceled),
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }

    async fn accept_once(&self) -> Result<TunnelStream, TunnelError> {
        let (mut tls, ingress) = self.dialer.dial().await?;
        upgrade(&mut tls, &ingress.name).await?;
        let connect = await_reverse(&mut tls).await?;

        info!(caller = %connect.caller, "accepting reverse connection");
        let caller = connect.caller.parse::<Identity>().ok();
        Ok(TunnelStream::new(tls, caller, self.local))
    }
}
