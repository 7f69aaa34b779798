//! Ingress walk and TLS connection establishment

use crate::verify::SkewTolerantVerifier;
use backhaul_identity::{CertTemplate, IdentityError, Vault, VaultError};
use backhaul_surface::{Ingress, Surface};
use rand::seq::SliceRandom;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Brokers are only ever reached on the HTTPS port
pub const INGRESS_PORT: u16 = 443;

const DNS_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Validity window of the certificate synthesized for a trusted identity
const IDENTITY_CERT_WINDOW: Duration = Duration::from_secs(3600);

/// Trust dialer errors
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("No reachable trusted ingress")]
    OutOfOptions,
}

/// Turns a surface document into authenticated connections.
///
/// Each call to [`dial`](Dialer::dial) walks the ingress slots in priority
/// order with fresh per-attempt trust state; nothing is shared between
/// attempts except the vault, which must tolerate concurrent use.
pub struct Dialer {
    surface: Arc<Surface>,
    vault: Arc<dyn Vault>,
}

impl Dialer {
    pub fn new(vault: Arc<dyn Vault>, surface: Arc<Surface>) -> Self {
        Self { surface, vault }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// Dial the first reachable, verifiable ingress.
    ///
    /// DNS failure, connect failure and TLS failure are all non-fatal per
    /// candidate; only exhausting every slot errors.
    pub async fn dial(&self) -> Result<(TlsStream<TcpStream>, Ingress), DialError> {
        let (chain, key) = self.client_credentials()?;
        let mut rng = rand::thread_rng();

        for (index, ingress) in self.surface.active_ingresses() {
            let mut addrs: Vec<IpAddr> = ingress.ips.clone();

            if !ingress.name.is_empty() {
                let host = (ingress.name.as_str(), INGRESS_PORT);
                match timeout(DNS_TIMEOUT, tokio::net::lookup_host(host)).await {
                    Ok(Ok(resolved)) => addrs.extend(resolved.map(|sa| sa.ip())),
                    Ok(Err(e)) => warn!(ingress = index, error = %e, "DNS resolution failed"),
                    Err(_) => warn!(ingress = index, "DNS resolution timed out"),
                }
            }

            if addrs.is_empty() {
                continue;
            }

            // Load spreading across candidate addresses, not security
            addrs.shuffle(&mut rng);

            let effective = match self.surface.time() {
                Some(t) => t,
                None => {
                    warn!(
                        ingress = index,
                        "surface timestamp is zero, falling back to system clock"
                    );
                    SystemTime::now()
                }
            };

            let roots = match self.trust_roots(ingress, effective) {
                Ok(r) => r,
                Err(e) => {
                    warn!(ingress = index, error = %e, "could not build trust roots");
                    continue;
                }
            };

            let verifier = match SkewTolerantVerifier::new(roots, effective) {
                Ok(v) => Arc::new(v),
                Err(e) => {
                    warn!(ingress = index, error = %e, "could not build verifier");
                    continue;
                }
            };

            let config = ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(chain.clone(), key.clone_key())?;
            let connector = TlsConnector::from(Arc::new(config));

            for ip in addrs {
                let addr = SocketAddr::new(ip, INGRESS_PORT);
                let server_name: ServerName<'static> = if ingress.name.is_empty() {
                    ServerName::IpAddress(ip.into())
                } else {
                    match ServerName::try_from(ingress.name.clone()) {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(ingress = index, error = %e, "invalid server name");
                            break;
                        }
                    }
                };

                let tcp = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                    Ok(Ok(tcp)) => tcp,
                    Ok(Err(e)) => {
                        warn!(ingress = index, address = %addr, error = %e, "connect failed");
                        continue;
                    }
                    Err(_) => {
                        warn!(ingress = index, address = %addr, "connect timed out");
                        continue;
                    }
                };

                match timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp)).await {
                    Ok(Ok(tls)) => {
                        debug!(ingress = index, address = %addr, "ingress connected");
                        return Ok((tls, ingress.clone()));
                    }
                    Ok(Err(e)) => {
                        warn!(ingress = index, address = %addr, error = %e, "TLS handshake failed")
                    }
                    Err(_) => {
                        warn!(ingress = index, address = %addr, "TLS handshake timed out")
                    }
                }
            }
        }

        Err(DialError::OutOfOptions)
    }

    /// Per-connection client credentials: a certificate for a fresh
    /// ephemeral key, signed by the vault identity, plus the vault's own
    /// self-issued certificate — a two-link chain back to a known identity.
    fn client_credentials(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), DialError> {
        let vault_id = self.vault.identity()?;
        let now = SystemTime::now();
        let template = CertTemplate::new(
            vec![],
            now - IDENTITY_CERT_WINDOW,
            now + 24 * IDENTITY_CERT_WINDOW,
        );

        let vault_der = self.vault.sign_certificate(&template, &vault_id)?;

        let ephemeral = backhaul_identity::Secret::generate();
        let ephemeral_der = self
            .vault
            .sign_certificate(&template, &ephemeral.identity())?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(ephemeral.to_pkcs8_der()?));

        Ok((
            vec![
                CertificateDer::from(ephemeral_der),
                CertificateDer::from(vault_der),
            ],
            key,
        ))
    }

    /// Root pool for one ingress: its explicit certificates plus, when it
    /// names a trusted identity, a certificate synthesized for that key so a
    /// peer can be trusted by public key alone.
    fn trust_roots(
        &self,
        ingress: &Ingress,
        effective: SystemTime,
    ) -> Result<RootCertStore, DialError> {
        let mut roots = RootCertStore::empty();

        for der in &ingress.certs {
            if let Err(e) = roots.add(CertificateDer::from(der.clone())) {
                warn!(error = %e, "skipping untrustable surface certificate");
            }
        }

        if let Some(identity) = &ingress.identity {
            let dns_names = if ingress.name.is_empty() {
                vec![]
            } else {
                vec![ingress.name.clone()]
            };
            let template = CertTemplate::new(
                dns_names,
                effective - IDENTITY_CERT_WINDOW,
                effective + IDENTITY_CERT_WINDOW,
            );
            match self.vault.sign_certificate(&template, identity) {
                Ok(der) => {
                    if let Err(e) = roots.add(CertificateDer::from(der)) {
                        warn!(error = %e, "synthesized identity certificate rejected");
                    }
                }
                Err(e) => warn!(error = %e, "could not synthesize identity certificate"),
            }
        }

        Ok(roots)
    }
}
