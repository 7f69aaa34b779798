//! Skew-tolerant server certificate verification
//!
//! The verification clock is the surface document's timestamp, not the
//! system clock. If a server presents a certificate whose `NotBefore` is
//! ahead of that clock, our document is stale, so the clock is advanced to
//! the certificate's `NotBefore`. The adjustment is forward-only: no
//! legitimate server holds an older document than ours, and `NotAfter`
//! expiry is always enforced so certificates older than our last sync
//! still fail.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Verifies the peer chain against a per-dial root pool at an effective
/// verification time that only ever moves forward.
#[derive(Debug)]
pub struct SkewTolerantVerifier {
    inner: Arc<WebPkiServerVerifier>,
    /// Effective verification time, unix seconds
    effective: AtomicU64,
}

impl SkewTolerantVerifier {
    pub fn new(roots: RootCertStore, effective: SystemTime) -> Result<Self, rustls::Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        let secs = effective
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Ok(Self {
            inner,
            effective: AtomicU64::new(secs),
        })
    }

    /// Current effective verification time, unix seconds
    pub fn effective_time(&self) -> u64 {
        self.effective.load(Ordering::SeqCst)
    }

    fn advance_past_not_before(&self, certs: &[&CertificateDer<'_>]) -> Result<(), rustls::Error> {
        for der in certs {
            let (_, cert) = x509_parser::parse_x509_certificate(der)
                .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
            let not_before = cert.validity().not_before.timestamp();
            if not_before > 0 {
                let prev = self.effective.fetch_max(not_before as u64, Ordering::SeqCst);
                if (not_before as u64) > prev {
                    debug!(not_before, "peer certificate is ahead of document time, advancing verification clock");
                }
            }
        }
        Ok(())
    }
}

impl ServerCertVerifier for SkewTolerantVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain: Vec<&CertificateDer<'_>> = vec![end_entity];
        chain.extend(intermediates.iter());
        self.advance_past_not_before(&chain)?;

        let now = UnixTime::since_unix_epoch(Duration::from_secs(self.effective_time()));
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use time::OffsetDateTime;

    struct TestCa {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    fn test_ca() -> TestCa {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "test root");
        params.not_before = OffsetDateTime::from_unix_timestamp(1_000_000).unwrap();
        params.not_after = OffsetDateTime::from_unix_timestamp(4_000_000_000).unwrap();
        let cert = params.self_signed(&key).unwrap();
        TestCa { cert, key }
    }

    fn leaf(ca: &TestCa, not_before: i64, not_after: i64) -> CertificateDer<'static> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["s1.example.com".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "s1.example.com");
        params.not_before = OffsetDateTime::from_unix_timestamp(not_before).unwrap();
        params.not_after = OffsetDateTime::from_unix_timestamp(not_after).unwrap();
        params
            .signed_by(&key, &ca.cert, &ca.key)
            .unwrap()
            .der()
            .clone()
    }

    fn verifier(effective_secs: u64) -> (SkewTolerantVerifier, TestCa) {
        let ca = test_ca();
        let mut roots = RootCertStore::empty();
        roots.add(ca.cert.der().clone()).unwrap();
        let v = SkewTolerantVerifier::new(roots, UNIX_EPOCH + Duration::from_secs(effective_secs))
            .unwrap();
        (v, ca)
    }

    fn verify(
        v: &SkewTolerantVerifier,
        cert: &CertificateDer<'static>,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let name = ServerName::try_from("s1.example.com").unwrap();
        v.verify_server_cert(cert, &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn test_future_not_before_advances_clock() {
        // Document clock is behind the server's certificate window
        let (v, ca) = verifier(2_000_000);
        let cert = leaf(&ca, 3_000_000, 3_500_000);

        verify(&v, &cert).expect("skew tolerance accepts a newer server");
        assert_eq!(v.effective_time(), 3_000_000);
    }

    #[test]
    fn test_clock_never_moves_backward() {
        let (v, ca) = verifier(2_000_000);
        let newer = leaf(&ca, 3_000_000, 3_500_000);
        let older = leaf(&ca, 2_500_000, 3_400_000);

        verify(&v, &newer).unwrap();
        assert_eq!(v.effective_time(), 3_000_000);

        // An older-but-valid certificate does not roll the clock back
        verify(&v, &older).unwrap();
        assert_eq!(v.effective_time(), 3_000_000);
    }

    #[test]
    fn test_not_after_still_enforced() {
        // Expired relative to the document clock: stays rejected, the skew
        // adjustment never relaxes NotAfter.
        let (v, ca) = verifier(3_600_000);
        let expired = leaf(&ca, 3_000_000, 3_500_000);

        assert!(verify(&v, &expired).is_err());
        assert_eq!(v.effective_time(), 3_600_000);
    }

    #[test]
    fn test_wrong_hostname_rejected() {
        let (v, ca) = verifier(2_000_000);
        let cert = leaf(&ca, 2_000_000, 3_000_000);
        let name = ServerName::try_from("other.example.com").unwrap();
        assert!(v
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_err());
    }
}
