//! Surface document model

use backhaul_identity::Identity;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Hard cap on ingress slots. The wire format addresses slots by a 4-bit
/// index, and the position is the identifier: slot 0 is tried first, later
/// slots are fallbacks. Growth beyond 16 is a format revision, never a wrap.
pub const MAX_INGRESSES: usize = 16;

/// Serialized documents never exceed this many bytes; encoding drops
/// least-important trailing records instead of failing.
pub const MAX_DOCUMENT_LEN: usize = 32767;

/// Certificates longer than this are dropped on encode
pub const MAX_CERT_LEN: usize = 16000;

/// One broker endpoint entry: how to reach it and what to trust.
///
/// A slot with no data at all is unused and skipped by codec and dialer
/// alike.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ingress {
    /// DNS hostname, also used as the TLS server name
    pub name: String,

    /// Trusted public key; the dialer derives a certificate for it
    pub identity: Option<Identity>,

    /// Explicitly trusted DER certificates, the escape hatch for externally
    /// issued certs (e.g. a public CA)
    pub certs: Vec<Vec<u8>>,

    /// Literal addresses, supplementing DNS resolution
    pub ips: Vec<IpAddr>,
}

impl Ingress {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.identity.is_none() && self.certs.is_empty() && self.ips.is_empty()
    }
}

/// A surface document.
///
/// `timestamp` is unix seconds; zero means unset, in which case consumers
/// fall back to the system clock (a degraded-trust condition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    /// Monotonically advancing document version
    pub serial: u64,

    /// Serial of the document this one supersedes; always < `serial`
    pub precedent: u64,

    /// Single-use identity authorizing the next update. Never reused across
    /// documents: documents are not hash-chained, so a reused sequencer lets
    /// a message replay on a different chain.
    pub sequencer: Identity,

    /// Creation time, unix seconds, second resolution
    pub timestamp: u64,

    /// Ingress slots in priority order
    pub ingresses: [Ingress; MAX_INGRESSES],
}

impl Default for Surface {
    fn default() -> Self {
        Self {
            serial: 0,
            precedent: 0,
            sequencer: Identity::from_bytes([0; 32]),
            timestamp: 0,
            ingresses: Default::default(),
        }
    }
}

impl Surface {
    /// The trusted clock anchor, if the document carries one
    pub fn time(&self) -> Option<SystemTime> {
        if self.timestamp == 0 {
            None
        } else {
            Some(UNIX_EPOCH + Duration::from_secs(self.timestamp))
        }
    }

    /// Populated (non-empty) ingress slots with their indices
    pub fn active_ingresses(&self) -> impl Iterator<Item = (usize, &Ingress)> {
        self.ingresses.iter().enumerate().filter(|(_, i)| !i.is_empty())
    }
}
