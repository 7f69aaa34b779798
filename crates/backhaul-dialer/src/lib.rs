//! The trust dialer: surface document + vault → authenticated connection
//!
//! Given a surface document and an identity-signing vault, the dialer walks
//! the document's ingress slots in priority order and produces one mutually
//! authenticated TLS connection, or fails once every candidate is exhausted.
//! Certificate validity is judged against the document's timestamp rather
//! than the system clock, with forward-only skew tolerance: a server ahead
//! of our last-known-good time is accepted, one behind it is not.

mod dialer;
mod verify;

pub use dialer::{DialError, Dialer, INGRESS_PORT};
pub use verify::SkewTolerantVerifier;
