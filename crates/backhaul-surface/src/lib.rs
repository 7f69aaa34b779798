//! Surface documents: signed, versioned records of trusted ingress endpoints
//!
//! A surface document tells a device how to reach its brokers and what to
//! trust when it gets there. Documents are append-only: each one names the
//! serial it supersedes (`precedent`), carries a fresh single-use sequencer
//! key authorizing the next update, and a timestamp that doubles as the
//! device's trusted clock anchor.
//!
//! The wire format is deliberately boring — a fixed header followed by typed
//! records grouped by importance — so a decoder can stop early at an unknown
//! record type and still hold a valid prefix.

mod codec;
mod document;
mod store;

pub use codec::SurfaceError;
pub use document::{Ingress, Surface, MAX_CERT_LEN, MAX_DOCUMENT_LEN, MAX_INGRESSES};
pub use store::StoreError;
