//! Tunnel handshake: outbound connections that accept inbound callers
//!
//! A device dials out to a broker through the trust dialer, upgrades the
//! connection, and then sits idle until the broker multiplexes a caller onto
//! it. The result is a listener-shaped API: [`TunnelListener::accept`]
//! blocks until a reverse stream arrives, retrying transparently through
//! broker restarts and network trouble, and the streams it yields are
//! addressed by identity rather than by network address.

mod handshake;
mod listener;
mod stream;

pub use handshake::{await_reverse, upgrade, CALL_BYTE, PING_BYTE, PONG_BYTE, UPGRADE_PROTOCOL};
pub use listener::{TunnelError, TunnelListener, RETRY_BACKOFF};
pub use stream::TunnelStream;
