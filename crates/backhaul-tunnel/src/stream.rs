//! Identity-addressed reverse streams

use backhaul_identity::Identity;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A reverse stream handed over by the broker.
///
/// Plain duplex semantics over the tunneled TLS connection. Addressing is
/// logical: the two identities involved, not network addresses — the
/// broker's address is meaningless once the stream is patched through.
#[derive(Debug)]
pub struct TunnelStream {
    inner: TlsStream<TcpStream>,
    caller: Option<Identity>,
    local: Identity,
}

impl TunnelStream {
    pub(crate) fn new(
        inner: TlsStream<TcpStream>,
        caller: Option<Identity>,
        local: Identity,
    ) -> Self {
        Self {
            inner,
            caller,
            local,
        }
    }

    /// Identity of the caller, when the broker header carried a parseable one
    pub fn caller(&self) -> Option<&Identity> {
        self.caller.as_ref()
    }

    /// Our own identity on this stream
    pub fn local(&self) -> &Identity {
        &self.local
    }

    pub fn into_inner(self) -> TlsStream<TcpStream> {
        self.inner
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
