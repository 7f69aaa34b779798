//! The upgrade exchange and the idle wait for reverse connections
//!
//! Both halves are generic over any duplex byte stream so they compose with
//! the trust dialer in production and with in-memory pipes in tests.

use crate::listener::TunnelError;
use backhaul_api::{Connect, LISTEN_PATH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Upgrade protocol token presented to the broker
pub const UPGRADE_PROTOCOL: &str = "backhaul-cast";

/// Broker heartbeat byte during the idle wait
pub const PING_BYTE: u8 = 0x01;

/// Our acknowledgement of a heartbeat
pub const PONG_BYTE: u8 = 0x02;

/// Marker announcing an incoming caller
pub const CALL_BYTE: u8 = 0xff;

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Send the `CONNECT /v1/listen` upgrade request and consume the response
/// head, requiring status 101.
///
/// Application data the broker pipelines into the same read as the response
/// head is not buffered; the attempt fails with [`TunnelError::HandshakeRace`]
/// and the retry loop picks it up.
pub async fn upgrade<S>(stream: &mut S, host: &str) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {LISTEN_PATH} HTTP/1.1\r\n\
         Upgrade: {UPGRADE_PROTOCOL}\r\n\
         Connection: Upgrade\r\n\
         Host: {host}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::with_capacity(1024);
    loop {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::Protocol(
                "connection closed during upgrade".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let code = response.code.unwrap_or(0);
                if code != 101 {
                    return Err(TunnelError::Protocol(format!(
                        "unexpected upgrade status {code}"
                    )));
                }
                if head_len != buf.len() {
                    return Err(TunnelError::HandshakeRace);
                }
                debug!("tunnel upgraded");
                return Ok(());
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_RESPONSE_HEAD {
                    return Err(TunnelError::Protocol("oversized response head".into()));
                }
            }
            Err(e) => {
                return Err(TunnelError::Protocol(format!("malformed response: {e}")));
            }
        }
    }
}

/// Idle-wait for a reverse connection.
///
/// One byte at a time: heartbeats are acknowledged, unknown bytes are
/// ignored for forward compatibility, and the call marker is followed by a
/// little-endian length and a JSON [`Connect`] header naming the caller.
/// Intentionally simple and low-throughput — this loop only runs while the
/// connection is idle, never during data transfer.
pub async fn await_reverse<S>(stream: &mut S) -> Result<Connect, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("awaiting reverse connection");
    loop {
        match stream.read_u8().await? {
            PING_BYTE => stream.write_all(&[PONG_BYTE]).await?,
            CALL_BYTE => {
                let len = stream.read_u16_le().await?;
                let mut header = vec![0u8; len as usize];
                stream.read_exact(&mut header).await?;
                let connect: Connect = serde_json::from_slice(&header)
                    .map_err(|e| TunnelError::Protocol(format!("broker header: {e}")))?;
                return Ok(connect);
            }
            other => trace!(byte = other, "ignoring unknown idle byte"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upgrade_accepts_101() {
        let (mut client, mut broker) = tokio::io::duplex(4096);

        broker
            .write_all(b"HTTP/1.1 101 Upgrade\r\nUpgrade: backhaul-cast\r\n\r\n")
            .await
            .unwrap();

        upgrade(&mut client, "s1.example.com").await.unwrap();

        // The request the broker sees
        let mut buf = vec![0u8; 512];
        let n = broker.read(&mut buf).await.unwrap();
        let req = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(req.starts_with("CONNECT /v1/listen HTTP/1.1\r\n"));
        assert!(req.contains("Upgrade: backhaul-cast\r\n"));
        assert!(req.contains("Host: s1.example.com\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_upgrade_rejects_other_status() {
        let (mut client, mut broker) = tokio::io::duplex(4096);

        broker
            .write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
            .await
            .unwrap();

        let err = upgrade(&mut client, "s1.example.com").await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_upgrade_rejects_early_data_race() {
        let (mut client, mut broker) = tokio::io::duplex(4096);

        // Head plus pipelined data in the same flight
        broker
            .write_all(b"HTTP/1.1 101 Upgrade\r\n\r\n\x01")
            .await
            .unwrap();

        let err = upgrade(&mut client, "s1.example.com").await.unwrap_err();
        assert!(matches!(err, TunnelError::HandshakeRace));
    }

    #[tokio::test]
    async fn test_upgrade_fails_on_close() {
        let (mut client, broker) = tokio::io::duplex(4096);
        drop(broker);
        assert!(upgrade(&mut client, "s1.example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_await_reverse_answers_ping_then_accepts_call() {
        let (mut client, mut broker) = tokio::io::duplex(4096);

        let driver = tokio::spawn(async move {
            broker.write_all(&[PING_BYTE]).await.unwrap();

            let mut ack = [0u8; 1];
            broker.read_exact(&mut ack).await.unwrap();
            assert_eq!(ack[0], PONG_BYTE);

            // Unknown idle byte must be ignored
            broker.write_all(&[0x42]).await.unwrap();

            let header = br#"{"Caller":"some-identity"}"#;
            broker.write_all(&[CALL_BYTE]).await.unwrap();
            broker
                .write_all(&(header.len() as u16).to_le_bytes())
                .await
                .unwrap();
            broker.write_all(header).await.unwrap();
        });

        let connect = await_reverse(&mut client).await.unwrap();
        assert_eq!(connect.caller, "some-identity");
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_await_reverse_rejects_malformed_header() {
        let (mut client, mut broker) = tokio::io::duplex(4096);

        broker.write_all(&[CALL_BYTE]).await.unwrap();
        broker.write_all(&7u16.to_le_bytes()).await.unwrap();
        broker.write_all(b"notjson").await.unwrap();

        let err = await_reverse(&mut client).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
    }
}
