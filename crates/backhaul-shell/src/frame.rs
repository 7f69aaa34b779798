//! Session frame codec.
//!
//! Every frame is a four byte header followed by the payload:
//! a type byte, a reserved byte, and a little-endian u16 payload
//! length. Unknown types are carried through decode untouched so a
//! peer can skip what it does not speak.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::ShellError;

/// Largest payload a pump will put in a single frame. Reads from the
/// process and the local terminal are cut to this size.
pub const MAX_PAYLOAD: usize = 996;

/// Frame types understood by both ends of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Stdin = 1,
    Stdout = 2,
    Stderr = 3,
    Ping = 66,
    Winch = 81,
    Exit = 82,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(FrameType::Stdin),
            2 => Some(FrameType::Stdout),
            3 => Some(FrameType::Stderr),
            66 => Some(FrameType::Ping),
            81 => Some(FrameType::Winch),
            82 => Some(FrameType::Exit),
            _ => None,
        }
    }
}

/// One decoded frame. The type is kept as the raw wire byte so
/// unrecognized frames survive a decode-dispatch round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn typed(&self) -> Option<FrameType> {
        FrameType::from_byte(self.frame_type)
    }
}

/// Reads one frame, or `None` on a clean end of stream. End of stream
/// is only clean on a frame boundary; a stream cut mid-header or
/// mid-payload is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ShellError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_u8().await {
        Ok(byte) => header[0] = byte,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    reader.read_exact(&mut header[1..]).await?;
    let len = u16::from_le_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        frame_type: header[0],
        payload,
    }))
}

/// Shared frame writer. Sessions write frames from several tasks at
/// once, so each frame goes out as a single locked write.
pub struct FrameWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        FrameWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        FrameWriter {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send(&self, frame_type: FrameType, payload: &[u8]) -> Result<(), ShellError> {
        self.send_raw(frame_type as u8, payload).await
    }

    pub async fn send_raw(&self, frame_type: u8, payload: &[u8]) -> Result<(), ShellError> {
        if payload.len() > u16::MAX as usize {
            return Err(ShellError::Oversized(payload.len()));
        }
        let len = (payload.len() as u16).to_le_bytes();
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&[frame_type, 0, len[0], len[1]]);
        buf.extend_from_slice(payload);
        let mut writer = self.inner.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Unframed write for raw sessions that share the stream between
    /// output pumps.
    pub(crate) async fn write_bytes(&self, data: &[u8]) -> Result<(), ShellError> {
        let mut writer = self.inner.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ShellError> {
        let mut writer = self.inner.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Window size update carried in a winch frame: four little-endian
/// u16 values, rows then cols then pixel x and y.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Winch {
    pub rows: u16,
    pub cols: u16,
    pub x: u16,
    pub y: u16,
}

impl Winch {
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.rows.to_le_bytes());
        out[2..4].copy_from_slice(&self.cols.to_le_bytes());
        out[4..6].copy_from_slice(&self.x.to_le_bytes());
        out[6..8].copy_from_slice(&self.y.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        Some(Winch {
            rows: u16::from_le_bytes([payload[0], payload[1]]),
            cols: u16::from_le_bytes([payload[2], payload[3]]),
            x: u16::from_le_bytes([payload[4], payload[5]]),
            y: u16::from_le_bytes([payload[6], payload[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (client, server) = tokio::io::duplex(256);
        let writer = FrameWriter::new(client);
        writer.send(FrameType::Stdout, b"hello").await.unwrap();
        writer.send(FrameType::Exit, &[0]).await.unwrap();
        drop(writer);

        let mut server = server;
        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.typed(), Some(FrameType::Stdout));
        assert_eq!(frame.payload, b"hello");
        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.typed(), Some(FrameType::Exit));
        assert_eq!(frame.payload, [0]);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_length_frame() {
        let (client, server) = tokio::io::duplex(64);
        let writer = FrameWriter::new(client);
        writer.send(FrameType::Stdin, &[]).await.unwrap();
        drop(writer);

        let mut server = server;
        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.typed(), Some(FrameType::Stdin));
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn unknown_type_survives_decode() {
        let (client, server) = tokio::io::duplex(64);
        let writer = FrameWriter::new(client);
        writer.send_raw(200, b"x").await.unwrap();
        drop(writer);

        let mut server = server;
        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.frame_type, 200);
        assert!(frame.typed().is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_clean_eof_only_at_boundary() {
        let (mut client, server) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        client.write_all(&[1, 0]).await.unwrap();
        drop(client);

        let mut server = server;
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        client.write_all(&[2, 0, 10, 0, b'a', b'b']).await.unwrap();
        drop(client);

        let mut server = server;
        assert!(read_frame(&mut server).await.is_err());
    }

    #[test]
    fn winch_encoding() {
        let winch = Winch {
            rows: 40,
            cols: 120,
            x: 0,
            y: 0,
        };
        let bytes = winch.encode();
        assert_eq!(&bytes[0..2], &40u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &120u16.to_le_bytes());
        assert_eq!(Winch::decode(&bytes), Some(winch));
        assert_eq!(Winch::decode(&bytes[..7]), None);
    }
}
