//! Client side of a shell session.
//!
//! Pumps local input into stdin frames, dispatches inbound frames to
//! the local output streams and reports the exit status the server
//! sends before closing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::frame::{read_frame, FrameType, FrameWriter, Winch, MAX_PAYLOAD};
use crate::ShellError;

/// Terminal size updates to forward to the server. The initial size
/// goes out as soon as the session starts; later events follow as
/// they arrive.
pub struct WinchSource {
    pub initial: Winch,
    pub events: mpsc::Receiver<Winch>,
}

impl WinchSource {
    /// Snapshot of the local terminal for the initial update.
    pub fn current(events: mpsc::Receiver<Winch>) -> std::io::Result<Self> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok(WinchSource {
            initial: Winch {
                rows,
                cols,
                x: 0,
                y: 0,
            },
            events,
        })
    }
}

/// Puts the local terminal in raw mode until dropped.
pub struct RawModeGuard(());

impl RawModeGuard {
    pub fn enable() -> std::io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(RawModeGuard(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Drives a muxed session from the client end and returns the exit
/// status the server reported, or zero if the stream ended without
/// one.
pub async fn run_client<S, I, O, E>(
    stream: S,
    input: I,
    mut output: O,
    mut error: E,
    winch: Option<WinchSource>,
) -> Result<i32, ShellError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let (mut reader, write_half) = tokio::io::split(stream);
    let writer = FrameWriter::new(write_half);

    let stdin_writer = writer.clone();
    let stdin_task = tokio::spawn(async move {
        let mut input = input;
        let mut buf = [0u8; MAX_PAYLOAD];
        loop {
            match input.read(&mut buf).await {
                Ok(n) => {
                    // A zero length read doubles as the end-of-input
                    // signal on the wire.
                    if stdin_writer.send(FrameType::Stdin, &buf[..n]).await.is_err() {
                        break;
                    }
                    if n == 0 {
                        break;
                    }
                }
                Err(_) => {
                    let _ = stdin_writer.send(FrameType::Stdin, &[]).await;
                    break;
                }
            }
        }
    });

    let winch_task = winch.map(|mut source| {
        let winch_writer = writer.clone();
        tokio::spawn(async move {
            if winch_writer
                .send(FrameType::Winch, &source.initial.encode())
                .await
                .is_err()
            {
                return;
            }
            while let Some(event) = source.events.recv().await {
                if winch_writer
                    .send(FrameType::Winch, &event.encode())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    });

    let mut exit_code = 0;
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match frame.typed() {
                Some(FrameType::Stdin) | Some(FrameType::Stdout) => {
                    output.write_all(&frame.payload).await?;
                    output.flush().await?;
                }
                Some(FrameType::Stderr) => {
                    error.write_all(&frame.payload).await?;
                    error.flush().await?;
                }
                Some(FrameType::Exit) => {
                    exit_code = frame.payload.first().copied().unwrap_or(0) as i32;
                }
                Some(FrameType::Ping) => {}
                _ => debug!(frame_type = frame.frame_type, "ignoring unknown frame"),
            },
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "session stream failed");
                break;
            }
        }
    }

    stdin_task.abort();
    if let Some(task) = winch_task {
        task.abort();
    }
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn dispatches_frames_and_returns_exit() {
        let (stream, peer) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let (mut read, write) = tokio::io::split(peer);
            let writer = FrameWriter::new(write);

            let frame = read_frame(&mut read).await.unwrap().unwrap();
            assert_eq!(frame.typed(), Some(FrameType::Stdin));
            assert_eq!(frame.payload, b"echo hi\n");
            let frame = read_frame(&mut read).await.unwrap().unwrap();
            assert!(frame.payload.is_empty());

            writer.send(FrameType::Stdout, b"hi\n").await.unwrap();
            writer.send(FrameType::Stderr, b"oops").await.unwrap();
            writer.send(FrameType::Exit, &[7]).await.unwrap();
            writer.close().await.unwrap();
        });

        let input = Cursor::new(b"echo hi\n".to_vec());
        let mut out = Cursor::new(Vec::new());
        let mut err = Cursor::new(Vec::new());
        let code = run_client(stream, input, &mut out, &mut err, None)
            .await
            .unwrap();
        assert_eq!(code, 7);
        assert_eq!(out.get_ref(), b"hi\n");
        assert_eq!(err.get_ref(), b"oops");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn sends_initial_winch() {
        let (stream, peer) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(peer);
            let mut winch = None;
            while let Some(frame) = read_frame(&mut read).await.unwrap() {
                if frame.typed() == Some(FrameType::Winch) {
                    winch = Winch::decode(&frame.payload);
                    break;
                }
            }
            write.shutdown().await.unwrap();
            winch
        });

        let (_tx, events) = mpsc::channel(4);
        let source = WinchSource {
            initial: Winch {
                rows: 50,
                cols: 132,
                x: 0,
                y: 0,
            },
            events,
        };
        let input = Cursor::new(Vec::new());
        let mut out = Cursor::new(Vec::new());
        let mut err = Cursor::new(Vec::new());
        let code = run_client(stream, input, &mut out, &mut err, Some(source))
            .await
            .unwrap();
        assert_eq!(code, 0);
        let winch = server.await.unwrap().unwrap();
        assert_eq!((winch.rows, winch.cols), (50, 132));
    }

    #[tokio::test]
    async fn stream_end_without_exit_is_status_zero() {
        let (stream, peer) = tokio::io::duplex(64);
        drop(peer);
        let input = Cursor::new(Vec::new());
        let mut out = Cursor::new(Vec::new());
        let mut err = Cursor::new(Vec::new());
        let code = run_client(stream, input, &mut out, &mut err, None)
            .await
            .unwrap();
        assert_eq!(code, 0);
    }
}
