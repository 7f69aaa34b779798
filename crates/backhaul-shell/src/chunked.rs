//! HTTP/1.1 chunked transfer codec.
//!
//! Sessions ride inside HTTP bodies whose length is unknown up front,
//! so both directions of the stream are wrapped in chunked encoding.
//! The reader understands chunk extensions and trailers; the writer
//! emits one chunk per write and the terminal chunk on shutdown.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const MAX_SIZE_LINE: usize = 256;

enum ReadState {
    SizeLine(Vec<u8>),
    Data { remaining: u64 },
    DataCr,
    DataLf,
    TrailerLine(Vec<u8>),
    Done,
}

/// Decodes a chunked body from the wrapped reader. After the terminal
/// chunk and its trailers, reads return a clean end of stream.
pub struct ChunkedReader<R> {
    inner: R,
    state: ReadState,
}

impl<R> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        ChunkedReader {
            inner,
            state: ReadState::SizeLine(Vec::new()),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn parse_size_line(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size is not ascii"))?;
    let text = text.trim_end_matches(['\r', '\n']);
    let text = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(text, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))
}

impl<R> AsyncRead for ChunkedReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ReadState::SizeLine(line) => {
                    let byte = ready!(read_byte(&mut this.inner, cx))?;
                    let byte = byte.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::UnexpectedEof, "eof in chunk size")
                    })?;
                    line.push(byte);
                    if line.len() > MAX_SIZE_LINE {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunk size line too long",
                        )));
                    }
                    if byte == b'\n' {
                        let size = parse_size_line(line)?;
                        this.state = if size == 0 {
                            ReadState::TrailerLine(Vec::new())
                        } else {
                            ReadState::Data { remaining: size }
                        };
                    }
                }
                ReadState::Data { remaining } => {
                    let want = (*remaining).min(buf.remaining() as u64) as usize;
                    if want == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let dst = buf.initialize_unfilled();
                    let mut sub = ReadBuf::new(&mut dst[..want]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut sub))?;
                    let got = sub.filled().len();
                    if got == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "eof in chunk data",
                        )));
                    }
                    buf.advance(got);
                    *remaining -= got as u64;
                    if *remaining == 0 {
                        this.state = ReadState::DataCr;
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::DataCr => {
                    let byte = ready!(read_byte(&mut this.inner, cx))?;
                    match byte {
                        Some(b'\r') => this.state = ReadState::DataLf,
                        Some(b'\n') => this.state = ReadState::SizeLine(Vec::new()),
                        _ => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "missing chunk terminator",
                            )))
                        }
                    }
                }
                ReadState::DataLf => {
                    let byte = ready!(read_byte(&mut this.inner, cx))?;
                    if byte != Some(b'\n') {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing chunk terminator",
                        )));
                    }
                    this.state = ReadState::SizeLine(Vec::new());
                }
                ReadState::TrailerLine(line) => {
                    let byte = ready!(read_byte(&mut this.inner, cx))?;
                    let Some(byte) = byte else {
                        // Peers that close right after the terminal
                        // chunk get treated as a finished body.
                        this.state = ReadState::Done;
                        return Poll::Ready(Ok(()));
                    };
                    line.push(byte);
                    if byte == b'\n' {
                        let blank = line == b"\r\n" || line == b"\n";
                        if blank {
                            this.state = ReadState::Done;
                            return Poll::Ready(Ok(()));
                        }
                        line.clear();
                    }
                }
                ReadState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

fn read_byte<R>(inner: &mut R, cx: &mut Context<'_>) -> Poll<io::Result<Option<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    let mut buf = ReadBuf::new(&mut byte);
    ready!(Pin::new(inner).poll_read(cx, &mut buf))?;
    if buf.filled().is_empty() {
        Poll::Ready(Ok(None))
    } else {
        Poll::Ready(Ok(Some(byte[0])))
    }
}

/// Encodes writes as HTTP chunks. Each successful write becomes one
/// chunk; shutdown emits the terminal chunk before closing the inner
/// writer. Empty writes are ignored so they cannot terminate the body
/// early.
pub struct ChunkedWriter<W> {
    inner: W,
    pending: Vec<u8>,
    written: usize,
    claimed: usize,
    terminated: bool,
}

impl<W> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        ChunkedWriter {
            inner,
            pending: Vec::new(),
            written: 0,
            claimed: 0,
            terminated: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W> ChunkedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W> AsyncWrite for ChunkedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            if data.is_empty() {
                return Poll::Ready(Ok(0));
            }
            this.pending
                .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            this.pending.extend_from_slice(data);
            this.pending.extend_from_slice(b"\r\n");
            this.claimed = data.len();
        }
        ready!(this.poll_drain(cx))?;
        Poll::Ready(Ok(this.claimed))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if !this.terminated {
            this.terminated = true;
            this.pending.extend_from_slice(b"0\r\n\r\n");
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
