//! Remote shell sessions over a single byte stream.
//!
//! A session multiplexes stdin, stdout, stderr, window resizes and the
//! final exit status over one bidirectional stream using small typed
//! frames. The server side spawns the requested program, with or
//! without a pty, and bridges its streams into frames; the client side
//! drives a local terminal against the same framing. A chunked
//! transfer codec is included for carrying sessions over HTTP/1.1
//! bodies that cannot predeclare a length.

mod chunked;
mod client;
mod frame;
mod request;
mod server;

pub use chunked::{ChunkedReader, ChunkedWriter};
pub use client::{run_client, RawModeGuard, WinchSource};
pub use frame::{read_frame, Frame, FrameType, FrameWriter, Winch, MAX_PAYLOAD};
pub use request::{
    ShellRequest, HEADER_COMMAND, HEADER_ENV, HEADER_MUX, HEADER_PTY, HEADER_TARGET,
};
pub use server::ShellServer;

/// Errors raised while running a shell session.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Shell IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shell spawn error: {0}")]
    Spawn(String),

    #[error("Shell frame too large: {0} bytes")]
    Oversized(usize),
}
