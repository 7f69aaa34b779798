//! Shell session request headers.

use http::HeaderMap;

/// Command to run instead of an interactive shell.
pub const HEADER_COMMAND: &str = "command";
/// Present when the caller wants a pty allocated.
pub const HEADER_PTY: &str = "pty";
/// Present when the caller wants framed multiplexing.
pub const HEADER_MUX: &str = "mux";
/// Repeatable `KEY=VALUE` environment entries.
pub const HEADER_ENV: &str = "env";
/// Names the agent a broker should route the session to. Routing
/// happens upstream of this crate; the constant is here so both
/// sides spell it the same way.
pub const HEADER_TARGET: &str = "target";

/// What the caller asked a session to look like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellRequest {
    pub command: Option<String>,
    pub pty: bool,
    pub mux: bool,
    pub env: Vec<String>,
}

impl ShellRequest {
    /// Reads session options out of request headers. The pty and mux
    /// flags are presence-only; their values are ignored.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let command = headers
            .get(HEADER_COMMAND)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let env = headers
            .get_all(HEADER_ENV)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_owned)
            .collect();
        ShellRequest {
            command,
            pty: headers.contains_key(HEADER_PTY),
            mux: headers.contains_key(HEADER_MUX),
            env,
        }
    }

    /// Splits the `KEY=VALUE` env entries, dropping malformed ones.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|entry| entry.split_once('='))
    }
}
