//! Broker API shapes
//!
//! Request/response bodies carried over the broker's HTTP endpoints. These
//! are opaque RPC schemas as far as the trust core is concerned — only the
//! shapes matter here, the routing lives broker-side.

use serde::{Deserialize, Serialize};

/// Tunnel establishment endpoint (`CONNECT` + upgrade)
pub const LISTEN_PATH: &str = "/v1/listen";

/// Identity echo endpoint
pub const IDENTIFY_PATH: &str = "/v1/identify";

/// Seat registration endpoint
pub const REGISTER_PATH: &str = "/v1/register";

/// Remote shell endpoint
pub const SHELL_PATH: &str = "/v1/shell";

/// Header carrying the auto-registration secret on `/v1/register`
pub const AUTO_REG_SECRET_HEADER: &str = "X-Auto-Reg-Secret";

/// Reverse-call header the broker sends ahead of a tunneled stream,
/// identifying the caller being patched through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connect {
    #[serde(rename = "Caller")]
    pub caller: String,
}

/// Response of `/v1/identify`: the identity the broker sees the client as
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyResponse {
    #[serde(rename = "Identity")]
    pub identity: String,
}

/// Response of `/v1/register`: the seat the device was registered as
/// and the organization it landed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    #[serde(rename = "Seat")]
    pub seat: String,

    #[serde(rename = "Org")]
    pub org: String,
}
