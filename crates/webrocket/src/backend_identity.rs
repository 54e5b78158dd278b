//! The identity line opening every backend connection.
//!
//! Shape: `<sock>:<vhost>:<access-token>:<client-id>` where `<sock>` picks
//! the one-shot REQ or long-lived DEALER flavor, the access token is the
//! vhost's 40-character secret and the client id a 36-character uuid.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static IDENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(req|dlr):(/[A-Za-z0-9_\-./]+):([A-Za-z0-9]{40}):([0-9a-f\-]{36})$")
        .expect("identity pattern")
});

/// Backend socket flavors, parsed once from the identity line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// One-shot request/reply peer.
    Req,
    /// Long-lived worker peer.
    Dealer,
}

#[derive(Debug, Clone)]
pub struct BackendIdentity {
    pub socket: SocketType,
    pub vhost: String,
    pub access_token: String,
    pub id: String,
}

#[derive(Debug, Error)]
#[error("malformed backend identity")]
pub struct ParseIdentityError;

pub fn parse_backend_identity(raw: &str) -> Result<BackendIdentity, ParseIdentityError> {
    let caps = IDENTITY.captures(raw).ok_or(ParseIdentityError)?;
    let socket = match &caps[1] {
        "req" => SocketType::Req,
        _ => SocketType::Dealer,
    };
    Ok(BackendIdentity {
        socket,
        vhost: caps[2].to_string(),
        access_token: caps[3].to_string(),
        id: caps[4].to_string(),
    })
}
