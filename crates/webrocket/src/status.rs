//! Statuses produced by every dispatch path in the broker.
//!
//! Every request handled by an endpoint ends in a `Status`: codes below 300
//! are successes, 300-399 informational, 400 and above errors. The code also
//! drives the reply policy on the backend wire (`ER <code>` for errors).

use std::fmt;

/// A (code, message) pair describing the outcome of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: u16,
    message: &'static str,
}

impl Status {
    pub const fn new(code: u16, message: &'static str) -> Self {
        Self { code, message }
    }

    pub const fn broadcasted() -> Self {
        Self::new(204, "Broadcasted")
    }

    pub const fn channel_opened() -> Self {
        Self::new(250, "Channel opened")
    }

    pub const fn channel_exists() -> Self {
        Self::new(251, "Channel exists")
    }

    pub const fn channel_closed() -> Self {
        Self::new(252, "Channel closed")
    }

    pub const fn token_generated() -> Self {
        Self::new(270, "Single access token generated")
    }

    pub const fn disconnected() -> Self {
        Self::new(309, "Disconnected")
    }

    pub const fn bad_request() -> Self {
        Self::new(400, "Bad request")
    }

    pub const fn unauthorized() -> Self {
        Self::new(402, "Unauthorized")
    }

    pub const fn expired() -> Self {
        Self::new(408, "Expired")
    }

    pub const fn invalid_channel_name() -> Self {
        Self::new(451, "Invalid channel name")
    }

    pub const fn channel_not_found() -> Self {
        Self::new(454, "Channel not found")
    }

    pub const fn internal_error() -> Self {
        Self::new(597, "Internal error")
    }

    pub const fn code(&self) -> u16 {
        self.code
    }

    pub const fn message(&self) -> &'static str {
        self.message
    }

    pub const fn is_success(&self) -> bool {
        self.code < 300
    }

    pub const fn is_info(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    pub const fn is_error(&self) -> bool {
        self.code >= 400
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}
