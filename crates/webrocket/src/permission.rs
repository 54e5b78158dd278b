//! Single-access permissions: a uid bound to a channel-name pattern by a
//! one-shot token.

use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;

use crate::error::VhostError;

/// Length of a generated single-access token, in hex characters.
pub const TOKEN_LENGTH: usize = 128;

/// A grant allowing one subscription to channels matching the pattern. The
/// pattern is matched against the whole channel name.
#[derive(Debug, Clone)]
pub struct Permission {
    uid: String,
    pattern: Regex,
    token: String,
}

impl Permission {
    pub fn new(uid: &str, pattern: &str) -> Result<Self, VhostError> {
        let compiled = Regex::new(&format!("^(?:{pattern})$"))?;
        let mut raw = [0u8; TOKEN_LENGTH / 2];
        OsRng.fill_bytes(&mut raw);
        Ok(Self {
            uid: uid.to_string(),
            pattern: compiled,
            token: hex::encode(raw),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_matching(&self, channel: &str) -> bool {
        self.pattern.is_match(channel)
    }
}
