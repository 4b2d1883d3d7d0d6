//! Session tokens shared between client and server.
//!
//! A token namespaces every per-peer key in the shared state
//! (`update.index.<token>`, `avatar.<token>`, ...). Local tokens are freshly
//! generated v4 UUIDs; tokens of remote peers are taken verbatim from the keys
//! they publish, so parsing accepts any non-empty string.

use core::{fmt, str::FromStr};
use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one session in the shared key/value store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    /// Creates a new random token.
    pub fn generate() -> Self {
        SessionToken(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Key `<prefix>.<token>` namespaced under this session.
    pub fn key(&self, prefix: &str) -> String {
        format!("{prefix}.{}", self.0)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.0)
    }
}

impl FromStr for SessionToken {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TokenParseError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(TokenParseError::Whitespace);
        }
        Ok(SessionToken(s.to_owned()))
    }
}

impl AsRef<str> for SessionToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Parsing errors for peer-supplied tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenParseError {
    #[error("session token is empty")]
    Empty,
    #[error("session token contains whitespace")]
    Whitespace,
}
