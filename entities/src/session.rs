//! Pairing-session identifiers shared by the relay and the peers.

use std::{fmt, str::FromStr};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of characters in a session code.
pub const SESSION_CODE_LEN: usize = 8;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("Session code must be {expected} characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("Session code contains invalid character '{0}'")]
    InvalidCharacter(char),
}

/// Human-typable join key: exactly eight characters of `[A-Z0-9]`.
///
/// Parsing normalizes to upper case, so `abcd1234` and `ABCD1234` name the
/// same session.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Draws a fresh code uniformly from the code alphabet.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code = (0..SESSION_CODE_LEN)
            .map(|_| {
                CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char
            })
            .collect();
        Self(code)
    }

    pub fn parse(input: &str) -> Result<Self, CodeError> {
        let normalized = input.trim().to_ascii_uppercase();
        let actual = normalized.chars().count();
        if actual != SESSION_CODE_LEN {
            return Err(CodeError::Length {
                expected: SESSION_CODE_LEN,
                actual,
            });
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !c.is_ascii_uppercase() && !c.is_ascii_digit())
        {
            return Err(CodeError::InvalidCharacter(bad));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

/// Pairing state of a session as tracked by the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created by a sender, no receiver yet.
    Waiting,
    /// A receiver joined and awaits the sender's decision.
    Pending,
    /// The sender accepted the receiver.
    Connected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Pending => "pending",
            SessionStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}
