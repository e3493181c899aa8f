//! Shared-secret client identity (a 16-byte UUID).
//!
//! The identity is compared for plain equality against the bytes a client
//! sends in its handshake. It is a shared secret, not a key.

use crate::error::{VeilError, VeilResult};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Length of an identity on the wire.
pub const IDENTITY_LEN: usize = 16;

/// The configured 16-byte client identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Identity(Uuid);

impl Identity {
    /// Build an identity from raw wire bytes.
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw 16 bytes as they appear in a handshake.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        self.0.as_bytes()
    }

    /// Whether `candidate` equals this identity byte-for-byte.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        candidate == self.as_bytes()
    }

    /// First 8 hex characters, safe to put in logs.
    pub fn redacted(&self) -> String {
        let s = self.0.simple().to_string();
        format!("{}...", &s[..8])
    }
}

impl FromStr for Identity {
    type Err = VeilError;

    fn from_str(s: &str) -> VeilResult<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(VeilError::Config("identity (UUID) is not set".into()));
        }
        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|e| VeilError::Config(format!("invalid identity {trimmed:?}: {e}")))
    }
}

impl TryFrom<String> for Identity {
    type Error = VeilError;

    fn try_from(s: String) -> VeilResult<Self> {
        s.parse()
    }
}

/// Hyphenated lowercase form, as used in share links and the secret path.
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// Debug never prints the full secret.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.redacted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "add6222b-180c-4172-a920-62ed1ce06110";

    #[test]
    fn parses_hyphenated_and_simple() {
        let a: Identity = SAMPLE.parse().unwrap();
        let b: Identity = "add6222b180c4172a92062ed1ce06110".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), SAMPLE);
        assert_eq!(a.as_bytes()[0], 0xad);
        assert_eq!(a.as_bytes()[15], 0x10);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Identity>().is_err());
        assert!("   ".parse::<Identity>().is_err());
        assert!("not-a-uuid".parse::<Identity>().is_err());
        assert!("add6222b-180c-4172-a920".parse::<Identity>().is_err());
    }

    #[test]
    fn matches_only_exact_bytes() {
        let id: Identity = SAMPLE.parse().unwrap();
        let mut bytes = *id.as_bytes();
        assert!(id.matches(&bytes));
        bytes[7] ^= 0x01;
        assert!(!id.matches(&bytes));
        assert!(!id.matches(&bytes[..15]));
    }

    #[test]
    fn debug_is_redacted() {
        let id: Identity = SAMPLE.parse().unwrap();
        let dbg = format!("{id:?}");
        assert!(dbg.contains("add6222b"));
        assert!(!dbg.contains("62ed1ce06110"));
    }
}
