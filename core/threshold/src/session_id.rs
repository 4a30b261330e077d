use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha3::{digest::ExtendableOutput, Shake128};

pub const SESSION_ID_BYTES: usize = 128 / 8;

/// Fixed-size identifier of an MHE session, derived from its human readable name.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u128);

impl SessionId {
    /// Hashes the session name into a 128-bit (SESSION_ID_BYTES) digest.
    pub fn from_name(name: &str) -> SessionId {
        let mut hash = [0_u8; SESSION_ID_BYTES];
        Shake128::digest_xof(name, &mut hash);
        SessionId(u128::from_le_bytes(hash))
    }

    pub fn to_le_bytes(&self) -> [u8; SESSION_ID_BYTES] {
        self.0.to_le_bytes()
    }
}

impl FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SessionId::from_name(s))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<u128> for SessionId {
    fn from(id: u128) -> Self {
        SessionId(id)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::SessionId;

    #[test]
    fn sunshine() {
        // Validate that session ID is sufficiently large
        assert!(SessionId::from_name("test-session").0 > 2_u128.pow(100));
    }

    #[test]
    fn determinism() {
        let base = SessionId::from_str("test-session").unwrap();
        assert_eq!(base, SessionId::from_name("test-session"));
    }

    #[test]
    fn uniqueness() {
        // a one character change results in a different session id
        assert_ne!(
            SessionId::from_name("test-session"),
            SessionId::from_name("test-sessioN")
        );
    }
}
