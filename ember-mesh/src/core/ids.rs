//! Identifiers
//!
//! Peer identifiers and human-shareable room codes.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

// =============================================================================
// PEER ID
// =============================================================================

/// Opaque peer identifier.
///
/// Generated locally, unique per process instance, never validated against
/// any central authority. Implements Ord for stable BTreeMap iteration.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing identifier (as received on the wire).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Entity identifier.
///
/// Every peer drives exactly one entity, keyed by its own peer id.
pub type EntityId = PeerId;

// =============================================================================
// ROOM CODE
// =============================================================================

/// Length of a room code.
pub const ROOM_CODE_LEN: usize = 6;

const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Short shared code identifying a session on the signaling transport.
///
/// Always six characters from `A-Z0-9`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a random room code.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input. Surrounding whitespace is ignored and lowercase
    /// letters are accepted and normalized.
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let code = input.trim().to_ascii_uppercase();
        let len = code.chars().count();
        if len != ROOM_CODE_LEN {
            return Err(RoomCodeError::Length(len));
        }
        if let Some(bad) = code.chars().find(|c| !c.is_ascii_uppercase() && !c.is_ascii_digit()) {
            return Err(RoomCodeError::Character(bad));
        }
        Ok(Self(code))
    }

    /// Get the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        // Wire codes must already be canonical.
        if value.trim() != value || value.to_ascii_uppercase() != value {
            return Err(RoomCodeError::NotCanonical);
        }
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

/// Room code validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomCodeError {
    /// Wrong number of characters.
    #[error("room code must be {ROOM_CODE_LEN} characters, got {0}")]
    Length(usize),

    /// Character outside `A-Z0-9`.
    #[error("room code contains invalid character {0:?}")]
    Character(char),

    /// Lowercase or padded code seen on the wire.
    #[error("room code is not in canonical form")]
    NotCanonical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_codes_are_valid() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let code = RoomCode::generate(&mut rng);
            assert_eq!(RoomCode::parse(code.as_str()), Ok(code));
        }
    }

    #[test]
    fn test_parse_normalizes_case() {
        let code = RoomCode::parse(" ab12cd ").unwrap();
        assert_eq!(code.as_str(), "AB12CD");
    }

    #[test]
    fn test_parse_rejects_bad_codes() {
        assert_eq!(RoomCode::parse("ABC"), Err(RoomCodeError::Length(3)));
        assert_eq!(RoomCode::parse("ABCDEFG"), Err(RoomCodeError::Length(7)));
        assert_eq!(RoomCode::parse("AB-12C"), Err(RoomCodeError::Character('-')));
        assert_eq!(RoomCode::parse(""), Err(RoomCodeError::Length(0)));
    }

    #[test]
    fn test_wire_codes_must_be_canonical() {
        assert!(serde_json::from_str::<RoomCode>("\"ABC123\"").is_ok());
        assert!(serde_json::from_str::<RoomCode>("\"abc123\"").is_err());
        assert!(serde_json::from_str::<RoomCode>("\"AB12\"").is_err());
    }

    #[test]
    fn test_peer_id_short() {
        let id = PeerId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(PeerId::new("abc").short(), "abc");
        assert_eq!(PeerId::generate().as_str().len(), 32);
    }
}
