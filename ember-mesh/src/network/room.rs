//! Room Directory
//!
//! Maps a shareable room code to the one logical session this process takes
//! part in, and remembers the local role and profile.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::ids::{RoomCode, RoomCodeError};
use crate::game::map::DEFAULT_MAP_ID;

/// Shortest accepted display name (after trimming).
pub const NAME_MIN_LEN: usize = 3;

/// Longest accepted display name (after trimming).
pub const NAME_MAX_LEN: usize = 16;

/// Default match length in seconds.
pub const DEFAULT_MATCH_SECS: u32 = 300;

/// Rejected room input. Raised before any network action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoomError {
    /// Display name length outside the accepted range.
    #[error("display name must be 3 to 16 characters, got {0}")]
    InvalidName(usize),

    /// Match duration of zero.
    #[error("match duration must be positive")]
    InvalidDuration,

    /// Malformed room code.
    #[error("invalid room code: {0}")]
    InvalidRoomCode(#[from] RoomCodeError),
}

/// Local role in the room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Created the room; authoritative for match configuration.
    Host,
    /// Joined an existing room.
    Joiner,
}

/// Local participant profile supplied by the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Display name.
    pub name: String,
    /// Avatar identifier.
    pub avatar_id: String,
}

impl Profile {
    /// Create a profile.
    pub fn new(name: impl Into<String>, avatar_id: impl Into<String>) -> Self {
        Self { name: name.into(), avatar_id: avatar_id.into() }
    }

    /// Check the name length and return the profile with its name trimmed.
    pub fn validate(&self) -> Result<Profile, RoomError> {
        let name = self.name.trim();
        let len = name.chars().count();
        if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
            return Err(RoomError::InvalidName(len));
        }
        Ok(Profile { name: name.to_string(), avatar_id: self.avatar_id.clone() })
    }
}

/// Match configuration. Authoritative only when it comes from the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchConfig {
    /// Match length in seconds.
    #[serde(rename = "duration")]
    pub duration_secs: u32,
    /// Map to load.
    pub map_id: String,
    /// Wall-clock start, epoch milliseconds. Set when the host starts.
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<i64>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_SECS, DEFAULT_MAP_ID)
    }
}

impl MatchConfig {
    /// A config that has not started yet.
    pub fn new(duration_secs: u32, map_id: impl Into<String>) -> Self {
        Self { duration_secs, map_id: map_id.into(), start_time_ms: None }
    }

    /// Reject a zero-length match.
    pub fn validate(&self) -> Result<(), RoomError> {
        if self.duration_secs == 0 {
            return Err(RoomError::InvalidDuration);
        }
        Ok(())
    }

    /// Stamp the start time if it is not set yet.
    pub fn started_at(mut self, now_ms: i64) -> Self {
        self.start_time_ms.get_or_insert(now_ms);
        self
    }

    /// Wall-clock end, epoch milliseconds.
    pub fn end_time_ms(&self) -> Option<i64> {
        self.start_time_ms.map(|start| start + i64::from(self.duration_secs) * 1000)
    }

    /// Time left at `now_ms`. Zero once over; `None` before the start.
    pub fn remaining(&self, now_ms: i64) -> Option<Duration> {
        let end = self.end_time_ms()?;
        let left = u64::try_from(end.saturating_sub(now_ms)).unwrap_or(0);
        Some(Duration::from_millis(left))
    }
}

/// The room this process is in.
#[derive(Clone, Debug, PartialEq)]
pub struct Room {
    /// Room code.
    pub code: RoomCode,
    /// Local role.
    pub role: Role,
    /// Validated local profile.
    pub profile: Profile,
    /// Current match configuration, once known.
    pub match_config: Option<MatchConfig>,
}

/// Tracks the single live room.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    current: Option<Room>,
}

impl RoomDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Become host of a fresh room.
    pub fn create<R: Rng + ?Sized>(
        &mut self,
        profile: &Profile,
        match_config: MatchConfig,
        rng: &mut R,
    ) -> Result<&Room, RoomError> {
        let profile = profile.validate()?;
        match_config.validate()?;
        Ok(self.current.insert(Room {
            code: RoomCode::generate(rng),
            role: Role::Host,
            profile,
            match_config: Some(match_config),
        }))
    }

    /// Join an existing room as a joiner. Any cached match configuration is
    /// dropped; the host's will arrive over the channel.
    pub fn join(&mut self, code: &str, profile: &Profile) -> Result<&Room, RoomError> {
        let code = RoomCode::parse(code)?;
        let profile = profile.validate()?;
        Ok(self.current.insert(Room { code, role: Role::Joiner, profile, match_config: None }))
    }

    /// Leave the current room.
    pub fn leave(&mut self) -> Option<Room> {
        self.current.take()
    }

    /// The current room.
    pub fn current(&self) -> Option<&Room> {
        self.current.as_ref()
    }

    /// Mutable access to the current room.
    pub fn current_mut(&mut self) -> Option<&mut Room> {
        self.current.as_mut()
    }

    /// Local role, if in a room.
    pub fn role(&self) -> Option<Role> {
        self.current.as_ref().map(|r| r.role)
    }

    /// Current room code, if in a room.
    pub fn code(&self) -> Option<&RoomCode> {
        self.current.as_ref().map(|r| &r.code)
    }
}
