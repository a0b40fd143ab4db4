//! Shared types for the attendance controller

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identity string the recognizer reports when no enrolled face matched
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Device activity state, owned exclusively by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Idle,
    Active,
    Streaming,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::Active => "active",
            DeviceState::Streaming => "streaming",
        }
    }

    /// Numeric value for the state gauge (0=idle, 1=active, 2=streaming)
    pub fn as_gauge(&self) -> u64 {
        match self {
            DeviceState::Idle => 0,
            DeviceState::Active => 1,
            DeviceState::Streaming => 2,
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Card reader polling mode
///
/// Never stored on its own: always derived from the device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    LowPower,
    Active,
}

impl PowerMode {
    /// Low power iff the device is idle
    #[inline]
    pub fn for_state(state: DeviceState) -> Self {
        match state {
            DeviceState::Idle => PowerMode::LowPower,
            DeviceState::Active | DeviceState::Streaming => PowerMode::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerMode::LowPower => "low_power",
            PowerMode::Active => "active",
        }
    }
}

/// Canonical card identifier: the card UID as an uppercase hex string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    /// Build from raw UID bytes as read off the card
    pub fn from_uid(uid: &[u8]) -> Self {
        Self(hex::encode_upper(uid))
    }

    /// Normalize a textual card id ("e2:ee:c8:01", "e2eec801") to canonical form
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned: String = raw.chars().filter(|c| !matches!(c, ':' | '-' | ' ')).collect();
        if cleaned.is_empty() || cleaned.len() % 2 != 0 {
            return None;
        }
        let bytes = hex::decode(&cleaned).ok()?;
        Some(Self::from_uid(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One face found by the recognizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceMatch {
    pub identity: String,
    pub confidence: f32,
    #[serde(alias = "croppedPath")]
    pub cropped_image_path: PathBuf,
}

impl FaceMatch {
    pub fn is_unknown(&self) -> bool {
        self.identity.is_empty() || self.identity == UNKNOWN_IDENTITY
    }
}

/// A card tap that produced a photo, waiting for recognition
///
/// Discarded once the recognition job has finished with it.
#[derive(Debug, Clone)]
pub struct AttendanceEvent {
    pub student_id: CardId,
    pub captured_image_path: PathBuf,
    pub timestamp: chrono::DateTime<chrono::Local>,
}
