//! Meeting records and shared data structures

use crate::identity::{AvatarColor, Identity, Uid};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Milliseconds since the Unix epoch, the timestamp unit stored in records
pub type Millis = i64;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Meeting identifier (nine lowercase letters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingId(String);

impl MeetingId {
    /// Wrap an existing meeting id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random nine-letter meeting id
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..9)
            .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
            .collect();
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display form `xxx-xxx-xxx`; ids of any other length are returned as is
    pub fn formatted(&self) -> String {
        if self.0.len() != 9 || !self.0.is_ascii() {
            return self.0.clone();
        }
        format!("{}-{}-{}", &self.0[0..3], &self.0[3..6], &self.0[6..9])
    }
}

impl std::fmt::Display for MeetingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-meeting policy set by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingSettings {
    /// Whether guests may request entry
    pub allow_guests: bool,
    /// Whether chat is enabled
    pub chat_enabled: bool,
    /// Roster size limit
    pub max_participants: u32,
    /// Whether non-hosts go through the waiting room
    pub require_approval: bool,
}

impl Default for MeetingSettings {
    fn default() -> Self {
        Self {
            allow_guests: true,
            chat_enabled: true,
            max_participants: 50,
            require_approval: true,
        }
    }
}

/// Meeting record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    /// Meeting id
    pub id: MeetingId,
    /// Host user id
    pub host_id: Uid,
    /// Host display name
    pub host_name: String,
    /// Title
    pub title: String,
    /// Creation timestamp
    pub created_at: Millis,
    /// Cleared when the host leaves
    pub is_active: bool,
    /// Policy
    #[serde(default)]
    pub settings: MeetingSettings,
}

/// Role of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Meeting host
    Host,
    /// Signed-in member
    Member,
    /// Guest
    Guest,
}

impl Role {
    /// Role an admitted (non-host) user gets
    pub fn for_identity(identity: &ParticipantIdentity) -> Self {
        match identity {
            ParticipantIdentity::Member { .. } => Role::Member,
            ParticipantIdentity::Guest { .. } => Role::Guest,
        }
    }
}

/// Identity details stored on participant and waiting-room records
///
/// Guest-only fields live on the `Guest` variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "identity", rename_all = "lowercase")]
pub enum ParticipantIdentity {
    /// Signed-in member
    Member {
        /// Account email
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        /// Profile photo
        #[serde(
            default,
            rename = "photoURL",
            skip_serializing_if = "Option::is_none"
        )]
        photo_url: Option<String>,
    },
    /// Guest
    Guest {
        /// Avatar background
        #[serde(rename = "avatarColor")]
        avatar_color: AvatarColor,
    },
}

impl ParticipantIdentity {
    /// Whether this is a guest
    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest { .. })
    }
}

impl From<&Identity> for ParticipantIdentity {
    fn from(identity: &Identity) -> Self {
        match identity {
            Identity::Member {
                email, photo_url, ..
            } => Self::Member {
                email: email.clone(),
                photo_url: photo_url.clone(),
            },
            Identity::Guest { avatar_color, .. } => Self::Guest {
                avatar_color: *avatar_color,
            },
        }
    }
}

/// Device flags mirrored on the participant record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    /// Camera enabled
    #[serde(default)]
    pub is_video_on: bool,
    /// Microphone enabled
    #[serde(default)]
    pub is_mic_on: bool,
    /// Screen share active
    #[serde(default)]
    pub is_presenting: bool,
    /// Hand raised
    #[serde(default)]
    pub has_raised_hand: bool,
}

impl DeviceState {
    /// Initial flags for a newly admitted participant
    pub fn joining(camera_on: bool, mic_on: bool) -> Self {
        Self {
            is_video_on: camera_on,
            is_mic_on: mic_on,
            is_presenting: false,
            has_raised_hand: false,
        }
    }
}

/// A single device flag, used for partial record updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFlag {
    /// `isVideoOn`
    Video,
    /// `isMicOn`
    Mic,
    /// `isPresenting`
    Presenting,
    /// `hasRaisedHand`
    RaisedHand,
}

impl DeviceFlag {
    /// Field name on the participant record
    pub fn field(self) -> &'static str {
        match self {
            Self::Video => "isVideoOn",
            Self::Mic => "isMicOn",
            Self::Presenting => "isPresenting",
            Self::RaisedHand => "hasRaisedHand",
        }
    }
}

/// Participant record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// User id
    pub uid: Uid,
    /// Display name
    pub name: String,
    /// Member or guest details
    #[serde(flatten)]
    pub identity: ParticipantIdentity,
    /// Role
    pub role: Role,
    /// Admission timestamp
    pub joined_at: Millis,
    /// Device flags
    #[serde(flatten)]
    pub devices: DeviceState,
}

impl Participant {
    /// Whether this participant hosts the meeting
    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }
}

/// Waiting-room entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingEntry {
    /// User id
    pub uid: Uid,
    /// Display name
    pub name: String,
    /// Member or guest details
    #[serde(flatten)]
    pub identity: ParticipantIdentity,
    /// Request timestamp
    pub requested_at: Millis,
    /// Camera intent chosen on the pre-join screen
    #[serde(default)]
    pub camera_on: bool,
    /// Microphone intent chosen on the pre-join screen
    #[serde(default)]
    pub mic_on: bool,
}

impl WaitingEntry {
    /// Build the participant record this entry is promoted to
    pub fn admit(&self, joined_at: Millis) -> Participant {
        Participant {
            uid: self.uid.clone(),
            name: self.name.clone(),
            identity: self.identity.clone(),
            role: Role::for_identity(&self.identity),
            joined_at,
            devices: DeviceState::joining(self.camera_on, self.mic_on),
        }
    }
}

/// Chat message record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message id (store push key)
    pub id: String,
    /// Sender user id
    pub sender_id: Uid,
    /// Sender display name
    pub sender_name: String,
    /// Message body
    pub text: String,
    /// Creation timestamp
    pub created_at: Millis,
}

/// Camera capture profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum QualityProfile {
    /// 640x360
    #[serde(rename = "360p")]
    Low360,
    /// 854x480
    #[serde(rename = "480p")]
    Sd480,
    /// 1280x720
    #[serde(rename = "720p")]
    #[default]
    Hd720,
    /// 1920x1080
    #[serde(rename = "1080p")]
    Hd1080,
}

impl QualityProfile {
    /// All profiles, lowest first
    pub const ALL: [QualityProfile; 4] = [
        QualityProfile::Low360,
        QualityProfile::Sd480,
        QualityProfile::Hd720,
        QualityProfile::Hd1080,
    ];

    /// Get width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::Low360 => 640,
            Self::Sd480 => 854,
            Self::Hd720 => 1280,
            Self::Hd1080 => 1920,
        }
    }

    /// Get height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::Low360 => 360,
            Self::Sd480 => 480,
            Self::Hd720 => 720,
            Self::Hd1080 => 1080,
        }
    }

    /// Target frame rate
    pub fn frame_rate(&self) -> u32 {
        30
    }

    /// Target bitrate in bits per second
    pub fn bitrate_bps(&self) -> u32 {
        match self {
            Self::Low360 => 400_000,
            Self::Sd480 => 800_000,
            Self::Hd720 => 2_500_000,
            Self::Hd1080 => 4_000_000,
        }
    }

    /// Short label, e.g. `720p`
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low360 => "360p",
            Self::Sd480 => "480p",
            Self::Hd720 => "720p",
            Self::Hd1080 => "1080p",
        }
    }
}

impl std::fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for QualityProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|q| q.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown quality profile: {s}"))
    }
}
