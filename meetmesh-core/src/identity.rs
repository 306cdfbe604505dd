//! Local identity
//!
//! Every record in a meeting is keyed by a user id ([`Uid`]). Identities come
//! from the authentication collaborator ([`IdentityProvider`]) for members, or
//! are generated on the spot for guests ([`Identity::guest`]).

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Characters the store refuses inside a single path segment
const FORBIDDEN_KEY_CHARS: &[char] = &['/', '.', '#', '$', '[', ']'];

/// User identifier, used verbatim as a store key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Create a uid without validation
    ///
    /// Use [`Uid::parse`] for input that did not come from the store or the
    /// authentication provider.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse and validate a uid so that it is usable as a store key
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        if s.is_empty() {
            anyhow::bail!("uid must not be empty");
        }
        if let Some(c) = s.chars().find(|c| FORBIDDEN_KEY_CHARS.contains(c)) {
            anyhow::bail!("uid {s:?} contains forbidden character {c:?}");
        }
        Ok(Self(s.to_string()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this uid was produced by the guest generator
    pub fn is_guest(&self) -> bool {
        self.0.starts_with(GUEST_UID_PREFIX)
    }
}

impl Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

const GUEST_UID_PREFIX: &str = "guest_";

/// Avatar background color assigned to guests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvatarColor {
    /// Blue
    #[serde(rename = "bg-blue-500")]
    Blue,
    /// Green
    #[serde(rename = "bg-green-500")]
    Green,
    /// Purple
    #[serde(rename = "bg-purple-500")]
    Purple,
    /// Pink
    #[serde(rename = "bg-pink-500")]
    Pink,
    /// Indigo
    #[serde(rename = "bg-indigo-500")]
    Indigo,
    /// Red
    #[serde(rename = "bg-red-500")]
    Red,
}

impl AvatarColor {
    /// Palette the guest generator picks from
    pub const PALETTE: [AvatarColor; 6] = [
        AvatarColor::Blue,
        AvatarColor::Green,
        AvatarColor::Purple,
        AvatarColor::Pink,
        AvatarColor::Indigo,
        AvatarColor::Red,
    ];

    /// Pick a random palette entry
    pub fn random() -> Self {
        *Self::PALETTE
            .choose(&mut rand::thread_rng())
            .unwrap_or(&AvatarColor::Blue)
    }
}

/// Identity of the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Identity {
    /// Authenticated account
    Member {
        /// User id issued by the authentication provider
        uid: Uid,
        /// Display name
        name: String,
        /// Account email
        email: Option<String>,
        /// Profile photo
        photo_url: Option<String>,
    },
    /// Unauthenticated guest with a generated id
    Guest {
        /// Generated user id
        uid: Uid,
        /// Display name typed on the pre-join screen
        name: String,
        /// Avatar background
        avatar_color: AvatarColor,
    },
}

impl Identity {
    /// Build a member identity
    pub fn member(uid: Uid, name: impl Into<String>) -> Self {
        Self::Member {
            uid,
            name: name.into(),
            email: None,
            photo_url: None,
        }
    }

    /// Generate a guest identity: `guest_<millis>_<9 base36 chars>`
    pub fn guest(name: impl Into<String>) -> Self {
        const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut rng = rand::thread_rng();
        let suffix: String = (0..9)
            .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
            .collect();
        let uid = Uid(format!(
            "{GUEST_UID_PREFIX}{}_{suffix}",
            chrono::Utc::now().timestamp_millis()
        ));
        Self::Guest {
            uid,
            name: name.into(),
            avatar_color: AvatarColor::random(),
        }
    }

    /// User id
    pub fn uid(&self) -> &Uid {
        match self {
            Self::Member { uid, .. } | Self::Guest { uid, .. } => uid,
        }
    }

    /// Display name
    pub fn name(&self) -> &str {
        match self {
            Self::Member { name, .. } | Self::Guest { name, .. } => name,
        }
    }

    /// Whether this is a guest identity
    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest { .. })
    }
}

/// Authentication collaborator
///
/// Returns the signed-in account, or `None` when the user has to join as a
/// guest.
pub trait IdentityProvider: Send + Sync {
    /// Currently signed-in identity
    fn current(&self) -> Option<Identity>;
}

/// Provider that always returns the same identity (or none)
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<Identity>);

impl IdentityProvider for StaticIdentity {
    fn current(&self) -> Option<Identity> {
        self.0.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_parse() {
        let uid = Uid::parse("alice").unwrap();
        assert_eq!(uid.as_str(), "alice");
        assert_eq!(uid.to_string(), "alice");

        assert!(Uid::parse("").is_err());
        assert!(Uid::parse("a/b").is_err());
        assert!(Uid::parse("a.b").is_err());
        assert!(Uid::parse("a[0]").is_err());
    }

    #[test]
    fn test_guest_identity_shape() {
        let guest = Identity::guest("Grace");
        assert!(guest.is_guest());
        assert_eq!(guest.name(), "Grace");

        let uid = guest.uid().as_str();
        assert!(uid.starts_with("guest_"));
        let suffix = uid.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert!(Uid::parse(uid).is_ok());
        assert!(guest.uid().is_guest());
    }

    #[test]
    fn test_guest_uids_differ() {
        let a = Identity::guest("a");
        let b = Identity::guest("b");
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn test_avatar_color_serialization() {
        let json = serde_json::to_string(&AvatarColor::Indigo).unwrap();
        assert_eq!(json, "\"bg-indigo-500\"");
        let back: AvatarColor = serde_json::from_str("\"bg-red-500\"").unwrap();
        assert_eq!(back, AvatarColor::Red);
    }

    #[test]
    fn test_member_identity() {
        let member = Identity::member(Uid::new("h1"), "Hank");
        assert!(!member.is_guest());
        assert_eq!(member.uid(), &Uid::new("h1"));
        assert!(!member.uid().is_guest());
    }
}
