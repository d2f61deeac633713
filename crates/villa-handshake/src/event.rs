use serde::{Deserialize, Serialize};
use villa_core::{Address, Avatar, Profile};

/// Avatar parameters as carried in the identity payload. Custom avatars
/// travel as style `custom` with the image URL in `selection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAvatar {
    pub style: String,
    #[serde(alias = "seed")]
    pub selection: String,
    #[serde(alias = "gender", deserialize_with = "villa_core::deserialize_avatar_variant")]
    pub variant: u32,
}

impl From<&Avatar> for IdentityAvatar {
    fn from(avatar: &Avatar) -> Self {
        let (style, selection, variant) = avatar.to_columns();
        Self {
            style,
            selection,
            variant: variant.max(0) as u32,
        }
    }
}

impl From<IdentityAvatar> for Avatar {
    fn from(a: IdentityAvatar) -> Self {
        Avatar::from_columns(a.style, a.selection, i32::try_from(a.variant).unwrap_or(i32::MAX))
    }
}

/// What a successful handshake hands back to the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub address: Address,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<IdentityAvatar>,
}

impl Identity {
    /// Identity of a claimed profile; `None` while the nickname is unclaimed.
    pub fn from_profile(profile: &Profile) -> Option<Self> {
        Some(Self {
            address: profile.address.clone(),
            nickname: profile.nickname.as_ref()?.as_str().to_string(),
            avatar: profile.avatar.as_ref().map(IdentityAvatar::from),
        })
    }
}

/// One logical handshake event, independent of its wire spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    Ready,
    Success(Identity),
    Error {
        message: String,
        code: Option<String>,
    },
    Cancel,
}

impl HandshakeEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HandshakeEvent::Ready)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeEvent::Ready => "ready",
            HandshakeEvent::Success(_) => "success",
            HandshakeEvent::Error { .. } => "error",
            HandshakeEvent::Cancel => "cancel",
        }
    }
}
