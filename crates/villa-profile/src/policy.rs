//! Nickname change policy: a bounded number of changes separated by a cooldown.

use serde::{Deserialize, Serialize};
use villa_core::{Profile, Timestamp};

pub const DEFAULT_MAX_CHANGES: u32 = 1;
pub const DEFAULT_COOLDOWN_SECONDS: u64 = 30 * 24 * 60 * 60;

pub const REASON_LIMIT_REACHED: &str = "Nickname change limit reached";
pub const REASON_COOLDOWN: &str = "Nickname change cooldown active";
pub const REASON_NOT_CLAIMED: &str = "No nickname claimed yet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicknamePolicy {
    pub max_changes: u32,
    pub cooldown_seconds: u64,
}

impl Default for NicknamePolicy {
    fn default() -> Self {
        Self {
            max_changes: DEFAULT_MAX_CHANGES,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
        }
    }
}

/// Machine-checkable answer to "may this profile change its nickname now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicknameEligibility {
    pub can_change_nickname: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub changes_remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_change_at: Option<Timestamp>,
}

impl NicknamePolicy {
    /// Evaluate the policy for `profile` at `now`.
    ///
    /// Order: a profile that never changed is always allowed; then the
    /// change limit; then the cooldown since the last change.
    pub fn can_change(&self, profile: &Profile, now: Timestamp) -> NicknameEligibility {
        let count = profile.nickname_change_count;
        let remaining = self.max_changes.saturating_sub(count);

        if profile.nickname.is_none() {
            return NicknameEligibility {
                can_change_nickname: false,
                reason: Some(REASON_NOT_CLAIMED.into()),
                changes_remaining: remaining,
                next_change_at: None,
            };
        }

        if count == 0 {
            return NicknameEligibility {
                can_change_nickname: true,
                reason: None,
                changes_remaining: remaining,
                next_change_at: None,
            };
        }

        if count >= self.max_changes {
            return NicknameEligibility {
                can_change_nickname: false,
                reason: Some(REASON_LIMIT_REACHED.into()),
                changes_remaining: 0,
                next_change_at: None,
            };
        }

        if let Some(last) = profile.last_nickname_change_at {
            if now.seconds_since(&last) < self.cooldown_seconds {
                return NicknameEligibility {
                    can_change_nickname: false,
                    reason: Some(REASON_COOLDOWN.into()),
                    changes_remaining: remaining,
                    next_change_at: Some(last.plus_seconds(self.cooldown_seconds)),
                };
            }
        }

        NicknameEligibility {
            can_change_nickname: true,
            reason: None,
            changes_remaining: remaining,
            next_change_at: None,
        }
    }
}
