use async_trait::async_trait;

use crate::error::VillaResult;
use crate::types::{
    Address, Avatar, DeveloperApp, Nickname, NicknameReservation, NormalizedNickname, Profile,
    Timestamp,
};

// ---------------------------------------------------------------------------
// ProfileRepository: profiles + nickname reservations
//
// The unique index on `nickname_normalized` is the authority for nickname
// ownership. Implementations report every collision as
// `VillaError::UniqueViolation` instead of failing opaquely.
// ---------------------------------------------------------------------------

/// Atomic transition from a reservation to a claimed nickname.
#[derive(Debug, Clone)]
pub struct ClaimCommit {
    pub address: Address,
    pub nickname: Nickname,
    pub now: Timestamp,
}

/// Conditional nickname change. Applies only if the stored change count
/// still equals `expected_change_count`.
#[derive(Debug, Clone)]
pub struct NicknameChangeCommit {
    pub address: Address,
    pub nickname: Nickname,
    pub expected_change_count: u32,
    pub now: Timestamp,
}

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn find_profile(&self, address: &Address) -> VillaResult<Option<Profile>>;

    async fn find_profile_by_nickname(
        &self,
        nickname: &NormalizedNickname,
    ) -> VillaResult<Option<Profile>>;

    /// Returns the stored reservation even if it has expired; callers decide
    /// liveness against their own `now`.
    async fn find_reservation(
        &self,
        nickname: &NormalizedNickname,
    ) -> VillaResult<Option<NicknameReservation>>;

    /// Atomic check-and-insert.
    ///
    /// - a profile already owning the nickname: `UniqueViolation(ProfileNickname)`
    /// - a live reservation by another address: `UniqueViolation(ReservationNickname)`
    /// - an expired reservation is replaced; the holder's own live reservation
    ///   is refreshed with the new `expires_at`.
    async fn insert_reservation(
        &self,
        reservation: &NicknameReservation,
        now: Timestamp,
    ) -> VillaResult<NicknameReservation>;

    /// Remove a reservation held by `address`. Returns false if none matched.
    async fn delete_reservation(
        &self,
        nickname: &NormalizedNickname,
        address: &Address,
    ) -> VillaResult<bool>;

    /// Delete the claimant's reservation and write the nickname onto the
    /// profile (creating it if needed) as a single transaction.
    ///
    /// Fails with `UniqueViolation(ProfileNickname)` if another profile won
    /// the race, `UniqueViolation(ReservationNickname)` if another address
    /// holds a live reservation on it, or `UniqueViolation(ProfileAddress)`
    /// if this address already carries a nickname.
    async fn commit_claim(&self, claim: &ClaimCommit) -> VillaResult<Profile>;

    /// Returns `Ok(None)` when the change count moved underneath the caller.
    ///
    /// Guarded like `commit_claim`: a live reservation by another address
    /// fails with `UniqueViolation(ReservationNickname)`, and the caller's own
    /// reservation on the new nickname is consumed.
    async fn commit_nickname_change(
        &self,
        change: &NicknameChangeCommit,
    ) -> VillaResult<Option<Profile>>;

    /// Set the avatar, creating a nickname-less profile if none exists.
    async fn upsert_avatar(
        &self,
        address: &Address,
        avatar: &Avatar,
        now: Timestamp,
    ) -> VillaResult<Profile>;

    async fn delete_expired_reservations(&self, now: Timestamp) -> VillaResult<u64>;

    async fn health_check(&self) -> VillaResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AppRepository: registered third-party integrations
//
// Apps are never deleted; origin updates and key rotation mutate in place.
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AppRepository: Send + Sync {
    async fn insert_app(&self, app: &DeveloperApp) -> VillaResult<()>;

    async fn find_app(&self, app_id: &str) -> VillaResult<Option<DeveloperApp>>;

    async fn list_apps_by_owner(&self, owner: &Address) -> VillaResult<Vec<DeveloperApp>>;

    async fn update_app_origins(
        &self,
        app_id: &str,
        origins: &[String],
        now: Timestamp,
    ) -> VillaResult<Option<DeveloperApp>>;

    async fn update_api_key_hash(
        &self,
        app_id: &str,
        api_key_hash: &str,
        now: Timestamp,
    ) -> VillaResult<Option<DeveloperApp>>;

    /// True if any app lists `origin` (already normalized) in its allowlist.
    async fn is_origin_registered(&self, origin: &str) -> VillaResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both repositories are used behind `Arc<dyn _>`
    fn _assert_profile_repo_object_safe(_: &dyn ProfileRepository) {}
    fn _assert_app_repo_object_safe(_: &dyn AppRepository) {}

    #[test]
    fn test_commit_structs_clone() {
        let commit = ClaimCommit {
            address: Address::parse("0x00000000000000000000000000000000000000aa").unwrap(),
            nickname: Nickname::from_stored("alice".into()),
            now: Timestamp::from_seconds(5),
        };
        let copy = commit.clone();
        assert_eq!(copy.nickname.normalized().as_str(), "alice");
        assert_eq!(copy.now, commit.now);
    }
}
