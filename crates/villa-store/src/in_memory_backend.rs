use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use villa_core::{
    Address, AppRepository, Avatar, ClaimCommit, DeveloperApp, NicknameChangeCommit,
    NicknameReservation, NormalizedNickname, Profile, ProfileRepository, Timestamp,
    UniqueConstraint, VillaError, VillaResult,
};

/// In-memory repository implementing both `ProfileRepository` and `AppRepository`.
///
/// Used for tests and for running without a database. Every operation takes
/// a single lock over all tables, so each call is atomic the way a Postgres
/// transaction is, and the nickname index enforces the same uniqueness as
/// the SQL unique constraint.
pub struct InMemoryRepository {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    profiles: HashMap<Address, Profile>,
    /// nickname_normalized -> owning address
    nickname_index: HashMap<NormalizedNickname, Address>,
    reservations: HashMap<NormalizedNickname, NicknameReservation>,
    apps: HashMap<String, DeveloperApp>,
}

impl State {
    fn profile_owner(&self, nickname: &NormalizedNickname) -> Option<&Address> {
        self.nickname_index.get(nickname)
    }

    fn claim_nickname_on(
        &mut self,
        address: &Address,
        nickname: &villa_core::Nickname,
    ) -> VillaResult<()> {
        let normalized = nickname.normalized();
        if let Some(owner) = self.profile_owner(&normalized) {
            if owner != address {
                return Err(VillaError::UniqueViolation {
                    constraint: UniqueConstraint::ProfileNickname,
                    value: normalized.to_string(),
                });
            }
        }
        self.nickname_index.insert(normalized, address.clone());
        Ok(())
    }

    fn ensure_not_reserved_by_other(
        &self,
        nickname: &NormalizedNickname,
        address: &Address,
        now: Timestamp,
    ) -> VillaResult<()> {
        match self.reservations.get(nickname) {
            Some(r) if r.is_live(now) && &r.address != address => {
                Err(VillaError::UniqueViolation {
                    constraint: UniqueConstraint::ReservationNickname,
                    value: nickname.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

fn lock_state(mutex: &Mutex<State>) -> VillaResult<MutexGuard<'_, State>> {
    mutex
        .lock()
        .map_err(|e| VillaError::Storage(format!("lock poisoned: {}", e)))
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Number of stored profiles (for testing/inspection).
    pub fn profile_count(&self) -> usize {
        lock_state(&self.state)
            .map(|s| s.profiles.len())
            .unwrap_or(0)
    }

    /// Number of stored reservations, live or expired (for testing/inspection).
    pub fn reservation_count(&self) -> usize {
        lock_state(&self.state)
            .map(|s| s.reservations.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileRepository for InMemoryRepository {
    async fn find_profile(&self, address: &Address) -> VillaResult<Option<Profile>> {
        let state = lock_state(&self.state)?;
        Ok(state.profiles.get(address).cloned())
    }

    async fn find_profile_by_nickname(
        &self,
        nickname: &NormalizedNickname,
    ) -> VillaResult<Option<Profile>> {
        let state = lock_state(&self.state)?;
        Ok(state
            .profile_owner(nickname)
            .and_then(|owner| state.profiles.get(owner))
            .cloned())
    }

    async fn find_reservation(
        &self,
        nickname: &NormalizedNickname,
    ) -> VillaResult<Option<NicknameReservation>> {
        let state = lock_state(&self.state)?;
        Ok(state.reservations.get(nickname).cloned())
    }

    async fn insert_reservation(
        &self,
        reservation: &NicknameReservation,
        now: Timestamp,
    ) -> VillaResult<NicknameReservation> {
        let mut state = lock_state(&self.state)?;
        let key = &reservation.nickname_normalized;

        if state.profile_owner(key).is_some() {
            return Err(VillaError::UniqueViolation {
                constraint: UniqueConstraint::ProfileNickname,
                value: key.to_string(),
            });
        }

        if let Some(existing) = state.reservations.get(key) {
            if existing.is_live(now) && existing.address != reservation.address {
                return Err(VillaError::UniqueViolation {
                    constraint: UniqueConstraint::ReservationNickname,
                    value: key.to_string(),
                });
            }
        }

        state.reservations.insert(key.clone(), reservation.clone());
        Ok(reservation.clone())
    }

    async fn delete_reservation(
        &self,
        nickname: &NormalizedNickname,
        address: &Address,
    ) -> VillaResult<bool> {
        let mut state = lock_state(&self.state)?;
        match state.reservations.get(nickname) {
            Some(r) if &r.address == address => {
                state.reservations.remove(nickname);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_claim(&self, claim: &ClaimCommit) -> VillaResult<Profile> {
        let mut state = lock_state(&self.state)?;
        let normalized = claim.nickname.normalized();

        if let Some(existing) = state.profiles.get(&claim.address) {
            if existing.nickname.is_some() {
                return Err(VillaError::UniqueViolation {
                    constraint: UniqueConstraint::ProfileAddress,
                    value: claim.address.to_string(),
                });
            }
        }
        state.ensure_not_reserved_by_other(&normalized, &claim.address, claim.now)?;
        state.claim_nickname_on(&claim.address, &claim.nickname)?;

        if matches!(state.reservations.get(&normalized), Some(r) if r.address == claim.address) {
            state.reservations.remove(&normalized);
        }

        let profile = state
            .profiles
            .entry(claim.address.clone())
            .or_insert_with(|| Profile::empty(claim.address.clone(), claim.now));
        profile.nickname = Some(claim.nickname.clone());
        profile.nickname_normalized = Some(normalized);
        profile.updated_at = claim.now;
        Ok(profile.clone())
    }

    async fn commit_nickname_change(
        &self,
        change: &NicknameChangeCommit,
    ) -> VillaResult<Option<Profile>> {
        let mut state = lock_state(&self.state)?;
        let (previous, count) = match state.profiles.get(&change.address) {
            Some(p) => (p.nickname_normalized.clone(), p.nickname_change_count),
            None => return Err(VillaError::NotFound(format!("profile {}", change.address))),
        };
        if count != change.expected_change_count {
            return Ok(None);
        }

        let normalized = change.nickname.normalized();
        state.ensure_not_reserved_by_other(&normalized, &change.address, change.now)?;
        state.claim_nickname_on(&change.address, &change.nickname)?;
        if let Some(prev) = previous {
            if prev != normalized {
                state.nickname_index.remove(&prev);
            }
        }
        if matches!(state.reservations.get(&normalized), Some(r) if r.address == change.address) {
            state.reservations.remove(&normalized);
        }

        let profile = match state.profiles.get_mut(&change.address) {
            Some(p) => p,
            None => return Err(VillaError::NotFound(format!("profile {}", change.address))),
        };
        profile.nickname = Some(change.nickname.clone());
        profile.nickname_normalized = Some(normalized);
        profile.nickname_change_count = count.saturating_add(1);
        profile.last_nickname_change_at = Some(change.now);
        profile.updated_at = change.now;
        Ok(Some(profile.clone()))
    }

    async fn upsert_avatar(
        &self,
        address: &Address,
        avatar: &Avatar,
        now: Timestamp,
    ) -> VillaResult<Profile> {
        let mut state = lock_state(&self.state)?;
        let profile = state
            .profiles
            .entry(address.clone())
            .or_insert_with(|| Profile::empty(address.clone(), now));
        profile.avatar = Some(avatar.clone());
        profile.updated_at = now;
        Ok(profile.clone())
    }

    async fn delete_expired_reservations(&self, now: Timestamp) -> VillaResult<u64> {
        let mut state = lock_state(&self.state)?;
        let before = state.reservations.len();
        state.reservations.retain(|_, r| r.is_live(now));
        Ok((before - state.reservations.len()) as u64)
    }
}

#[async_trait]
impl AppRepository for InMemoryRepository {
    async fn insert_app(&self, app: &DeveloperApp) -> VillaResult<()> {
        let mut state = lock_state(&self.state)?;
        if state.apps.contains_key(&app.app_id) {
            return Err(VillaError::UniqueViolation {
                constraint: UniqueConstraint::AppId,
                value: app.app_id.clone(),
            });
        }
        if state
            .apps
            .values()
            .any(|a| a.api_key_hash == app.api_key_hash)
        {
            return Err(VillaError::UniqueViolation {
                constraint: UniqueConstraint::ApiKey,
                value: app.app_id.clone(),
            });
        }
        state.apps.insert(app.app_id.clone(), app.clone());
        Ok(())
    }

    async fn find_app(&self, app_id: &str) -> VillaResult<Option<DeveloperApp>> {
        let state = lock_state(&self.state)?;
        Ok(state.apps.get(app_id).cloned())
    }

    async fn list_apps_by_owner(&self, owner: &Address) -> VillaResult<Vec<DeveloperApp>> {
        let state = lock_state(&self.state)?;
        let mut apps: Vec<DeveloperApp> = state
            .apps
            .values()
            .filter(|a| &a.owner_address == owner)
            .cloned()
            .collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apps)
    }

    async fn update_app_origins(
        &self,
        app_id: &str,
        origins: &[String],
        now: Timestamp,
    ) -> VillaResult<Option<DeveloperApp>> {
        let mut state = lock_state(&self.state)?;
        Ok(state.apps.get_mut(app_id).map(|app| {
            app.allowed_origins = origins.to_vec();
            app.updated_at = now;
            app.clone()
        }))
    }

    async fn update_api_key_hash(
        &self,
        app_id: &str,
        api_key_hash: &str,
        now: Timestamp,
    ) -> VillaResult<Option<DeveloperApp>> {
        let mut state = lock_state(&self.state)?;
        Ok(state.apps.get_mut(app_id).map(|app| {
            app.api_key_hash = api_key_hash.to_string();
            app.updated_at = now;
            app.clone()
        }))
    }

    async fn is_origin_registered(&self, origin: &str) -> VillaResult<bool> {
        let state = lock_state(&self.state)?;
        Ok(state
            .apps
            .values()
            .any(|a| a.allowed_origins.iter().any(|o| o == origin)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use villa_core::Nickname;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn reservation(nick: &str, who: &Address, expires: u64) -> NicknameReservation {
        NicknameReservation {
            nickname_normalized: NormalizedNickname::from_stored(nick.into()),
            address: who.clone(),
            expires_at: Timestamp::from_seconds(expires),
            created_at: Timestamp::from_seconds(0),
        }
    }

    #[tokio::test]
    async fn test_reservation_conflict_and_expiry() {
        let repo = InMemoryRepository::new();
        let (a, b) = (addr(1), addr(2));

        repo.insert_reservation(&reservation("alice", &a, 600), Timestamp::from_seconds(0))
            .await
            .unwrap();

        let err = repo
            .insert_reservation(&reservation("alice", &b, 700), Timestamp::from_seconds(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VillaError::UniqueViolation {
                constraint: UniqueConstraint::ReservationNickname,
                ..
            }
        ));

        // Past expiry the slot is free again
        let r = repo
            .insert_reservation(&reservation("alice", &b, 1300), Timestamp::from_seconds(700))
            .await
            .unwrap();
        assert_eq!(r.address, b);
        assert_eq!(repo.reservation_count(), 1);
    }

    #[tokio::test]
    async fn test_own_reservation_refreshes() {
        let repo = InMemoryRepository::new();
        let a = addr(1);
        repo.insert_reservation(&reservation("alice", &a, 600), Timestamp::from_seconds(0))
            .await
            .unwrap();
        repo.insert_reservation(&reservation("alice", &a, 900), Timestamp::from_seconds(300))
            .await
            .unwrap();
        let stored = repo
            .find_reservation(&NormalizedNickname::from_stored("alice".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.expires_at, Timestamp::from_seconds(900));
    }

    #[tokio::test]
    async fn test_claim_consumes_reservation_and_indexes_nickname() {
        let repo = InMemoryRepository::new();
        let a = addr(1);
        repo.insert_reservation(&reservation("alice", &a, 600), Timestamp::from_seconds(0))
            .await
            .unwrap();

        let profile = repo
            .commit_claim(&ClaimCommit {
                address: a.clone(),
                nickname: Nickname::from_stored("Alice".into()),
                now: Timestamp::from_seconds(10),
            })
            .await
            .unwrap();
        assert_eq!(profile.nickname_normalized.unwrap().as_str(), "alice");
        assert_eq!(repo.reservation_count(), 0);

        let by_nick = repo
            .find_profile_by_nickname(&NormalizedNickname::from_stored("alice".into()))
            .await
            .unwrap();
        assert_eq!(by_nick.unwrap().address, a);
    }

    #[tokio::test]
    async fn test_claim_unique_violation() {
        let repo = InMemoryRepository::new();
        let (a, b) = (addr(1), addr(2));
        let commit = |who: &Address| ClaimCommit {
            address: who.clone(),
            nickname: Nickname::from_stored("alice".into()),
            now: Timestamp::from_seconds(1),
        };
        repo.commit_claim(&commit(&a)).await.unwrap();

        let err = repo.commit_claim(&commit(&b)).await.unwrap_err();
        assert!(matches!(
            err,
            VillaError::UniqueViolation {
                constraint: UniqueConstraint::ProfileNickname,
                ..
            }
        ));

        let err = repo.commit_claim(&commit(&a)).await.unwrap_err();
        assert!(matches!(
            err,
            VillaError::UniqueViolation {
                constraint: UniqueConstraint::ProfileAddress,
                ..
            }
        ));

        // A claimed nickname cannot be reserved either
        let err = repo
            .insert_reservation(&reservation("alice", &b, 600), Timestamp::from_seconds(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VillaError::UniqueViolation {
                constraint: UniqueConstraint::ProfileNickname,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_nickname_change_is_conditional() {
        let repo = InMemoryRepository::new();
        let a = addr(1);
        repo.commit_claim(&ClaimCommit {
            address: a.clone(),
            nickname: Nickname::from_stored("alice".into()),
            now: Timestamp::from_seconds(1),
        })
        .await
        .unwrap();

        let change = NicknameChangeCommit {
            address: a.clone(),
            nickname: Nickname::from_stored("alicia".into()),
            expected_change_count: 0,
            now: Timestamp::from_seconds(2),
        };
        let updated = repo.commit_nickname_change(&change).await.unwrap().unwrap();
        assert_eq!(updated.nickname_change_count, 1);
        assert_eq!(updated.last_nickname_change_at, Some(Timestamp::from_seconds(2)));

        // Stale expectation loses
        assert!(repo.commit_nickname_change(&change).await.unwrap().is_none());

        // Old nickname released
        assert!(repo
            .find_profile_by_nickname(&NormalizedNickname::from_stored("alice".into()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_commits_respect_foreign_live_reservation() {
        let repo = InMemoryRepository::new();
        let (a, b) = (addr(1), addr(2));
        repo.commit_claim(&ClaimCommit {
            address: a.clone(),
            nickname: Nickname::from_stored("alice".into()),
            now: Timestamp::from_seconds(1),
        })
        .await
        .unwrap();
        repo.insert_reservation(&reservation("xavier", &b, 600), Timestamp::from_seconds(2))
            .await
            .unwrap();

        let change = NicknameChangeCommit {
            address: a.clone(),
            nickname: Nickname::from_stored("Xavier".into()),
            expected_change_count: 0,
            now: Timestamp::from_seconds(3),
        };
        let err = repo.commit_nickname_change(&change).await.unwrap_err();
        assert!(matches!(
            err,
            VillaError::UniqueViolation {
                constraint: UniqueConstraint::ReservationNickname,
                ..
            }
        ));
        let unchanged = repo.find_profile(&a).await.unwrap().unwrap();
        assert_eq!(unchanged.nickname_change_count, 0);
        assert_eq!(unchanged.nickname.unwrap().as_str(), "alice");

        let err = repo
            .commit_claim(&ClaimCommit {
                address: addr(3),
                nickname: Nickname::from_stored("xavier".into()),
                now: Timestamp::from_seconds(3),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VillaError::UniqueViolation { .. }));

        // Once the reservation lapses the change goes through
        let later = NicknameChangeCommit {
            now: Timestamp::from_seconds(600),
            ..change
        };
        assert!(repo.commit_nickname_change(&later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_avatar_creates_profile() {
        let repo = InMemoryRepository::new();
        let a = addr(3);
        let avatar = Avatar::Generated {
            style: "adventurer".into(),
            selection: "other".into(),
            variant: 2,
        };
        let p = repo
            .upsert_avatar(&a, &avatar, Timestamp::from_seconds(9))
            .await
            .unwrap();
        assert!(p.nickname.is_none());
        assert_eq!(p.avatar, Some(avatar));
        assert_eq!(repo.profile_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let repo = InMemoryRepository::new();
        repo.insert_reservation(&reservation("one", &addr(1), 100), Timestamp::from_seconds(0))
            .await
            .unwrap();
        repo.insert_reservation(&reservation("two", &addr(2), 900), Timestamp::from_seconds(0))
            .await
            .unwrap();
        let removed = repo
            .delete_expired_reservations(Timestamp::from_seconds(500))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.reservation_count(), 1);
    }

    #[tokio::test]
    async fn test_apps() {
        let repo = InMemoryRepository::new();
        let app = DeveloperApp {
            app_id: "app_1".into(),
            api_key_hash: "h1".into(),
            owner_address: addr(1),
            allowed_origins: vec!["https://a.com".into()],
            rate_limit: 100,
            created_at: Timestamp::from_seconds(1),
            updated_at: Timestamp::from_seconds(1),
        };
        repo.insert_app(&app).await.unwrap();
        assert!(repo.insert_app(&app).await.is_err());

        assert!(repo.is_origin_registered("https://a.com").await.unwrap());
        assert!(!repo.is_origin_registered("https://b.com").await.unwrap());

        let updated = repo
            .update_app_origins("app_1", &["https://b.com".into()], Timestamp::from_seconds(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.allowed_origins, vec!["https://b.com".to_string()]);
        assert!(repo.is_origin_registered("https://b.com").await.unwrap());
        assert!(repo
            .update_app_origins("app_missing", &[], Timestamp::from_seconds(2))
            .await
            .unwrap()
            .is_none());

        assert_eq!(repo.list_apps_by_owner(&addr(1)).await.unwrap().len(), 1);
        assert!(repo.list_apps_by_owner(&addr(2)).await.unwrap().is_empty());
    }
}
