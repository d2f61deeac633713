use std::sync::Arc;
use villa_core::{
    Address, Avatar, ClaimCommit, Nickname, NicknameChangeCommit, NicknameReservation,
    NicknameRules, NormalizedNickname, Profile, ProfileRepository, Timestamp, UniqueConstraint,
    VillaError,
};

use crate::error::{ClaimError, ClaimResult};
use crate::policy::{NicknameEligibility, NicknamePolicy};
use crate::verifier::{OwnershipVerifier, ProofScope};

pub const DEFAULT_RESERVATION_TTL_SECONDS: u64 = 600;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub rules: NicknameRules,
    pub policy: NicknamePolicy,
    pub reservation_ttl_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rules: NicknameRules::default(),
            policy: NicknamePolicy::default(),
            reservation_ttl_seconds: DEFAULT_RESERVATION_TTL_SECONDS,
        }
    }
}

/// Whoever currently blocks a normalized nickname.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Holder {
    Profile,
    Reservation(Address),
}

/// Nickname reservation, claim, and change workflow.
///
/// Every read-then-write here has a race window; the repository's unique
/// constraints close it and their violations come back as `NicknameTaken`.
pub struct NicknameRegistry {
    repo: Arc<dyn ProfileRepository>,
    verifier: Arc<dyn OwnershipVerifier>,
    config: RegistryConfig,
}

impl NicknameRegistry {
    pub fn new(
        repo: Arc<dyn ProfileRepository>,
        verifier: Arc<dyn OwnershipVerifier>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            repo,
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn parse_nickname(&self, raw: &str) -> ClaimResult<Nickname> {
        Ok(Nickname::parse(raw, &self.config.rules)?)
    }

    async fn holder(
        &self,
        key: &NormalizedNickname,
        now: Timestamp,
    ) -> ClaimResult<Option<Holder>> {
        if self.repo.find_profile_by_nickname(key).await?.is_some() {
            return Ok(Some(Holder::Profile));
        }
        Ok(self
            .repo
            .find_reservation(key)
            .await?
            .filter(|r| r.is_live(now))
            .map(|r| Holder::Reservation(r.address)))
    }

    /// The reservation race-guard shared by claim and change: `key` must be
    /// unowned and held by a live reservation of `address`.
    async fn require_own_reservation(
        &self,
        key: &NormalizedNickname,
        address: &Address,
        now: Timestamp,
    ) -> ClaimResult<()> {
        if self.repo.find_profile_by_nickname(key).await?.is_some() {
            return Err(ClaimError::NicknameTaken { nickname: key.clone() });
        }
        match self.repo.find_reservation(key).await? {
            Some(r) if r.is_live(now) && &r.address == address => Ok(()),
            Some(r) if r.is_live(now) => Err(ClaimError::NicknameTaken { nickname: key.clone() }),
            _ => Err(ClaimError::ReservationRequired { nickname: key.clone() }),
        }
    }

    async fn verify_proof(
        &self,
        address: &Address,
        scope: ProofScope,
        proof: &str,
    ) -> ClaimResult<()> {
        if let Err(e) = self.verifier.verify(address, &scope, proof).await {
            tracing::warn!(address = %address, scope = %scope, error = %e, "ownership proof not accepted");
            return Err(e);
        }
        Ok(())
    }

    /// False if a profile owns the nickname (case-insensitively) or a live
    /// reservation holds it.
    pub async fn check_available(&self, raw: &str, now: Timestamp) -> ClaimResult<bool> {
        let key = self.parse_nickname(raw)?.normalized();
        Ok(self.holder(&key, now).await?.is_none())
    }

    /// Hold `raw` for `address` until `now + reservation_ttl_seconds`.
    ///
    /// Re-reserving one's own live reservation extends it.
    pub async fn reserve(
        &self,
        raw: &str,
        address: &Address,
        now: Timestamp,
    ) -> ClaimResult<NicknameReservation> {
        let key = self.parse_nickname(raw)?.normalized();

        match self.holder(&key, now).await? {
            Some(Holder::Reservation(ref owner)) if owner == address => {}
            Some(_) => {
                tracing::debug!(nickname = %key, address = %address, "reservation refused, nickname held");
                return Err(ClaimError::NicknameTaken { nickname: key });
            }
            None => {}
        }

        let reservation = NicknameReservation {
            nickname_normalized: key.clone(),
            address: address.clone(),
            expires_at: now.plus_seconds(self.config.reservation_ttl_seconds),
            created_at: now,
        };
        let stored = self
            .repo
            .insert_reservation(&reservation, now)
            .await
            .map_err(|e| translate_unique(e, &key, address))?;

        tracing::info!(
            nickname = %key,
            address = %address,
            expires_at = %stored.expires_at,
            "nickname reserved"
        );
        Ok(stored)
    }

    /// Drop `address`'s reservation on `raw`. Returns false if it held none.
    pub async fn release(&self, raw: &str, address: &Address) -> ClaimResult<bool> {
        let key = self.parse_nickname(raw)?.normalized();
        let removed = self.repo.delete_reservation(&key, address).await?;
        if removed {
            tracing::info!(nickname = %key, address = %address, "reservation released");
        }
        Ok(removed)
    }

    /// Bind `raw` to `address`.
    ///
    /// Requires a live reservation held by `address` and a valid ownership
    /// proof. The reservation is consumed in the same commit as the profile
    /// write.
    pub async fn claim(
        &self,
        raw: &str,
        address: &Address,
        proof: &str,
        now: Timestamp,
    ) -> ClaimResult<Profile> {
        let nickname = self.parse_nickname(raw)?;
        let key = nickname.normalized();

        if let Some(existing) = self.repo.find_profile(address).await? {
            if existing.nickname.is_some() {
                return Err(ClaimError::AlreadyClaimed(address.clone()));
            }
        }

        self.require_own_reservation(&key, address, now).await?;
        self.verify_proof(address, ProofScope::Claim(key.clone()), proof)
            .await?;

        let profile = self
            .repo
            .commit_claim(&ClaimCommit {
                address: address.clone(),
                nickname,
                now,
            })
            .await
            .map_err(|e| translate_unique(e, &key, address))?;

        tracing::info!(nickname = %key, address = %address, "nickname claimed");
        Ok(profile)
    }

    /// Replace the nickname of an already claimed profile, subject to policy.
    ///
    /// `proof` must authorize `NicknameChange` to the new nickname. A new
    /// nickname goes through the same reservation guard as a claim; a
    /// case-only change keeps the key this address already owns.
    pub async fn change_nickname(
        &self,
        address: &Address,
        raw: &str,
        proof: &str,
        now: Timestamp,
    ) -> ClaimResult<Profile> {
        let nickname = self.parse_nickname(raw)?;
        let key = nickname.normalized();
        self.verify_proof(address, ProofScope::NicknameChange(key.clone()), proof)
            .await?;

        let profile = self
            .repo
            .find_profile(address)
            .await?
            .ok_or_else(|| ClaimError::ProfileNotFound(address.clone()))?;
        let current = profile
            .nickname
            .clone()
            .ok_or_else(|| ClaimError::NotClaimed(address.clone()))?;
        if current.as_str() == nickname.as_str() {
            return Err(ClaimError::Unchanged);
        }

        let eligibility = self.config.policy.can_change(&profile, now);
        if !eligibility.can_change_nickname {
            return Err(ClaimError::PolicyDenied(eligibility));
        }

        if key != current.normalized() {
            self.require_own_reservation(&key, address, now).await?;
        }

        let commit = NicknameChangeCommit {
            address: address.clone(),
            nickname,
            expected_change_count: profile.nickname_change_count,
            now,
        };
        match self
            .repo
            .commit_nickname_change(&commit)
            .await
            .map_err(|e| translate_unique(e, &key, address))?
        {
            Some(updated) => {
                tracing::info!(
                    address = %address,
                    from = %current,
                    to = %key,
                    change_count = updated.nickname_change_count,
                    "nickname changed"
                );
                Ok(updated)
            }
            None => {
                tracing::warn!(address = %address, "nickname changed concurrently, re-evaluating policy");
                let fresh = self.eligibility(address, now).await?;
                if fresh.can_change_nickname {
                    Err(ClaimError::ConcurrentChange)
                } else {
                    Err(ClaimError::PolicyDenied(fresh))
                }
            }
        }
    }

    pub async fn eligibility(
        &self,
        address: &Address,
        now: Timestamp,
    ) -> ClaimResult<NicknameEligibility> {
        let profile = self
            .repo
            .find_profile(address)
            .await?
            .ok_or_else(|| ClaimError::ProfileNotFound(address.clone()))?;
        Ok(self.config.policy.can_change(&profile, now))
    }

    pub async fn profile(&self, address: &Address) -> ClaimResult<Option<Profile>> {
        Ok(self.repo.find_profile(address).await?)
    }

    /// Set the avatar, creating a nickname-less profile if needed. `proof`
    /// must authorize the `Avatar` scope for `address`.
    pub async fn set_avatar(
        &self,
        address: &Address,
        avatar: &Avatar,
        proof: &str,
        now: Timestamp,
    ) -> ClaimResult<Profile> {
        avatar.validate()?;
        self.verify_proof(address, ProofScope::Avatar, proof).await?;
        let profile = self.repo.upsert_avatar(address, avatar, now).await?;
        tracing::info!(address = %address, "avatar updated");
        Ok(profile)
    }

    /// Delete expired reservations. Liveness is always checked on read, so
    /// this is cleanup only.
    pub async fn sweep_expired_reservations(&self, now: Timestamp) -> ClaimResult<u64> {
        let removed = self.repo.delete_expired_reservations(now).await?;
        if removed > 0 {
            tracing::debug!(removed, "expired reservations swept");
        }
        Ok(removed)
    }

    pub async fn health_check(&self) -> ClaimResult<()> {
        Ok(self.repo.health_check().await?)
    }
}

fn translate_unique(e: VillaError, nickname: &NormalizedNickname, address: &Address) -> ClaimError {
    match e {
        VillaError::UniqueViolation {
            constraint: UniqueConstraint::ProfileNickname | UniqueConstraint::ReservationNickname,
            ..
        } => {
            tracing::info!(nickname = %nickname, address = %address, "nickname lost at commit");
            ClaimError::NicknameTaken {
                nickname: nickname.clone(),
            }
        }
        VillaError::UniqueViolation {
            constraint: UniqueConstraint::ProfileAddress,
            ..
        } => ClaimError::AlreadyClaimed(address.clone()),
        VillaError::NotFound(_) => ClaimError::ProfileNotFound(address.clone()),
        other => other.into(),
    }
}
