use thiserror::Error;
use villa_core::{Address, NormalizedNickname, VillaError};

use crate::policy::NicknameEligibility;

/// Outcome of a rejected reservation, claim, or change.
///
/// Everything except `Storage` and `Verifier` is an expected, user-facing
/// result. `NicknameTaken` always names the normalized nickname that collided.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("nickname '{nickname}' is already taken")]
    NicknameTaken { nickname: NormalizedNickname },

    #[error("no live reservation for '{nickname}' held by this address")]
    ReservationRequired { nickname: NormalizedNickname },

    #[error("address {0} has already claimed a nickname")]
    AlreadyClaimed(Address),

    #[error("address {0} has not claimed a nickname yet")]
    NotClaimed(Address),

    #[error("no profile for address {0}")]
    ProfileNotFound(Address),

    #[error("new nickname is identical to the current one")]
    Unchanged,

    #[error("nickname change denied: {}", .0.reason.as_deref().unwrap_or("policy"))]
    PolicyDenied(NicknameEligibility),

    #[error("nickname was changed concurrently; retry")]
    ConcurrentChange,

    #[error("ownership proof rejected")]
    ProofRejected,

    #[error("ownership verifier unavailable: {0}")]
    Verifier(String),

    #[error(transparent)]
    Storage(VillaError),
}

impl ClaimError {
    /// True for outcomes a caller should show to the user rather than treat
    /// as a failure of the service.
    pub fn is_expected(&self) -> bool {
        !matches!(self, ClaimError::Storage(_) | ClaimError::Verifier(_))
    }
}

impl From<VillaError> for ClaimError {
    fn from(e: VillaError) -> Self {
        match e {
            VillaError::Validation(msg) => ClaimError::Invalid(msg),
            other => ClaimError::Storage(other),
        }
    }
}

pub type ClaimResult<T> = Result<T, ClaimError>;
