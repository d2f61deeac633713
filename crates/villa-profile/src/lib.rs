//! Villa nickname registry
//!
//! Reservation, claim, and change workflow over a `ProfileRepository`.
//! A nickname moves UNCLAIMED -> RESERVED -> CLAIMED; a reservation that
//! expires or is released falls back to UNCLAIMED.
//!
//! - Reservations are a fast path that reports "taken" before the ownership
//!   proof is verified. The storage unique index stays the authority.
//! - Claims, nickname changes and avatar updates each need an ownership
//!   proof scoped to that action (`ProofScope`).
//! - A change to a new nickname reserves it first, exactly like a claim.
//!   Changes are bounded by `NicknamePolicy` (change count + cooldown) and
//!   committed conditionally on the change count that was evaluated.
//! - Expected outcomes (taken, denied by policy, bad input) are `ClaimError`
//!   variants, never panics.

pub mod error;
pub mod policy;
pub mod registry;
pub mod verifier;

pub use error::{ClaimError, ClaimResult};
pub use policy::{NicknameEligibility, NicknamePolicy};
pub use registry::{NicknameRegistry, RegistryConfig};
pub use verifier::{GatewayProofVerifier, OwnershipVerifier, ProofScope};
