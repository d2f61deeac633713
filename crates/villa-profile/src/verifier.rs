use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use villa_core::{Address, NormalizedNickname};
use zeroize::Zeroizing;

use crate::error::{ClaimError, ClaimResult};

type HmacSha256 = Hmac<Sha256>;

/// What an ownership proof authorizes. Each scope signs a different message,
/// so a token minted for one action cannot be replayed for another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofScope {
    /// First binding of a nickname to the address.
    Claim(NormalizedNickname),
    /// Replacing the address's nickname with this one.
    NicknameChange(NormalizedNickname),
    /// Any avatar update for the address.
    Avatar,
}

impl ProofScope {
    pub fn action(&self) -> &'static str {
        match self {
            ProofScope::Claim(_) => "claim",
            ProofScope::NicknameChange(_) => "change",
            ProofScope::Avatar => "avatar",
        }
    }

    pub fn nickname(&self) -> Option<&NormalizedNickname> {
        match self {
            ProofScope::Claim(n) | ProofScope::NicknameChange(n) => Some(n),
            ProofScope::Avatar => None,
        }
    }
}

impl fmt::Display for ProofScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nickname() {
            Some(n) => write!(f, "{}:{}", self.action(), n),
            None => f.write_str(self.action()),
        }
    }
}

/// Checks that the caller controls `address` before the profile is changed.
///
/// Returns `ProofRejected` for a bad proof and `Verifier` when the check
/// itself could not run.
#[async_trait]
pub trait OwnershipVerifier: Send + Sync {
    async fn verify(&self, address: &Address, scope: &ProofScope, proof: &str) -> ClaimResult<()>;
}

/// Verifies tokens minted by the passkey gateway:
/// `hex(HMAC-SHA256(secret, "villa:" + action + ":" + address [+ ":" + nickname]))`
/// where `action` is `claim`, `change` or `avatar`.
pub struct GatewayProofVerifier {
    secret: Zeroizing<Vec<u8>>,
}

impl GatewayProofVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> ClaimResult<Self> {
        let secret = Zeroizing::new(secret.into());
        if secret.is_empty() {
            return Err(ClaimError::Verifier("gateway secret is empty".into()));
        }
        Ok(Self { secret })
    }

    /// Read the secret from the environment variable `var`.
    pub fn from_env(var: &str) -> ClaimResult<Self> {
        let value = std::env::var(var)
            .map_err(|_| ClaimError::Verifier(format!("environment variable {} is not set", var)))?;
        Self::new(value.into_bytes())
    }

    fn mac_for(&self, address: &Address, scope: &ProofScope) -> ClaimResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| ClaimError::Verifier("invalid gateway secret".into()))?;
        mac.update(b"villa:");
        mac.update(scope.action().as_bytes());
        mac.update(b":");
        mac.update(address.as_str().as_bytes());
        if let Some(nickname) = scope.nickname() {
            mac.update(b":");
            mac.update(nickname.as_str().as_bytes());
        }
        Ok(mac)
    }

    /// Mint a token. Used by the gateway side and by tests.
    pub fn sign(&self, address: &Address, scope: &ProofScope) -> ClaimResult<String> {
        let mac = self.mac_for(address, scope)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl OwnershipVerifier for GatewayProofVerifier {
    async fn verify(&self, address: &Address, scope: &ProofScope, proof: &str) -> ClaimResult<()> {
        let presented = hex::decode(proof.trim()).map_err(|_| ClaimError::ProofRejected)?;
        let mac = self.mac_for(address, scope)?;
        // Constant-time via the hmac crate
        mac.verify_slice(&presented)
            .map_err(|_| ClaimError::ProofRejected)
    }
}
