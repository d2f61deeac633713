use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub const API_KEY_PREFIX: &str = "vk_live_";
pub const APP_ID_PREFIX: &str = "app_";
const API_KEY_BYTES: usize = 32;
const APP_ID_BYTES: usize = 16;
const MASK_PREFIX_LEN: usize = 12;
const MASK_SUFFIX_LEN: usize = 4;
const MASKED_INVALID: &str = "***";

/// A freshly generated API key. Zeroized on drop; `Debug` and `Display` mask it.
#[derive(Clone)]
pub struct ApiKey(Zeroizing<String>);

impl ApiKey {
    /// The full secret. Only for handing back to the developer once.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn masked(&self) -> String {
        mask_api_key(&self.0)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.masked())
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(&*bytes)
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub fn generate_api_key() -> ApiKey {
    ApiKey(Zeroizing::new(format!(
        "{}{}",
        API_KEY_PREFIX,
        random_hex(API_KEY_BYTES)
    )))
}

pub fn generate_app_id() -> String {
    format!("{}{}", APP_ID_PREFIX, random_hex(APP_ID_BYTES))
}

/// `vk_live_` followed by exactly 64 lowercase hex characters.
pub fn is_valid_api_key(key: &str) -> bool {
    key.strip_prefix(API_KEY_PREFIX)
        .is_some_and(|rest| is_lower_hex(rest, API_KEY_BYTES * 2))
}

/// `app_` followed by exactly 32 lowercase hex characters.
pub fn is_valid_app_id(id: &str) -> bool {
    id.strip_prefix(APP_ID_PREFIX)
        .is_some_and(|rest| is_lower_hex(rest, APP_ID_BYTES * 2))
}

/// First 12 and last 4 characters of a well-formed key; `***` for anything
/// else so malformed input is never partially echoed.
pub fn mask_api_key(key: &str) -> String {
    if !is_valid_api_key(key) {
        return MASKED_INVALID.to_string();
    }
    format!(
        "{}...{}",
        &key[..MASK_PREFIX_LEN],
        &key[key.len() - MASK_SUFFIX_LEN..]
    )
}

/// Hex SHA-256 of the key; the only form that is persisted.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Constant-time comparison of a presented key against a stored hash.
pub fn api_key_matches(key: &str, stored_hash: &str) -> bool {
    let presented = hash_api_key(key);
    presented.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}
