use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{VillaError, VillaResult};

// ---------------------------------------------------------------------------
// Timestamp: canonical time representation (seconds + nanoseconds)
// ---------------------------------------------------------------------------

/// Serialized as an RFC 3339 string in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub seconds_since_epoch: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        chrono::Utc::now().into()
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds_since_epoch: seconds,
            nanoseconds: 0,
        }
    }

    pub fn plus_seconds(&self, seconds: u64) -> Self {
        Self {
            seconds_since_epoch: self.seconds_since_epoch.saturating_add(seconds),
            nanoseconds: self.nanoseconds,
        }
    }

    /// Whole seconds elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn seconds_since(&self, earlier: &Timestamp) -> u64 {
        self.seconds_since_epoch
            .saturating_sub(earlier.seconds_since_epoch)
    }

    pub fn to_datetime(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(self.seconds_since_epoch as i64, self.nanoseconds)
            .unwrap_or_default()
    }

    pub fn to_rfc3339(&self) -> String {
        self.to_datetime()
            .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
    }

    pub fn parse_rfc3339(raw: &str) -> VillaResult<Self> {
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&chrono::Utc).into())
            .map_err(|e| VillaError::Validation(format!("invalid timestamp '{}': {}", raw, e)))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse_rfc3339(&raw).map_err(serde::de::Error::custom)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Timestamp {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            seconds_since_epoch: dt.timestamp().max(0) as u64,
            nanoseconds: dt.timestamp_subsec_nanos(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Address: lowercase 0x-prefixed 20-byte account identifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and lowercase-normalize a chain account address.
    pub fn parse(raw: &str) -> VillaResult<Self> {
        let trimmed = raw.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| VillaError::Validation("address must start with 0x".into()))?;
        if hex_part.len() != 40 {
            return Err(VillaError::Validation(format!(
                "address must have 40 hex characters, got {}",
                hex_part.len()
            )));
        }
        if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(VillaError::Validation(
                "address contains non-hex characters".into(),
            ));
        }
        Ok(Self(format!("0x{}", hex_part.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = VillaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Nickname: display handle plus its case-folded uniqueness key
// ---------------------------------------------------------------------------

/// Format rules applied before a nickname may be reserved or claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicknameRules {
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for NicknameRules {
    fn default() -> Self {
        Self {
            min_length: 3,
            max_length: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nickname(String);

impl Nickname {
    /// Validate a user-supplied nickname. Surrounding whitespace is trimmed;
    /// the display casing is preserved.
    pub fn parse(raw: &str, rules: &NicknameRules) -> VillaResult<Self> {
        let trimmed = raw.trim();
        let len = trimmed.chars().count();
        if len < rules.min_length {
            return Err(VillaError::Validation(format!(
                "nickname must be at least {} characters",
                rules.min_length
            )));
        }
        if len > rules.max_length {
            return Err(VillaError::Validation(format!(
                "nickname must be at most {} characters",
                rules.max_length
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(VillaError::Validation(
                "nickname may only contain letters, digits, and underscores".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Rehydrate a nickname that was validated before it was written.
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn normalized(&self) -> NormalizedNickname {
        NormalizedNickname(self.0.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercased nickname; the actual uniqueness key for profiles and reservations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedNickname(String);

impl NormalizedNickname {
    pub fn from_stored(value: String) -> Self {
        Self(value.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedNickname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Avatar: deterministic generation parameters or a custom image
// ---------------------------------------------------------------------------

/// Stored `avatar_style` value marking a custom (uploaded) avatar.
pub const CUSTOM_AVATAR_STYLE: &str = "custom";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Avatar {
    /// Rendered on demand from `(address, selection, variant)`.
    Generated {
        style: String,
        #[serde(alias = "seed")]
        selection: String,
        #[serde(alias = "gender", deserialize_with = "deserialize_avatar_variant")]
        variant: u32,
    },
    Custom { url: String },
}

/// Legacy `gender` labels, in variant order.
pub const LEGACY_GENDER_LABELS: [&str; 3] = ["male", "female", "other"];

#[derive(Deserialize)]
#[serde(untagged)]
enum VariantRepr {
    Number(u32),
    Text(String),
}

/// Accepts the numeric `variant`, a numeric string, or a legacy `gender`
/// label from [`LEGACY_GENDER_LABELS`].
pub fn deserialize_avatar_variant<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<u32, D::Error> {
    match VariantRepr::deserialize(deserializer)? {
        VariantRepr::Number(n) => Ok(n),
        VariantRepr::Text(text) => parse_avatar_variant(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("unrecognized avatar variant '{}'", text))
        }),
    }
}

fn parse_avatar_variant(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Ok(n) = text.parse::<u32>() {
        return Some(n);
    }
    LEGACY_GENDER_LABELS
        .iter()
        .position(|label| label.eq_ignore_ascii_case(text))
        .map(|i| i as u32)
}

impl Avatar {
    pub fn validate(&self) -> VillaResult<()> {
        match self {
            Avatar::Generated {
                style, selection, ..
            } => {
                if style.is_empty() || style == CUSTOM_AVATAR_STYLE {
                    return Err(VillaError::Validation(format!(
                        "invalid avatar style '{}'",
                        style
                    )));
                }
                if selection.is_empty() || selection.len() > 64 {
                    return Err(VillaError::Validation(
                        "avatar selection must be 1-64 characters".into(),
                    ));
                }
                Ok(())
            }
            Avatar::Custom { url } => {
                if !url.starts_with("https://") || url.len() > 2048 {
                    return Err(VillaError::Validation(
                        "custom avatar must be an https URL of at most 2048 characters".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Flatten into the `(avatar_style, avatar_selection, avatar_variant)` columns.
    pub fn to_columns(&self) -> (String, String, i32) {
        match self {
            Avatar::Generated {
                style,
                selection,
                variant,
            } => (
                style.clone(),
                selection.clone(),
                i32::try_from(*variant).unwrap_or(i32::MAX),
            ),
            Avatar::Custom { url } => (CUSTOM_AVATAR_STYLE.to_string(), url.clone(), 0),
        }
    }

    pub fn from_columns(style: String, selection: String, variant: i32) -> Self {
        if style == CUSTOM_AVATAR_STYLE {
            Avatar::Custom { url: selection }
        } else {
            Avatar::Generated {
                style,
                selection,
                variant: variant.max(0) as u32,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Profile / NicknameReservation / DeveloperApp: persisted records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub address: Address,
    pub nickname: Option<Nickname>,
    pub nickname_normalized: Option<NormalizedNickname>,
    pub avatar: Option<Avatar>,
    pub nickname_change_count: u32,
    pub last_nickname_change_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Profile {
    /// A profile row with no nickname yet.
    pub fn empty(address: Address, now: Timestamp) -> Self {
        Self {
            address,
            nickname: None,
            nickname_normalized: None,
            avatar: None,
            nickname_change_count: 0,
            last_nickname_change_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicknameReservation {
    pub nickname_normalized: NormalizedNickname,
    pub address: Address,
    pub expires_at: Timestamp,
    pub created_at: Timestamp,
}

impl NicknameReservation {
    /// A reservation past `expires_at` is treated as absent.
    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperApp {
    pub app_id: String,
    /// SHA-256 of the API key, hex-encoded. The key itself is never stored.
    #[serde(skip_serializing, default)]
    pub api_key_hash: String,
    pub owner_address: Address,
    pub allowed_origins: Vec<String>,
    pub rate_limit: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "0xAbCdEf0123456789abcdef0123456789ABCDEF01";

    #[test]
    fn test_address_lowercased() {
        let a = Address::parse(ADDR).unwrap();
        assert_eq!(a.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn test_address_rejects_malformed() {
        assert!(Address::parse("abcdef0123456789abcdef0123456789abcdef01").is_err());
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xzzcdef0123456789abcdef0123456789abcdef01").is_err());
    }

    #[test]
    fn test_address_serde_validates() {
        let ok: Address = serde_json::from_str(&format!("\"{}\"", ADDR)).unwrap();
        assert!(ok.as_str().starts_with("0xabcdef"));
        assert!(serde_json::from_str::<Address>("\"0x12\"").is_err());
    }

    #[test]
    fn test_nickname_normalization_preserves_display() {
        let rules = NicknameRules::default();
        let nick = Nickname::parse("  Alice_01 ", &rules).unwrap();
        assert_eq!(nick.as_str(), "Alice_01");
        assert_eq!(nick.normalized().as_str(), "alice_01");
    }

    #[test]
    fn test_nickname_length_and_charset() {
        let rules = NicknameRules::default();
        assert!(Nickname::parse("ab", &rules).is_err());
        assert!(Nickname::parse(&"a".repeat(31), &rules).is_err());
        assert!(Nickname::parse("bad name", &rules).is_err());
        assert!(Nickname::parse("émile", &rules).is_err());
        assert!(Nickname::parse("abc", &rules).is_ok());
    }

    #[test]
    fn test_reservation_liveness() {
        let r = NicknameReservation {
            nickname_normalized: NormalizedNickname::from_stored("alice".into()),
            address: Address::parse(ADDR).unwrap(),
            expires_at: Timestamp::from_seconds(1_000),
            created_at: Timestamp::from_seconds(400),
        };
        assert!(r.is_live(Timestamp::from_seconds(999)));
        assert!(!r.is_live(Timestamp::from_seconds(1_000)));
    }

    #[test]
    fn test_avatar_columns_roundtrip() {
        let generated = Avatar::Generated {
            style: "adventurer".into(),
            selection: "female".into(),
            variant: 3,
        };
        let (s, sel, v) = generated.to_columns();
        assert_eq!(Avatar::from_columns(s, sel, v), generated);

        let custom = Avatar::Custom {
            url: "https://cdn.example.com/a.png".into(),
        };
        let (s, sel, v) = custom.to_columns();
        assert_eq!(s, CUSTOM_AVATAR_STYLE);
        assert_eq!(Avatar::from_columns(s, sel, v), custom);
    }

    #[test]
    fn test_avatar_accepts_legacy_field_names() {
        let json = r#"{"type":"generated","style":"avataaars","seed":"male","gender":1}"#;
        let avatar: Avatar = serde_json::from_str(json).unwrap();
        assert_eq!(
            avatar,
            Avatar::Generated {
                style: "avataaars".into(),
                selection: "male".into(),
                variant: 1
            }
        );
    }

    #[test]
    fn test_avatar_accepts_legacy_string_gender() {
        let json = r#"{"type":"generated","style":"avataaars","seed":"alice","gender":"female"}"#;
        let avatar: Avatar = serde_json::from_str(json).unwrap();
        assert_eq!(
            avatar,
            Avatar::Generated {
                style: "avataaars".into(),
                selection: "alice".into(),
                variant: 1
            }
        );

        let numeric: Avatar =
            serde_json::from_str(r#"{"type":"generated","style":"bottts","seed":"x","gender":"2"}"#)
                .unwrap();
        assert!(matches!(numeric, Avatar::Generated { variant: 2, .. }));

        assert!(serde_json::from_str::<Avatar>(
            r#"{"type":"generated","style":"bottts","seed":"x","gender":"robot"}"#
        )
        .is_err());
    }

    #[test]
    fn test_avatar_validation() {
        assert!(Avatar::Custom {
            url: "http://insecure.example.com/a.png".into()
        }
        .validate()
        .is_err());
        assert!(Avatar::Generated {
            style: CUSTOM_AVATAR_STYLE.into(),
            selection: "x".into(),
            variant: 0
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_timestamp_serializes_as_rfc3339() {
        let t = Timestamp::from_seconds(1_700_000_000);
        let json = serde_json::to_value(t).unwrap();
        assert_eq!(json, serde_json::json!("2023-11-14T22:13:20Z"));
        let back: Timestamp = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);

        let offset: Timestamp = serde_json::from_str("\"2023-11-14T23:13:20+01:00\"").unwrap();
        assert_eq!(offset, t);
        assert!(serde_json::from_str::<Timestamp>("\"yesterday\"").is_err());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_seconds(100);
        assert_eq!(t.plus_seconds(50).seconds_since_epoch, 150);
        assert_eq!(t.plus_seconds(50).seconds_since(&t), 50);
        assert_eq!(t.seconds_since(&t.plus_seconds(50)), 0);
    }

    #[test]
    fn test_developer_app_never_serializes_key_hash() {
        let app = DeveloperApp {
            app_id: "app_0".into(),
            api_key_hash: "deadbeef".into(),
            owner_address: Address::parse(ADDR).unwrap(),
            allowed_origins: vec!["https://a.com".into()],
            rate_limit: 100,
            created_at: Timestamp::from_seconds(1),
            updated_at: Timestamp::from_seconds(1),
        };
        let json = serde_json::to_string(&app).unwrap();
        assert!(!json.contains("deadbeef"));
        assert!(json.contains("allowedOrigins"));
    }
}
