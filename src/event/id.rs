//! Identifiers embedded in event filenames.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Number of digits in an item id.
pub const ITEM_ID_LEN: usize = 8;

/// Number of hex characters kept from an actor's BLAKE3 digest.
pub const ACTOR_HASH_LEN: usize = 8;

const ITEM_ID_MIN: u128 = 10_000_000;
const ITEM_ID_SPAN: u128 = 90_000_000;

/// An 8-digit numeric item identifier that never starts with `0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Parse and validate an item id.
    pub fn parse(raw: &str) -> Result<Self> {
        if Self::is_valid(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::InvalidArgument(format!(
                "invalid item id '{raw}' (expected {ITEM_ID_LEN} digits, not starting with 0)"
            )))
        }
    }

    pub fn is_valid(raw: &str) -> bool {
        raw.len() == ITEM_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_digit())
            && !raw.starts_with('0')
    }

    /// Draw a random candidate id from the random section of a fresh ULID.
    ///
    /// Candidates are not checked for uniqueness; callers retry until the
    /// creation file can be written exclusively.
    pub fn random() -> Self {
        Self::from_random_bits(Ulid::new().random())
    }

    fn from_random_bits(bits: u128) -> Self {
        Self(format!("{}", ITEM_ID_MIN + bits % ITEM_ID_SPAN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s.trim())
    }
}

impl TryFrom<String> for ItemId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ItemId> for String {
    fn from(value: ItemId) -> Self {
        value.0
    }
}

/// Short stable hash of an actor name, used where a filename needs to name an actor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorHash(String);

impl ActorHash {
    pub fn of(actor: &str) -> Self {
        let digest = blake3::hash(actor.trim().as_bytes());
        let hex = digest.to_hex();
        Self(hex.as_str()[..ACTOR_HASH_LEN].to_string())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == ACTOR_HASH_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_rejects_leading_zero_and_wrong_length() {
        assert!(ItemId::parse("12345678").is_ok());
        assert!(ItemId::parse("02345678").is_err());
        assert!(ItemId::parse("1234567").is_err());
        assert!(ItemId::parse("123456789").is_err());
        assert!(ItemId::parse("1234567a").is_err());
    }

    #[test]
    fn random_ids_are_always_valid() {
        for bits in [0u128, 1, 89_999_999, 90_000_000, u128::MAX] {
            let id = ItemId::from_random_bits(bits);
            assert!(ItemId::is_valid(id.as_str()), "{id}");
        }
        for _ in 0..100 {
            assert!(ItemId::is_valid(ItemId::random().as_str()));
        }
    }

    #[test]
    fn actor_hash_is_stable_hex() {
        let a = ActorHash::of("alice");
        assert_eq!(a, ActorHash::of(" alice "));
        assert_ne!(a, ActorHash::of("bob"));
        assert!(ActorHash::parse(a.as_str()).is_some());
        assert!(ActorHash::parse("XYZ12345").is_none());
    }
}
