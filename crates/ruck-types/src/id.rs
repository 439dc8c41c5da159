use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::RuckError;

/// A 32-byte content address: SHA-256 of a blob's plaintext, or of the
/// canonical JSON body for trees, snapshots and indexes.
///
/// Serialized as lowercase hex in every JSON wire format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub [u8; 32]);

impl Id {
    /// Hash `data` with SHA-256.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Id(out)
    }

    /// Full lowercase hex form (64 characters), used as the storage name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form: the first 8 hex characters.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    /// First byte as a two-char hex string, used for data shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl FromStr for Id {
    type Err = RuckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|_| RuckError::InvalidFormat(format!("invalid hex ID '{s}'")))?;
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RuckError::InvalidFormat(format!("ID '{s}' is not 32 bytes")))?;
        Ok(Id(raw))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short())
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct IdVisitor;

impl Visitor<'_> for IdVisitor {
    type Value = Id;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 64-character lowercase hex string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Id, E> {
        v.parse().map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_known_vector() {
        // SHA-256("foo")
        let id = Id::hash(b"foo");
        assert_eq!(
            id.to_hex(),
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        );
    }

    #[test]
    fn short_is_first_eight_chars() {
        let id = Id::hash(b"foo");
        assert_eq!(id.short(), "2c26b46b");
        assert_eq!(format!("{id}"), "2c26b46b");
    }

    #[test]
    fn shard_prefix_is_first_byte() {
        let id = Id([0xAB; 32]);
        assert_eq!(id.shard_prefix(), "ab");
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::hash(b"roundtrip");
        let parsed: Id = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("zz".parse::<Id>().is_err());
        assert!("abcd".parse::<Id>().is_err());
    }

    #[test]
    fn json_is_hex_string() {
        let id = Id::hash(b"foo");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(
            json,
            "\"2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae\""
        );
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
