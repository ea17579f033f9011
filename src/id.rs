//! Object identifiers.
//!
//! # Contracts
//! - **Invariant**: persistent identifiers are stable across save/load and are
//!   the only kind ever written to storage.
//! - **Invariant**: ephemeral identifiers are unique for the lifetime of the
//!   process that allocated them and never leave it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Unique name of one logical object.
///
/// Ordering is total: every persistent id sorts before every ephemeral id,
/// then ids of the same kind compare by value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// Stable id stored on disk.
    Persistent(Uuid),
    /// Process-local id for objects not bound to any asset part.
    Ephemeral(u64),
}

/// The two identifier kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdKind {
    Persistent,
    Ephemeral,
}

impl ObjectId {
    /// Creates a persistent id from raw uuid bits.
    pub const fn from_u128(value: u128) -> Self {
        ObjectId::Persistent(Uuid::from_u128(value))
    }

    /// Derives the identifier of an externally imported object from its key.
    ///
    /// SHA-256 of the key truncated to 16 bytes, so re-importing the same key
    /// in a later session yields the same id.
    pub fn from_import_key(key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        ObjectId::Persistent(Uuid::from_bytes(bytes))
    }

    pub fn kind(&self) -> IdKind {
        match self {
            ObjectId::Persistent(_) => IdKind::Persistent,
            ObjectId::Ephemeral(_) => IdKind::Ephemeral,
        }
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        matches!(self, ObjectId::Persistent(_))
    }

    #[inline]
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ObjectId::Ephemeral(_))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Persistent(uuid) => write!(f, "{}", uuid.hyphenated()),
            ObjectId::Ephemeral(value) => write!(f, "~{value}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid object id '{0}'")]
pub struct IdParseError(pub String);

impl FromStr for ObjectId {
    type Err = IdParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if let Some(raw) = trimmed.strip_prefix('~') {
            return raw
                .parse::<u64>()
                .map(ObjectId::Ephemeral)
                .map_err(|_| IdParseError(input.to_string()));
        }
        Uuid::parse_str(trimmed)
            .map(ObjectId::Persistent)
            .map_err(|_| IdParseError(input.to_string()))
    }
}

/// Compact form used by binary formats.
#[derive(Serialize, Deserialize)]
enum IdRepr {
    Persistent(Uuid),
    Ephemeral(u64),
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            let repr = match *self {
                ObjectId::Persistent(uuid) => IdRepr::Persistent(uuid),
                ObjectId::Ephemeral(value) => IdRepr::Ephemeral(value),
            };
            repr.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let raw = String::deserialize(deserializer)?;
            raw.parse().map_err(serde::de::Error::custom)
        } else {
            Ok(match IdRepr::deserialize(deserializer)? {
                IdRepr::Persistent(uuid) => ObjectId::Persistent(uuid),
                IdRepr::Ephemeral(value) => ObjectId::Ephemeral(value),
            })
        }
    }
}

/// Source of fresh persistent identifiers.
#[derive(Clone, Debug, Default)]
pub enum IdAllocator {
    /// Random v4 uuids.
    #[default]
    Random,
    /// Monotonic uuids starting at `next`; deterministic across runs.
    Sequential { next: u128 },
}

impl IdAllocator {
    /// Sequential allocator starting at 1.
    pub const fn sequential() -> Self {
        IdAllocator::Sequential { next: 1 }
    }

    pub fn next_persistent(&mut self) -> ObjectId {
        match self {
            IdAllocator::Random => ObjectId::Persistent(Uuid::new_v4()),
            IdAllocator::Sequential { next } => {
                let id = ObjectId::from_u128(*next);
                *next += 1;
                id
            }
        }
    }

    /// Moves a sequential allocator past every persistent id in `used`.
    pub fn skip_past(&mut self, used: impl IntoIterator<Item = ObjectId>) {
        let IdAllocator::Sequential { next } = self else {
            return;
        };
        for id in used {
            if let ObjectId::Persistent(uuid) = id {
                *next = (*next).max(uuid.as_u128().saturating_add(1));
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/id_tests.rs"]
mod tests;
