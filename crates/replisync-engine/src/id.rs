//! Replica identities and the 128-bit global item identifier.
//!
//! A global id is `type_tag (32 bits) | replica fingerprint (32 bits) |
//! tick (64 bits)` stored big-endian, so byte order equals numeric order and
//! ids sort by type, then originating replica, then recency.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SyncError;

/// Opaque identity of one replica, generated once per store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaIdentity(Uuid);

impl ReplicaIdentity {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Rebuilds an identity from its 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parses the 16 raw bytes persisted in the extension area.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| SyncError::Format(format!("replica id must be 16 bytes, got {}", bytes.len())))?;
        Ok(Self::from_bytes(raw))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// XOR of the four big-endian 32-bit words of the identity.
    pub fn fingerprint(&self) -> u32 {
        self.0
            .as_bytes()
            .chunks_exact(4)
            .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .fold(0, |acc, w| acc ^ w)
    }
}

impl fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Globally unique, totally ordered item identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct GlobalId([u8; 16]);

impl GlobalId {
    /// Encodes the three components.
    pub fn new(type_tag: u32, fingerprint: u32, tick: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&type_tag.to_be_bytes());
        bytes[4..8].copy_from_slice(&fingerprint.to_be_bytes());
        bytes[8..16].copy_from_slice(&tick.to_be_bytes());
        Self(bytes)
    }

    /// Id of an item created by `replica` at `tick`.
    pub fn for_replica(type_tag: u32, replica: &ReplicaIdentity, tick: u64) -> Self {
        Self::new(type_tag, replica.fingerprint(), tick)
    }

    /// Wraps 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parses raw bytes, failing unless exactly 16 are given.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| SyncError::Format(format!("global id must be 16 bytes, got {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// The raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Type tag component.
    pub fn type_tag(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Replica fingerprint component.
    pub fn fingerprint(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    /// Tick component.
    pub fn tick(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[8..16]);
        u64::from_be_bytes(raw)
    }

    /// Returns `(type_tag, fingerprint, tick)`.
    pub fn decompose(&self) -> (u32, u32, u64) {
        (self.type_tag(), self.fingerprint(), self.tick())
    }

    /// Smallest id of a type.
    pub fn lower_bound(type_tag: u32) -> Self {
        Self::new(type_tag, 0, 0)
    }

    /// Largest id of a type.
    pub fn upper_bound(type_tag: u32) -> Self {
        Self::new(type_tag, u32::MAX, u64::MAX)
    }

    /// Smallest id of a type created by one replica.
    pub fn lower_bound_for_replica(type_tag: u32, replica: &ReplicaIdentity) -> Self {
        Self::new(type_tag, replica.fingerprint(), 0)
    }

    /// Largest id of a type created by one replica.
    pub fn upper_bound_for_replica(type_tag: u32, replica: &ReplicaIdentity) -> Self {
        Self::new(type_tag, replica.fingerprint(), u64::MAX)
    }

    /// Next id of the same type and replica, `None` once the tick is exhausted.
    pub fn next_id(&self) -> Option<Self> {
        let tick = self.tick().checked_add(1)?;
        Some(Self::new(self.type_tag(), self.fingerprint(), tick))
    }

    /// Numeric view of the id.
    pub fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    /// Builds an id from its numeric view.
    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    /// 32 lowercase hex digits.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the text form produced by [`GlobalId::to_hex`].
    pub fn from_hex(text: &str) -> Result<Self, SyncError> {
        if text.len() != 32 {
            return Err(SyncError::Format(format!(
                "global id must be 32 hex digits, got {}",
                text.len()
            )));
        }
        let bytes = hex::decode(text).map_err(|e| SyncError::Format(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GlobalId(tag={}, fp={:08x}, tick={})",
            self.type_tag(),
            self.fingerprint(),
            self.tick()
        )
    }
}

impl FromStr for GlobalId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<GlobalId> for String {
    fn from(id: GlobalId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for GlobalId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}
