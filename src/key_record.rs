//! Key records returned by the KME
//!
//! A [`KeyRecord`] pairs the KME-issued identifier of a key with exclusive
//! ownership of the [`SecureKeyBuffer`] holding its bytes. The identifier is the
//! only token two SAEs exchange to end up with the same key: the initiating SAE
//! obtains it from `get_keys`, hands it to its peer out of band, and the peer
//! retrieves the identical bytes with `get_keys_by_ids`.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::KmeResult;
use crate::secure_memory::{KeyBorrow, SecureKeyBuffer};
use crate::security::constant_time;

/// Identifier of a key in the KME's pool
///
/// Usually a UUID string, but callers must treat it as an opaque token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for KeyId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for KeyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for KeyId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A key delivered by the KME
///
/// The record owns its key bytes. Release them with [`release`](Self::release)
/// once the key has been handed to the consuming cipher; dropping the record
/// zeroes the bytes as well.
pub struct KeyRecord {
    key_id: KeyId,
    buffer: SecureKeyBuffer,
}

impl KeyRecord {
    pub fn new(key_id: KeyId, buffer: SecureKeyBuffer) -> Self {
        Self { key_id, buffer }
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Key size in bytes
    pub fn key_size(&self) -> usize {
        self.buffer.len()
    }

    /// Key size in bits, as used by the KME's request schema
    pub fn key_size_bits(&self) -> usize {
        self.buffer.len() * 8
    }

    pub fn buffer(&self) -> &SecureKeyBuffer {
        &self.buffer
    }

    /// Borrow the key bytes; see [`SecureKeyBuffer::borrow`]
    pub fn borrow(&self) -> KmeResult<KeyBorrow<'_>> {
        self.buffer.borrow()
    }

    /// Compare identifier and key bytes with another record in constant time
    ///
    /// Fails if either buffer is currently borrowed.
    pub fn ct_matches(&self, other: &KeyRecord) -> KmeResult<bool> {
        let same_id = self.key_id == other.key_id;
        let same_bytes = constant_time::buffers_equal(&self.buffer, &other.buffer)?;
        Ok(same_id & same_bytes)
    }

    /// Zero and free the key bytes, keeping only the identifier
    pub fn release(self) -> KeyId {
        let Self { key_id, buffer } = self;
        buffer.release();
        key_id
    }

    pub fn into_parts(self) -> (KeyId, SecureKeyBuffer) {
        (self.key_id, self.buffer)
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("key_id", &self.key_id)
            .field("key_size", &self.key_size())
            .field("buffer", &self.buffer)
            .finish()
    }
}
