//! KME status snapshot

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Pairwise status reported by a KME for a (source SAE, target SAE) pair
///
/// A transient read result; the values may change with the next call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KmeStatus {
    pub source_kme_id: String,
    pub target_kme_id: String,
    /// The calling SAE (`master_SAE_ID` on the wire)
    pub source_sae_id: String,
    /// The peer SAE the status was requested for (`slave_SAE_ID` on the wire)
    pub target_sae_id: String,
    /// Default key size in bits
    pub key_size: u32,
    pub stored_key_count: u32,
    pub max_key_count: u32,
    pub max_key_per_request: u32,
    /// Largest key size in bits the KME will deliver
    pub max_key_size: u32,
    /// Smallest key size in bits the KME will deliver
    pub min_key_size: u32,
    pub max_sae_id_count: u32,
    pub status_extension: Option<Map<String, Value>>,
    pub retrieved_at: DateTime<Utc>,
}

impl KmeStatus {
    /// Whether a key of `key_size_bits` falls inside the KME's advertised bounds
    pub fn supports_key_size(&self, key_size_bits: u32) -> bool {
        key_size_bits % 8 == 0
            && key_size_bits >= self.min_key_size
            && key_size_bits <= self.max_key_size
    }

    /// Whether a single request for `count` keys can currently be served
    pub fn can_serve(&self, count: u32) -> bool {
        count > 0 && count <= self.max_key_per_request && count <= self.stored_key_count
    }
}
