//! JSON schema of the ETSI GS QKD 014 REST API
//!
//! Field names follow the wire format; Rust names use source/target rather
//! than the master/slave terms of the standard.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::Zeroizing;

/// Body of `GET {prefix}/{slave_SAE_ID}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "source_KME_ID")]
    pub source_kme_id: String,
    #[serde(rename = "target_KME_ID")]
    pub target_kme_id: String,
    #[serde(rename = "master_SAE_ID")]
    pub source_sae_id: String,
    #[serde(rename = "slave_SAE_ID")]
    pub target_sae_id: String,
    pub key_size: u32,
    pub stored_key_count: u32,
    pub max_key_count: u32,
    pub max_key_per_request: u32,
    pub max_key_size: u32,
    pub min_key_size: u32,
    #[serde(rename = "max_SAE_ID_count", default)]
    pub max_sae_id_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_extension: Option<Map<String, Value>>,
}

/// Body of `POST {prefix}/{slave_SAE_ID}/enc_keys`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRequest {
    pub number: u32,
    /// Key size in bits
    pub size: u32,
    #[serde(
        rename = "additional_slave_SAE_IDs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub additional_target_sae_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_mandatory: Option<Vec<Map<String, Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_optional: Option<Vec<Map<String, Value>>>,
}

/// Body of `POST {prefix}/{master_SAE_ID}/dec_keys`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyIdsRequest {
    #[serde(rename = "key_IDs")]
    pub key_ids: Vec<KeyIdEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyIdEntry {
    #[serde(rename = "key_ID")]
    pub key_id: String,
}

/// Successful answer to `enc_keys` and `dec_keys`
#[derive(Serialize, Deserialize)]
pub struct KeyContainer {
    pub keys: Vec<KeyAndId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_container_extension: Option<Map<String, Value>>,
}

#[derive(Serialize, Deserialize)]
pub struct KeyAndId {
    #[serde(rename = "key_ID")]
    pub key_id: String,
    /// Base64 key bytes, wiped when the container is dropped
    pub key: Zeroizing<String>,
}

/// Error body returned with HTTP 400, 401 and 503
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
