//! Get-keys and get-keys-by-id operations
//!
//! Both operations answer with a key container. Every key is base64-decoded
//! into a zeroizing scratch buffer and copied straight into a
//! [`SecureKeyBuffer`]; the container, including the base64 text, is wiped
//! when it goes out of scope.

use std::collections::{HashMap, HashSet};

use log::warn;
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use super::wire::{KeyContainer, KeyIdEntry, KeyIdsRequest, KeyRequest};
use super::{kme_message, parse_json, unexpected_status};
use crate::error::{error_codes, KmeError, KmeResult};
use crate::key_record::{KeyId, KeyRecord};
use crate::secure_memory::SecureKeyBuffer;
use crate::session::{validate_sae_id, Resource, Session};
use crate::transport::{KmeResponse, KmeTransport};

const GET_KEYS: &str = "get_keys";
const GET_KEYS_BY_IDS: &str = "get_keys_by_ids";
const DECODE: &str = "decode_key_container";

/// Optional parts of a get-keys request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRequestExtensions {
    /// Further SAEs that will share the keys (`additional_slave_SAE_IDs`)
    pub additional_target_sae_ids: Vec<String>,
    pub extension_mandatory: Vec<Map<String, Value>>,
    pub extension_optional: Vec<Map<String, Value>>,
}

impl KeyRequestExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_additional_target(mut self, sae_id: impl Into<String>) -> Self {
        self.additional_target_sae_ids.push(sae_id.into());
        self
    }

    pub fn with_mandatory(mut self, extension: Map<String, Value>) -> Self {
        self.extension_mandatory.push(extension);
        self
    }

    pub fn with_optional(mut self, extension: Map<String, Value>) -> Self {
        self.extension_optional.push(extension);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.additional_target_sae_ids.is_empty()
            && self.extension_mandatory.is_empty()
            && self.extension_optional.is_empty()
    }
}

/// Check a key size in bits and return it in bytes
pub fn validate_key_size(key_size_bits: u32) -> KmeResult<usize> {
    if key_size_bits == 0 || key_size_bits % 8 != 0 {
        return Err(KmeError::InvalidKeySize {
            requested_bits: key_size_bits,
            cause: "key size must be a positive multiple of 8 bits".to_string(),
        });
    }
    Ok((key_size_bits / 8) as usize)
}

impl<T: KmeTransport> Session<T> {
    /// Request `count` new keys of `key_size_bits` shared with `target_sae_id`
    ///
    /// Consumes key material from the KME pool: two calls never return the same
    /// keys. The KME may deliver fewer keys than requested without signalling
    /// an error; callers needing an exact count must check the length.
    /// Every returned buffer is protected.
    pub fn get_keys(
        &mut self,
        key_size_bits: u32,
        target_sae_id: &str,
        extensions: Option<&KeyRequestExtensions>,
        count: u32,
    ) -> KmeResult<Vec<KeyRecord>> {
        let key_len = validate_key_size(key_size_bits)?;
        if count == 0 {
            return Err(KmeError::invalid_argument("count", "at least 1", "0"));
        }
        validate_sae_id("target_sae_id", target_sae_id)?;

        let request = key_request(key_size_bits, count, extensions)?;
        let body = serde_json::to_string(&request).map_err(|e| {
            KmeError::invalid_argument("extensions", "JSON-serializable values", &e.to_string())
        })?;

        let response = self.send(GET_KEYS, target_sae_id, Resource::EncKeys, Some(body))?;
        if !response.is_success() {
            return Err(enc_keys_error(target_sae_id, key_size_bits, &response));
        }

        let records = decode_records(GET_KEYS, &response.body, Some(key_len))?;
        let delivered = records.len();
        if delivered > count as usize {
            return Err(KmeError::protocol(
                GET_KEYS,
                &format!("KME delivered {} keys but only {} were requested", delivered, count),
                error_codes::TOO_MANY_KEYS,
            ));
        }
        if delivered < count as usize {
            warn!(
                "KME delivered {} of {} requested keys for target SAE '{}'",
                delivered, count, target_sae_id
            );
        }

        Ok(records)
    }

    /// [`get_keys`](Self::get_keys) for the session's default target
    pub fn get_keys_default(&mut self, key_size_bits: u32, count: u32) -> KmeResult<Vec<KeyRecord>> {
        let target = self.resolve_target(None)?;
        self.get_keys(key_size_bits, &target, None, count)
    }

    /// Retrieve keys that `source_sae_id` obtained with `get_keys`
    ///
    /// `count` must equal `key_ids.len()`; otherwise the call fails with
    /// `CountMismatch` before contacting the KME. The result is in the order of
    /// `key_ids`. If any identifier is unknown, nothing is returned.
    pub fn get_keys_by_ids(
        &mut self,
        source_sae_id: &str,
        key_ids: &[KeyId],
        count: usize,
    ) -> KmeResult<Vec<KeyRecord>> {
        if count != key_ids.len() {
            return Err(KmeError::CountMismatch {
                expected: count,
                actual: key_ids.len(),
            });
        }
        if key_ids.is_empty() {
            return Err(KmeError::invalid_argument(
                "key_ids",
                "at least one key ID",
                "empty list",
            ));
        }

        let mut requested = HashSet::with_capacity(key_ids.len());
        for key_id in key_ids {
            if key_id.as_str().is_empty() {
                return Err(KmeError::invalid_argument("key_ids", "non-empty key IDs", "empty key ID"));
            }
            if !requested.insert(key_id.as_str()) {
                return Err(KmeError::invalid_argument("key_ids", "distinct key IDs", key_id.as_str()));
            }
        }
        validate_sae_id("source_sae_id", source_sae_id)?;

        let request = KeyIdsRequest {
            key_ids: key_ids
                .iter()
                .map(|key_id| KeyIdEntry {
                    key_id: key_id.as_str().to_string(),
                })
                .collect(),
        };
        let body = serde_json::to_string(&request).map_err(|e| {
            KmeError::invalid_argument("key_ids", "JSON-serializable key IDs", &e.to_string())
        })?;

        let response = self.send(GET_KEYS_BY_IDS, source_sae_id, Resource::DecKeys, Some(body))?;
        if !response.is_success() {
            return Err(dec_keys_error(source_sae_id, key_ids, &response));
        }

        let records = decode_records(GET_KEYS_BY_IDS, &response.body, None)?;
        order_by_request(records, key_ids)
    }

    /// [`get_keys_by_ids`](Self::get_keys_by_ids) with the session's default
    /// target as the SAE that issued the keys
    pub fn get_keys_by_ids_default(
        &mut self,
        key_ids: &[KeyId],
        count: usize,
    ) -> KmeResult<Vec<KeyRecord>> {
        let source = self.resolve_target(None)?;
        self.get_keys_by_ids(&source, key_ids, count)
    }
}

/// Decode a key container body into records
///
/// With `expected_len` set, every key must be exactly that many bytes long.
/// Identifiers must be non-empty and unique.
pub fn decode_key_container(body: &str, expected_len: Option<usize>) -> KmeResult<Vec<KeyRecord>> {
    decode_records(DECODE, body, expected_len)
}

fn key_request(
    key_size_bits: u32,
    count: u32,
    extensions: Option<&KeyRequestExtensions>,
) -> KmeResult<KeyRequest> {
    let mut request = KeyRequest {
        number: count,
        size: key_size_bits,
        additional_target_sae_ids: Vec::new(),
        extension_mandatory: None,
        extension_optional: None,
    };

    if let Some(extensions) = extensions {
        for sae_id in &extensions.additional_target_sae_ids {
            validate_sae_id("additional_target_sae_ids", sae_id)?;
        }
        request.additional_target_sae_ids = extensions.additional_target_sae_ids.clone();
        if !extensions.extension_mandatory.is_empty() {
            request.extension_mandatory = Some(extensions.extension_mandatory.clone());
        }
        if !extensions.extension_optional.is_empty() {
            request.extension_optional = Some(extensions.extension_optional.clone());
        }
    }

    Ok(request)
}

fn decode_records(operation: &str, body: &str, expected_len: Option<usize>) -> KmeResult<Vec<KeyRecord>> {
    let container: KeyContainer = parse_json(operation, body)?;

    let mut seen = HashSet::with_capacity(container.keys.len());
    let mut records = Vec::with_capacity(container.keys.len());
    for entry in &container.keys {
        if entry.key_id.is_empty() {
            return Err(KmeError::protocol(
                operation,
                "KME delivered a key without key_ID",
                error_codes::MALFORMED_RESPONSE,
            ));
        }
        if !seen.insert(entry.key_id.as_str()) {
            return Err(KmeError::protocol(
                operation,
                &format!("KME delivered key ID {} more than once", entry.key_id),
                error_codes::DUPLICATE_KEY_ID,
            ));
        }

        let buffer = decode_key(operation, &entry.key_id, &entry.key)?;
        if let Some(expected) = expected_len {
            if buffer.len() != expected {
                return Err(KmeError::protocol(
                    operation,
                    &format!(
                        "key {} is {} bytes long, expected {}",
                        entry.key_id,
                        buffer.len(),
                        expected
                    ),
                    error_codes::KEY_LENGTH_MISMATCH,
                ));
            }
        }
        records.push(KeyRecord::new(KeyId::new(entry.key_id.clone()), buffer));
    }

    Ok(records)
}

fn decode_key(operation: &str, key_id: &str, encoded: &str) -> KmeResult<SecureKeyBuffer> {
    let encoded = encoded.trim();
    let invalid = |cause: &str| {
        KmeError::protocol(
            operation,
            &format!("key {} is not valid base64: {}", key_id, cause),
            error_codes::INVALID_KEY_ENCODING,
        )
    };

    let mut scratch = Zeroizing::new(vec![0u8; (encoded.len() + 3) / 4 * 3]);
    let written = base64::decode_config_slice(encoded, base64::STANDARD, &mut scratch[..])
        .map_err(|e| invalid(&e.to_string()))?;
    if written == 0 {
        return Err(invalid("empty key"));
    }

    SecureKeyBuffer::from_slice(&scratch[..written])
}

/// Put records into the order of `requested`, all or nothing
fn order_by_request(records: Vec<KeyRecord>, requested: &[KeyId]) -> KmeResult<Vec<KeyRecord>> {
    let mut by_id: HashMap<KeyId, KeyRecord> = HashMap::with_capacity(records.len());
    for record in records {
        if !requested.contains(record.key_id()) {
            return Err(KmeError::protocol(
                GET_KEYS_BY_IDS,
                &format!("KME delivered key ID {} which was not requested", record.key_id()),
                error_codes::UNEXPECTED_KEY_ID,
            ));
        }
        by_id.insert(record.key_id().clone(), record);
    }

    let missing: Vec<String> = requested
        .iter()
        .filter(|key_id| !by_id.contains_key(*key_id))
        .map(|key_id| key_id.as_str().to_string())
        .collect();
    if !missing.is_empty() {
        // Dropping `by_id` wipes the keys that were delivered
        return Err(KmeError::UnknownKeyId {
            key_ids: missing,
            cause: "KME did not deliver every requested key".to_string(),
        });
    }

    Ok(requested
        .iter()
        .filter_map(|key_id| by_id.remove(key_id))
        .collect())
}

fn enc_keys_error(target_sae_id: &str, key_size_bits: u32, response: &KmeResponse) -> KmeError {
    let message = kme_message(response);
    let lowered = message.to_lowercase();
    match response.status {
        404 => KmeError::TargetUnknown {
            target_sae_id: target_sae_id.to_string(),
            cause: message,
        },
        400 if lowered.contains("size") => KmeError::InvalidKeySize {
            requested_bits: key_size_bits,
            cause: message,
        },
        400 if lowered.contains("sae")
            && (lowered.contains("unknown") || lowered.contains("not found")) =>
        {
            KmeError::TargetUnknown {
                target_sae_id: target_sae_id.to_string(),
                cause: message,
            }
        }
        400 if ["insufficient", "not enough", "exceeds stored", "exceed stored"]
            .iter()
            .any(|marker| lowered.contains(marker)) =>
        {
            KmeError::InsufficientKeyMaterial {
                target_sae_id: target_sae_id.to_string(),
                cause: message,
            }
        }
        _ => unexpected_status(GET_KEYS, response),
    }
}

fn dec_keys_error(source_sae_id: &str, key_ids: &[KeyId], response: &KmeResponse) -> KmeError {
    let message = kme_message(response);
    let lowered = message.to_lowercase();
    match response.status {
        400 | 404
            if lowered.contains("sae")
                && (lowered.contains("unknown") || lowered.contains("not found"))
                && !lowered.contains("key") =>
        {
            KmeError::TargetUnknown {
                target_sae_id: source_sae_id.to_string(),
                cause: message,
            }
        }
        400 | 404 => KmeError::UnknownKeyId {
            key_ids: key_ids.iter().map(|key_id| key_id.as_str().to_string()).collect(),
            cause: message,
        },
        _ => unexpected_status(GET_KEYS_BY_IDS, response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn container(entries: &[(&str, &[u8])]) -> String {
        let keys: Vec<String> = entries
            .iter()
            .map(|(id, bytes)| format!(r#"{{"key_ID":"{}","key":"{}"}}"#, id, base64::encode(bytes)))
            .collect();
        format!(r#"{{"keys":[{}]}}"#, keys.join(","))
    }

    #[test]
    fn test_validate_key_size() {
        assert_eq!(validate_key_size(256).unwrap(), 32);
        assert_eq!(validate_key_size(8).unwrap(), 1);
        assert_eq!(validate_key_size(0).unwrap_err().kind(), ErrorKind::InvalidKeySize);
        assert_eq!(validate_key_size(255).unwrap_err().kind(), ErrorKind::InvalidKeySize);
    }

    #[test]
    fn test_decode_container() {
        let body = container(&[("k1", &[1u8; 32]), ("k2", &[2u8; 32])]);
        let records = decode_key_container(&body, Some(32)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key_id().as_str(), "k1");
        assert_eq!(records[1].key_size(), 32);
        assert_eq!(&*records[1].borrow().unwrap(), &[2u8; 32][..]);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let body = container(&[("k1", &[1u8; 16])]);
        let err = decode_key_container(&body, Some(32)).unwrap_err();
        assert_eq!(err.error_code(), error_codes::KEY_LENGTH_MISMATCH);
    }

    #[test]
    fn test_decode_rejects_duplicates_and_bad_base64() {
        let body = container(&[("k1", &[1u8; 4]), ("k1", &[2u8; 4])]);
        let err = decode_key_container(&body, None).unwrap_err();
        assert_eq!(err.error_code(), error_codes::DUPLICATE_KEY_ID);

        let err = decode_key_container(r#"{"keys":[{"key_ID":"k1","key":"!!!"}]}"#, None).unwrap_err();
        assert_eq!(err.error_code(), error_codes::INVALID_KEY_ENCODING);
        assert!(!err.message().contains("!!!"));

        let err = decode_key_container(r#"{"keys":[{"key_ID":"k1","key":""}]}"#, None).unwrap_err();
        assert_eq!(err.error_code(), error_codes::INVALID_KEY_ENCODING);
    }

    #[test]
    fn test_order_by_request() {
        let body = container(&[("b", &[2u8; 8]), ("a", &[1u8; 8])]);
        let records = decode_key_container(&body, None).unwrap();
        let requested = vec![KeyId::new("a"), KeyId::new("b")];
        let ordered = order_by_request(records, &requested).unwrap();
        assert_eq!(ordered[0].key_id().as_str(), "a");
        assert_eq!(ordered[1].key_id().as_str(), "b");
    }

    #[test]
    fn test_order_by_request_missing_is_unknown() {
        let body = container(&[("a", &[1u8; 8])]);
        let records = decode_key_container(&body, None).unwrap();
        let requested = vec![KeyId::new("a"), KeyId::new("b")];
        match order_by_request(records, &requested) {
            Err(KmeError::UnknownKeyId { key_ids, .. }) => assert_eq!(key_ids, vec!["b".to_string()]),
            other => panic!("unexpected result: {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_order_by_request_rejects_unrequested() {
        let body = container(&[("a", &[1u8; 8]), ("z", &[9u8; 8])]);
        let records = decode_key_container(&body, None).unwrap();
        let err = order_by_request(records, &[KeyId::new("a")]).unwrap_err();
        assert_eq!(err.error_code(), error_codes::UNEXPECTED_KEY_ID);
    }

    #[test]
    fn test_enc_keys_error_mapping() {
        let response = KmeResponse::new(400, r#"{"message":"requested size is not supported"}"#);
        assert_eq!(enc_keys_error("b", 12, &response).kind(), ErrorKind::InvalidKeySize);

        let response = KmeResponse::new(400, r#"{"message":"number of requested keys exceeds stored keys"}"#);
        assert_eq!(enc_keys_error("b", 256, &response).kind(), ErrorKind::InsufficientKeyMaterial);

        let response = KmeResponse::new(400, r#"{"message":"slave SAE unknown"}"#);
        assert_eq!(enc_keys_error("b", 256, &response).kind(), ErrorKind::TargetUnknown);

        let response = KmeResponse::new(400, r#"{"message":"bad request"}"#);
        assert_eq!(enc_keys_error("b", 256, &response).kind(), ErrorKind::ProtocolError);

        for message in [
            "number must be a positive integer",
            "stored procedure failed",
            "service not available",
        ] {
            let body = format!(r#"{{"message":"{}"}}"#, message);
            let response = KmeResponse::new(400, body);
            assert_eq!(enc_keys_error("b", 256, &response).kind(), ErrorKind::ProtocolError, "{}", message);
        }

        let response = KmeResponse::new(400, r#"{"message":"not enough key material for SAE b"}"#);
        assert_eq!(enc_keys_error("b", 256, &response).kind(), ErrorKind::InsufficientKeyMaterial);
    }

    #[test]
    fn test_dec_keys_error_mapping() {
        let ids = vec![KeyId::new("x")];
        let response = KmeResponse::new(400, r#"{"message":"key_ID not found"}"#);
        assert_eq!(dec_keys_error("a", &ids, &response).kind(), ErrorKind::UnknownKeyId);

        let response = KmeResponse::new(404, r#"{"message":"master SAE not found"}"#);
        assert_eq!(dec_keys_error("a", &ids, &response).kind(), ErrorKind::TargetUnknown);

        let response = KmeResponse::new(503, "");
        assert_eq!(dec_keys_error("a", &ids, &response).kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn test_extensions_in_request() {
        let mut extension = Map::new();
        extension.insert("route_type".to_string(), Value::from("direct"));
        let extensions = KeyRequestExtensions::new()
            .with_additional_target("sae-c")
            .with_optional(extension);
        assert!(!extensions.is_empty());

        let request = key_request(256, 3, Some(&extensions)).unwrap();
        assert_eq!(request.additional_target_sae_ids, vec!["sae-c".to_string()]);
        assert!(request.extension_mandatory.is_none());
        assert_eq!(request.extension_optional.as_ref().map(Vec::len), Some(1));

        let bad = KeyRequestExtensions::new().with_additional_target("a/b");
        assert!(key_request(256, 1, Some(&bad)).is_err());
    }
}
