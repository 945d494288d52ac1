/*!
 * ETSI GS QKD 014 Operations
 *
 * The three operations of the key delivery API, implemented as methods on
 * [`Session`](crate::session::Session):
 *
 * - `get_status`: pairwise status for a target SAE
 * - `get_keys`: new keys shared with a target SAE (`enc_keys`)
 * - `get_keys_by_ids`: the peer's copy of keys by identifier (`dec_keys`)
 */

pub mod keys;
pub mod status;
pub mod wire;

use serde::de::DeserializeOwned;

use crate::error::{error_codes, KmeError, KmeResult};
use crate::transport::KmeResponse;

pub use keys::{decode_key_container, validate_key_size, KeyRequestExtensions};

/// Longest KME error message carried into a `KmeError`
const MAX_KME_MESSAGE_LEN: usize = 256;

pub(crate) fn parse_json<T: DeserializeOwned>(operation: &str, body: &str) -> KmeResult<T> {
    // serde_json errors report a position, never the offending input
    serde_json::from_str(body).map_err(|e| {
        KmeError::protocol(
            operation,
            &format!("malformed JSON response: {}", e),
            error_codes::MALFORMED_RESPONSE,
        )
    })
}

/// The `message` field of an ETSI error body, if there is one
pub(crate) fn kme_message(response: &KmeResponse) -> String {
    match serde_json::from_str::<wire::ErrorResponse>(&response.body) {
        Ok(error) => error.message.chars().take(MAX_KME_MESSAGE_LEN).collect(),
        Err(_) => format!("HTTP {} without an error message", response.status),
    }
}

/// Failure statuses shared by all operations
pub(crate) fn unexpected_status(operation: &str, response: &KmeResponse) -> KmeError {
    let message = kme_message(response);
    match response.status {
        401 => KmeError::invalid_credentials(
            &format!("KME rejected the SAE identity during {}: {}", operation, message),
            error_codes::CREDENTIALS_REJECTED,
        ),
        503 => KmeError::protocol_status(
            operation,
            &format!("KME unavailable: {}", message),
            503,
        ),
        status => KmeError::protocol_status(
            operation,
            &format!("unexpected HTTP {}: {}", status, message),
            status,
        ),
    }
}
