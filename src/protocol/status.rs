//! Status operation

use chrono::Utc;

use super::wire::StatusResponse;
use super::{kme_message, parse_json, unexpected_status};
use crate::error::{error_codes, KmeError, KmeResult};
use crate::session::{validate_sae_id, Resource, Session};
use crate::status::KmeStatus;
use crate::transport::{KmeResponse, KmeTransport};

const OPERATION: &str = "get_status";

impl<T: KmeTransport> Session<T> {
    /// Query the pairwise status between this SAE and `target_sae_id`
    ///
    /// The KME must echo `target_sae_id`; a different target is a protocol
    /// error.
    pub fn get_status(&mut self, target_sae_id: &str) -> KmeResult<KmeStatus> {
        validate_sae_id("target_sae_id", target_sae_id)?;

        let response = self.send(OPERATION, target_sae_id, Resource::Status, None)?;
        if !response.is_success() {
            return Err(status_error(target_sae_id, &response));
        }

        let wire: StatusResponse = parse_json(OPERATION, &response.body)?;
        if wire.target_sae_id != target_sae_id {
            return Err(KmeError::protocol(
                OPERATION,
                &format!(
                    "KME answered for target SAE '{}' instead of '{}'",
                    wire.target_sae_id, target_sae_id
                ),
                error_codes::STATUS_TARGET_MISMATCH,
            ));
        }

        Ok(KmeStatus {
            source_kme_id: wire.source_kme_id,
            target_kme_id: wire.target_kme_id,
            source_sae_id: wire.source_sae_id,
            target_sae_id: wire.target_sae_id,
            key_size: wire.key_size,
            stored_key_count: wire.stored_key_count,
            max_key_count: wire.max_key_count,
            max_key_per_request: wire.max_key_per_request,
            max_key_size: wire.max_key_size,
            min_key_size: wire.min_key_size,
            max_sae_id_count: wire.max_sae_id_count,
            status_extension: wire.status_extension,
            retrieved_at: Utc::now(),
        })
    }

    /// [`get_status`](Self::get_status) for the session's default target
    pub fn get_default_status(&mut self) -> KmeResult<KmeStatus> {
        let target = self.resolve_target(None)?;
        self.get_status(&target)
    }
}

fn status_error(target_sae_id: &str, response: &KmeResponse) -> KmeError {
    match response.status {
        400 | 404 => KmeError::TargetUnknown {
            target_sae_id: target_sae_id.to_string(),
            cause: kme_message(response),
        },
        _ => unexpected_status(OPERATION, response),
    }
}
