/*!
 * QKD 014 Key Delivery Client
 *
 * Client for the ETSI GS QKD 014 REST API through which a Secure Application
 * Entity (SAE) obtains quantum-distributed keys from its Key Management Entity
 * (KME).
 *
 * Two SAEs end up holding the same key as follows:
 *
 * - SAE A calls `get_keys` on its KME and receives key identifiers plus bytes
 * - SAE A hands the identifiers to SAE B over any channel
 * - SAE B calls `get_keys_by_ids` on its own KME and receives the same bytes
 *
 * Key bytes live in locked, access-protected memory and are only readable
 * through a borrow handle. They are zeroed when their buffer is released or
 * dropped.
 *
 * # Example
 *
 * ```no_run
 * use qkd014_client::prelude::*;
 *
 * fn main() -> Result<(), KmeError> {
 *     let config = SessionConfig::new(
 *         "kme-a.example.org",
 *         443,
 *         "/etc/qkd/sae-a.crt",
 *         "/etc/qkd/sae-a.key",
 *         "/etc/qkd/kme-ca.crt",
 *     );
 *     let mut session = Session::open(&config)?;
 *
 *     let status = session.get_status("sae-b")?;
 *     println!("{} keys stored for sae-b", status.stored_key_count);
 *
 *     let keys = session.get_keys(256, "sae-b", None, 2)?;
 *     for key in keys {
 *         {
 *             let bytes = key.borrow()?;
 *             assert_eq!(bytes.len(), 32);
 *         }
 *         println!("share {} with sae-b", key.release());
 *     }
 *
 *     session.close();
 *     Ok(())
 * }
 * ```
 */

/// Error types for every client operation
pub mod error;

/// Session configuration
pub mod config;

/// Locked, access-protected memory for key bytes
pub mod secure_memory;

/// Key identifiers and delivered key records
pub mod key_record;

/// KME status snapshot
pub mod status;

/// Constant-time comparison of key material
pub mod security;

/// Request/response channel to a KME
pub mod transport;

/// Sessions bound to one KME endpoint and SAE identity
pub mod session;

/// ETSI GS QKD 014 operations and wire format
pub mod protocol;

/// Foreign Function Interface (FFI) for integration with other languages
pub mod ffi;

// Re-export main types for convenience
pub use config::SessionConfig;
pub use error::{ErrorKind, KmeError, KmeResult};
pub use key_record::{KeyId, KeyRecord};
pub use protocol::KeyRequestExtensions;
pub use secure_memory::{BufferState, KeyBorrow, SecureKeyBuffer};
pub use session::Session;
pub use status::KmeStatus;
pub use transport::{KmeTransport, Credentials, HttpsTransport};

/// The caller-facing surface in one import
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::error::{error_codes, ErrorKind, KmeError, KmeResult};
    pub use crate::key_record::{KeyId, KeyRecord};
    pub use crate::protocol::{decode_key_container, validate_key_size, KeyRequestExtensions};
    pub use crate::secure_memory::{BufferState, KeyBorrow, SecureKeyBuffer};
    pub use crate::security::{buffers_equal, bytes_equal};
    pub use crate::session::Session;
    pub use crate::status::KmeStatus;
    pub use crate::transport::{KmeRequest, KmeResponse, KmeTransport, Method};
}
