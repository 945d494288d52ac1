/*!
 * Error Handling for the QKD 014 Client
 *
 * Every fallible operation in the crate reports a `KmeError`. Each error pairs a
 * human-readable message with a machine-distinguishable `ErrorKind`, a stable
 * numeric code and, where it helps an operator, a suggested remediation.
 */

use std::collections::HashMap;
use thiserror::Error;

/// Machine-distinguishable category of a [`KmeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The KME endpoint could not be reached while opening a session
    ConnectionFailed,
    /// The TLS handshake failed while opening a session
    TlsHandshakeFailed,
    /// Local certificate/key material is unreadable, mismatched, or was rejected
    InvalidCredentials,
    /// A network fault occurred on an open session
    TransportError,
    /// The KME answered with a malformed or inconsistent response
    ProtocolError,
    InvalidKeySize,
    InsufficientKeyMaterial,
    TargetUnknown,
    UnknownKeyId,
    CountMismatch,
    /// A key buffer was borrowed while a borrow was already outstanding
    AlreadyBorrowed,
    /// Caller input is malformed in a way not covered by a more specific kind
    InvalidArgument,
    /// Secure memory could not be allocated
    MemoryError,
    ConfigError,
}

/// Error type for all KME client operations
#[derive(Debug, Error)]
pub enum KmeError {
    #[error("Connection to {endpoint} failed: {cause}")]
    ConnectionFailed { endpoint: String, cause: String },

    #[error("TLS handshake with {endpoint} failed: {cause}")]
    TlsHandshakeFailed { endpoint: String, cause: String },

    #[error("Invalid credentials: {cause}")]
    InvalidCredentials { cause: String, error_code: u32 },

    #[error("Transport error during {operation}: {cause}")]
    Transport {
        operation: String,
        cause: String,
        timed_out: bool,
        error_code: u32,
    },

    #[error("Protocol error during {operation}: {cause}")]
    Protocol {
        operation: String,
        cause: String,
        http_status: Option<u16>,
        error_code: u32,
    },

    #[error("Invalid key size {requested_bits} bits: {cause}")]
    InvalidKeySize { requested_bits: u32, cause: String },

    #[error("Insufficient key material for target SAE '{target_sae_id}': {cause}")]
    InsufficientKeyMaterial { target_sae_id: String, cause: String },

    #[error("Target SAE '{target_sae_id}' unknown to the KME: {cause}")]
    TargetUnknown { target_sae_id: String, cause: String },

    #[error("Unknown key ID(s) {key_ids:?}: {cause}")]
    UnknownKeyId { key_ids: Vec<String>, cause: String },

    #[error("Count mismatch: {expected} keys requested but {actual} key IDs supplied")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Key buffer is already borrowed: {operation}")]
    AlreadyBorrowed { operation: String },

    #[error("Invalid parameter: {parameter} - expected {expected}, got {actual}")]
    InvalidArgument {
        parameter: String,
        expected: String,
        actual: String,
    },

    #[error("Memory operation failed: {operation} - {cause}")]
    MemoryError {
        operation: String,
        cause: String,
        error_code: u32,
    },

    #[error("Configuration error: {cause}")]
    Config { cause: String, error_code: u32 },
}

/// Error code constants for different error categories
pub mod error_codes {
    // Session construction errors: 1000-1999
    pub const CONNECTION_FAILED: u32 = 1001;
    pub const TLS_HANDSHAKE_FAILED: u32 = 1002;
    pub const CREDENTIAL_READ_FAILED: u32 = 1003;
    pub const CREDENTIAL_PARSE_FAILED: u32 = 1004;
    pub const CREDENTIAL_PAIR_MISMATCH: u32 = 1005;
    pub const UNSUPPORTED_KEY_TYPE: u32 = 1006;
    pub const CREDENTIALS_REJECTED: u32 = 1007;

    // Transport errors: 2000-2999
    pub const TRANSPORT_FAILED: u32 = 2001;
    pub const TRANSPORT_TIMEOUT: u32 = 2002;
    pub const SESSION_UNUSABLE: u32 = 2003;
    pub const RESPONSE_READ_FAILED: u32 = 2004;

    // Protocol errors: 3000-3999
    pub const MALFORMED_RESPONSE: u32 = 3001;
    pub const UNEXPECTED_HTTP_STATUS: u32 = 3002;
    pub const STATUS_TARGET_MISMATCH: u32 = 3003;
    pub const KEY_LENGTH_MISMATCH: u32 = 3004;
    pub const UNEXPECTED_KEY_ID: u32 = 3005;
    pub const DUPLICATE_KEY_ID: u32 = 3006;
    pub const TOO_MANY_KEYS: u32 = 3007;
    pub const INVALID_KEY_ENCODING: u32 = 3008;

    // Request contract errors: 4000-4999
    pub const INVALID_KEY_SIZE: u32 = 4001;
    pub const INSUFFICIENT_KEY_MATERIAL: u32 = 4002;
    pub const TARGET_UNKNOWN: u32 = 4003;
    pub const UNKNOWN_KEY_ID: u32 = 4004;
    pub const COUNT_MISMATCH: u32 = 4005;
    pub const INVALID_ARGUMENT: u32 = 4006;

    // Memory errors: 5000-5999
    pub const ALREADY_BORROWED: u32 = 5001;
    pub const MEMORY_ALLOCATION_FAILED: u32 = 5002;
    pub const MEMORY_PROTECTION_FAILED: u32 = 5003;

    // Configuration errors: 6000-6999
    pub const CONFIG_READ_FAILED: u32 = 6001;
    pub const CONFIG_INVALID: u32 = 6002;
}

impl KmeError {
    /// Get the machine-distinguishable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            KmeError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            KmeError::TlsHandshakeFailed { .. } => ErrorKind::TlsHandshakeFailed,
            KmeError::InvalidCredentials { .. } => ErrorKind::InvalidCredentials,
            KmeError::Transport { .. } => ErrorKind::TransportError,
            KmeError::Protocol { .. } => ErrorKind::ProtocolError,
            KmeError::InvalidKeySize { .. } => ErrorKind::InvalidKeySize,
            KmeError::InsufficientKeyMaterial { .. } => ErrorKind::InsufficientKeyMaterial,
            KmeError::TargetUnknown { .. } => ErrorKind::TargetUnknown,
            KmeError::UnknownKeyId { .. } => ErrorKind::UnknownKeyId,
            KmeError::CountMismatch { .. } => ErrorKind::CountMismatch,
            KmeError::AlreadyBorrowed { .. } => ErrorKind::AlreadyBorrowed,
            KmeError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            KmeError::MemoryError { .. } => ErrorKind::MemoryError,
            KmeError::Config { .. } => ErrorKind::ConfigError,
        }
    }

    /// Human-readable message describing this error
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Get the numeric error code for this error
    pub fn error_code(&self) -> u32 {
        match self {
            KmeError::ConnectionFailed { .. } => error_codes::CONNECTION_FAILED,
            KmeError::TlsHandshakeFailed { .. } => error_codes::TLS_HANDSHAKE_FAILED,
            KmeError::InvalidCredentials { error_code, .. } => *error_code,
            KmeError::Transport { error_code, .. } => *error_code,
            KmeError::Protocol { error_code, .. } => *error_code,
            KmeError::InvalidKeySize { .. } => error_codes::INVALID_KEY_SIZE,
            KmeError::InsufficientKeyMaterial { .. } => error_codes::INSUFFICIENT_KEY_MATERIAL,
            KmeError::TargetUnknown { .. } => error_codes::TARGET_UNKNOWN,
            KmeError::UnknownKeyId { .. } => error_codes::UNKNOWN_KEY_ID,
            KmeError::CountMismatch { .. } => error_codes::COUNT_MISMATCH,
            KmeError::AlreadyBorrowed { .. } => error_codes::ALREADY_BORROWED,
            KmeError::InvalidArgument { .. } => error_codes::INVALID_ARGUMENT,
            KmeError::MemoryError { error_code, .. } => *error_code,
            KmeError::Config { error_code, .. } => *error_code,
        }
    }

    /// Whether this error was caused by a transport timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, KmeError::Transport { timed_out: true, .. })
    }

    /// Get a user-friendly error message
    pub fn user_friendly_message(&self) -> String {
        match self {
            KmeError::ConnectionFailed { endpoint, .. } => {
                format!("Could not reach the KME at {}. Check host, port and network.", endpoint)
            }
            KmeError::TlsHandshakeFailed { endpoint, .. } => format!(
                "Secure channel to the KME at {} could not be established.",
                endpoint
            ),
            KmeError::InvalidCredentials { .. } => {
                "The local SAE certificate or private key is unusable.".to_string()
            }
            KmeError::Transport { timed_out: true, .. } => {
                "The KME did not answer in time. The session must be reopened.".to_string()
            }
            KmeError::Transport { operation, .. } => {
                format!("Network failure during '{}'.", operation)
            }
            KmeError::Protocol { operation, .. } => format!(
                "The KME sent an unexpected answer to '{}'. Key material was not accepted.",
                operation
            ),
            KmeError::InvalidKeySize { requested_bits, .. } => {
                format!("Key size of {} bits is not acceptable.", requested_bits)
            }
            KmeError::InsufficientKeyMaterial { target_sae_id, .. } => format!(
                "Not enough key material is available for SAE '{}'.",
                target_sae_id
            ),
            KmeError::TargetUnknown { target_sae_id, .. } => {
                format!("The KME does not know SAE '{}'.", target_sae_id)
            }
            KmeError::UnknownKeyId { key_ids, .. } => {
                format!("{} requested key ID(s) could not be found.", key_ids.len())
            }
            KmeError::CountMismatch { expected, actual } => format!(
                "Requested {} keys but supplied {} key IDs.",
                expected, actual
            ),
            KmeError::AlreadyBorrowed { .. } => {
                "Key bytes are already in use. Return the borrow first.".to_string()
            }
            KmeError::InvalidArgument { parameter, expected, .. } => {
                format!("Invalid parameter '{}'. Expected {}.", parameter, expected)
            }
            KmeError::MemoryError { operation, .. } => {
                format!("Secure memory operation '{}' failed.", operation)
            }
            KmeError::Config { .. } => "The client configuration is invalid.".to_string(),
        }
    }

    /// Get technical details for debugging
    pub fn technical_details(&self) -> HashMap<String, String> {
        let mut details = HashMap::new();

        details.insert("error_code".to_string(), self.error_code().to_string());
        details.insert("error_type".to_string(), self.error_type().to_string());
        details.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());

        match self {
            KmeError::Transport {
                operation,
                cause,
                timed_out,
                ..
            } => {
                details.insert("operation".to_string(), operation.clone());
                details.insert("cause".to_string(), cause.clone());
                details.insert("timed_out".to_string(), timed_out.to_string());
            }
            KmeError::Protocol {
                operation,
                cause,
                http_status,
                ..
            } => {
                details.insert("operation".to_string(), operation.clone());
                details.insert("cause".to_string(), cause.clone());
                if let Some(status) = http_status {
                    details.insert("http_status".to_string(), status.to_string());
                }
            }
            KmeError::InvalidArgument {
                parameter,
                expected,
                actual,
            } => {
                details.insert("parameter".to_string(), parameter.clone());
                details.insert("expected".to_string(), expected.clone());
                details.insert("actual".to_string(), actual.clone());
            }
            _ => {
                details.insert("details".to_string(), self.to_string());
            }
        }

        details
    }

    /// Get suggested remediation steps
    pub fn suggested_remediation(&self) -> Option<String> {
        match self {
            KmeError::InvalidCredentials { error_code, .. } => match *error_code {
                error_codes::CREDENTIAL_PAIR_MISMATCH => Some(
                    "The private key does not belong to the certificate. Use the matching key file."
                        .to_string(),
                ),
                error_codes::UNSUPPORTED_KEY_TYPE => Some(
                    "Provide an unencrypted PKCS#8 Ed25519, ECDSA P-256/P-384 or RSA key."
                        .to_string(),
                ),
                error_codes::CREDENTIALS_REJECTED => Some(
                    "The KME rejected this SAE identity. Check that the certificate is registered."
                        .to_string(),
                ),
                _ => Some("Check certificate and key paths and file permissions.".to_string()),
            },
            KmeError::TlsHandshakeFailed { .. } => Some(
                "Verify the trusted CA matches the KME certificate and the KME accepts the client certificate."
                    .to_string(),
            ),
            KmeError::Transport { timed_out: true, .. } => {
                Some("Close the session and open a new one before retrying.".to_string())
            }
            KmeError::InsufficientKeyMaterial { .. } => Some(
                "Query the status for stored_key_count and request fewer keys or wait for the pool to refill."
                    .to_string(),
            ),
            KmeError::InvalidKeySize { .. } => Some(
                "Use a positive multiple of 8 within the KME's min_key_size and max_key_size."
                    .to_string(),
            ),
            KmeError::AlreadyBorrowed { .. } => {
                Some("Return the outstanding borrow before borrowing or releasing.".to_string())
            }
            _ => None,
        }
    }

    /// Get the error category/type as a string
    pub fn error_type(&self) -> &'static str {
        match self {
            KmeError::ConnectionFailed { .. } => "ConnectionFailed",
            KmeError::TlsHandshakeFailed { .. } => "TlsHandshakeFailed",
            KmeError::InvalidCredentials { .. } => "InvalidCredentials",
            KmeError::Transport { .. } => "TransportError",
            KmeError::Protocol { .. } => "ProtocolError",
            KmeError::InvalidKeySize { .. } => "InvalidKeySize",
            KmeError::InsufficientKeyMaterial { .. } => "InsufficientKeyMaterial",
            KmeError::TargetUnknown { .. } => "TargetUnknown",
            KmeError::UnknownKeyId { .. } => "UnknownKeyId",
            KmeError::CountMismatch { .. } => "CountMismatch",
            KmeError::AlreadyBorrowed { .. } => "AlreadyBorrowed",
            KmeError::InvalidArgument { .. } => "InvalidArgument",
            KmeError::MemoryError { .. } => "MemoryError",
            KmeError::Config { .. } => "ConfigError",
        }
    }
}

/// Convenience constructors for common error types
impl KmeError {
    pub fn invalid_argument(parameter: &str, expected: &str, actual: &str) -> Self {
        KmeError::InvalidArgument {
            parameter: parameter.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn invalid_credentials(cause: &str, error_code: u32) -> Self {
        KmeError::InvalidCredentials {
            cause: cause.to_string(),
            error_code,
        }
    }

    pub fn transport(operation: &str, cause: &str, error_code: u32) -> Self {
        KmeError::Transport {
            operation: operation.to_string(),
            cause: cause.to_string(),
            timed_out: false,
            error_code,
        }
    }

    pub fn timeout(operation: &str, cause: &str) -> Self {
        KmeError::Transport {
            operation: operation.to_string(),
            cause: cause.to_string(),
            timed_out: true,
            error_code: error_codes::TRANSPORT_TIMEOUT,
        }
    }

    pub fn protocol(operation: &str, cause: &str, error_code: u32) -> Self {
        KmeError::Protocol {
            operation: operation.to_string(),
            cause: cause.to_string(),
            http_status: None,
            error_code,
        }
    }

    pub fn protocol_status(operation: &str, cause: &str, http_status: u16) -> Self {
        KmeError::Protocol {
            operation: operation.to_string(),
            cause: cause.to_string(),
            http_status: Some(http_status),
            error_code: error_codes::UNEXPECTED_HTTP_STATUS,
        }
    }

    pub fn already_borrowed(operation: &str) -> Self {
        KmeError::AlreadyBorrowed {
            operation: operation.to_string(),
        }
    }

    pub fn memory_error(operation: &str, cause: &str, error_code: u32) -> Self {
        KmeError::MemoryError {
            operation: operation.to_string(),
            cause: cause.to_string(),
            error_code,
        }
    }

    pub fn config_error(cause: &str, error_code: u32) -> Self {
        KmeError::Config {
            cause: cause.to_string(),
            error_code,
        }
    }
}

/// Result type alias for KME client operations
pub type KmeResult<T> = Result<T, KmeError>;
