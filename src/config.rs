//! Connection parameters for a KME session

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{error_codes, KmeError, KmeResult};

/// Path prefix of the ETSI GS QKD 014 REST API
pub const DEFAULT_API_PREFIX: &str = "/api/v1/keys";
pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_verify_on_open() -> bool {
    true
}

fn default_api_prefix() -> String {
    DEFAULT_API_PREFIX.to_string()
}

/// Everything needed to open a [`Session`](crate::session::Session) to one KME
///
/// Can be built in code or loaded from a JSON file:
///
/// ```json
/// {
///     "host": "kme-a.example.org",
///     "port": 443,
///     "cert_path": "/etc/qkd/sae-a.crt",
///     "key_path": "/etc/qkd/sae-a.key",
///     "ca_path": "/etc/qkd/kme-ca.crt",
///     "default_target_sae_id": "sae-b"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM file with the local SAE certificate (leaf first, optional chain)
    pub cert_path: PathBuf,
    /// PEM file with the unencrypted PKCS#8 private key of the local SAE
    pub key_path: PathBuf,
    /// PEM file with the CA certificate(s) trusted to sign the KME's certificate
    pub ca_path: PathBuf,
    /// Peer SAE used when a call does not name one explicitly
    #[serde(default)]
    pub default_target_sae_id: Option<String>,
    /// Applies to connecting and to each request
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Perform one request while opening so handshake failures surface early
    #[serde(default = "default_verify_on_open")]
    pub verify_on_open: bool,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

impl SessionConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: ca_path.into(),
            default_target_sae_id: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            verify_on_open: true,
            api_prefix: default_api_prefix(),
        }
    }

    pub fn with_default_target(mut self, sae_id: impl Into<String>) -> Self {
        self.default_target_sae_id = Some(sae_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_verify_on_open(mut self, verify: bool) -> Self {
        self.verify_on_open = verify;
        self
    }

    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `host:port`, for log and error messages
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> KmeResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            KmeError::config_error(
                &format!("Cannot read {}: {}", path.display(), e),
                error_codes::CONFIG_READ_FAILED,
            )
        })?;
        let config: SessionConfig = serde_json::from_str(&contents).map_err(|e| {
            KmeError::config_error(
                &format!("Cannot parse {}: {}", path.display(), e),
                error_codes::CONFIG_INVALID,
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KmeResult<()> {
        if self.host.trim().is_empty() {
            return Err(KmeError::config_error(
                "host must not be empty",
                error_codes::CONFIG_INVALID,
            ));
        }
        if self.port == 0 {
            return Err(KmeError::config_error(
                "port must not be 0",
                error_codes::CONFIG_INVALID,
            ));
        }
        if self.timeout_secs == 0 {
            return Err(KmeError::config_error(
                "timeout_secs must be at least 1",
                error_codes::CONFIG_INVALID,
            ));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(KmeError::config_error(
                &format!("api_prefix must start with '/': {}", self.api_prefix),
                error_codes::CONFIG_INVALID,
            ));
        }
        if let Some(target) = &self.default_target_sae_id {
            if target.is_empty() {
                return Err(KmeError::config_error(
                    "default_target_sae_id must not be empty",
                    error_codes::CONFIG_INVALID,
                ));
            }
        }
        Ok(())
    }
}
