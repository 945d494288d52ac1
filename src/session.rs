/*!
 * KME Session
 *
 * A [`Session`] binds one KME endpoint, one local SAE identity and one set of
 * trust anchors for its whole lifetime. Changing any of them means opening a
 * new session.
 *
 * Requests are strictly sequential: every operation takes `&mut self`, so a
 * session can never have two requests in flight. A request that times out
 * leaves the session unusable; close it and open a new one.
 */

use std::fmt;

use log::{debug, info, warn};

use crate::config::{SessionConfig, DEFAULT_API_PREFIX};
use crate::error::{error_codes, KmeError, KmeResult};
use crate::transport::{Credentials, HttpsTransport, KmeRequest, KmeResponse, KmeTransport};

/// KME resource addressed below `{api_prefix}/{SAE_ID}/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resource {
    Status,
    EncKeys,
    DecKeys,
}

impl Resource {
    fn as_str(self) -> &'static str {
        match self {
            Resource::Status => "status",
            Resource::EncKeys => "enc_keys",
            Resource::DecKeys => "dec_keys",
        }
    }
}

/// An open, authenticated channel to one KME
pub struct Session<T: KmeTransport = HttpsTransport> {
    transport: T,
    api_prefix: String,
    default_target_sae_id: Option<String>,
    poisoned: bool,
    closed: bool,
    requests_sent: u64,
}

impl Session<HttpsTransport> {
    /// Open a session over mutually-authenticated TLS
    ///
    /// The certificate/key pair is checked locally first. With
    /// `verify_on_open` set, one request is made so that an unreachable KME or
    /// a failed handshake is reported here rather than by the first operation.
    /// On error no session exists.
    pub fn open(config: &SessionConfig) -> KmeResult<Self> {
        config.validate()?;
        let credentials = Credentials::load(&config.cert_path, &config.key_path, &config.ca_path)?;
        let mut transport = HttpsTransport::connect(config, &credentials)?;

        let api_prefix = normalize_prefix(&config.api_prefix);
        if config.verify_on_open {
            let probe_path = match &config.default_target_sae_id {
                Some(target) => resource_path(&api_prefix, target, Resource::Status)?,
                None => format!("{}/", api_prefix),
            };
            transport.probe(&probe_path)?;
        }

        info!("Opened KME session to {}", config.endpoint());

        let mut session = Session::with_transport(transport).with_api_prefix(api_prefix);
        session.default_target_sae_id = config.default_target_sae_id.clone();
        Ok(session)
    }
}

impl<T: KmeTransport> Session<T> {
    /// Wrap an already-established transport
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            default_target_sae_id: None,
            poisoned: false,
            closed: false,
            requests_sent: 0,
        }
    }

    pub fn with_default_target(mut self, sae_id: impl Into<String>) -> Self {
        self.default_target_sae_id = Some(sae_id.into());
        self
    }

    pub fn with_api_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.api_prefix = normalize_prefix(prefix.as_ref());
        self
    }

    pub fn default_target_sae_id(&self) -> Option<&str> {
        self.default_target_sae_id.as_deref()
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Number of requests handed to the transport so far
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    /// False once a request has timed out
    pub fn is_usable(&self) -> bool {
        !self.poisoned && !self.closed
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Release the connection to the KME
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.close();
            info!(
                "Closed KME session to {} after {} request(s)",
                self.transport.endpoint(),
                self.requests_sent
            );
        }
    }

    /// The explicit target, or the session default
    pub(crate) fn resolve_target(&self, explicit: Option<&str>) -> KmeResult<String> {
        explicit
            .or(self.default_target_sae_id.as_deref())
            .map(str::to_string)
            .ok_or_else(|| {
                KmeError::invalid_argument(
                    "target_sae_id",
                    "an SAE ID or a session default target",
                    "none",
                )
            })
    }

    /// Issue one request against `{api_prefix}/{sae_id}/{resource}`
    pub(crate) fn send(
        &mut self,
        operation: &str,
        sae_id: &str,
        resource: Resource,
        body: Option<String>,
    ) -> KmeResult<KmeResponse> {
        if self.closed || self.poisoned {
            return Err(KmeError::transport(
                operation,
                "session is unusable after an earlier timeout or close; open a new session",
                error_codes::SESSION_UNUSABLE,
            ));
        }

        let path = resource_path(&self.api_prefix, sae_id, resource)?;
        let request = match body {
            Some(body) => KmeRequest::post(path, body),
            None => KmeRequest::get(path),
        };

        self.requests_sent += 1;
        debug!("{} {} ({})", request.method, request.path, operation);

        match self.transport.execute(&request) {
            Ok(response) => {
                debug!("{} {} -> HTTP {}", request.method, request.path, response.status);
                Ok(response)
            }
            Err(e) => {
                if e.is_timeout() {
                    self.poisoned = true;
                    warn!(
                        "{} timed out against {}; session is no longer usable",
                        operation,
                        self.transport.endpoint()
                    );
                }
                Err(e)
            }
        }
    }
}

impl<T: KmeTransport> Drop for Session<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: KmeTransport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.transport.endpoint())
            .field("api_prefix", &self.api_prefix)
            .field("default_target_sae_id", &self.default_target_sae_id)
            .field("usable", &self.is_usable())
            .field("requests_sent", &self.requests_sent)
            .finish()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

/// SAE IDs become a path segment and must not alter the request path
pub(crate) fn validate_sae_id(parameter: &str, sae_id: &str) -> KmeResult<()> {
    if sae_id.is_empty() {
        return Err(KmeError::invalid_argument(parameter, "a non-empty SAE ID", "empty string"));
    }
    if sae_id
        .chars()
        .any(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace() || c.is_control())
    {
        return Err(KmeError::invalid_argument(
            parameter,
            "an SAE ID without '/', '?', '#', '%' or whitespace",
            sae_id,
        ));
    }
    Ok(())
}

fn resource_path(api_prefix: &str, sae_id: &str, resource: Resource) -> KmeResult<String> {
    validate_sae_id("sae_id", sae_id)?;
    Ok(format!("{}/{}/{}", api_prefix, sae_id, resource.as_str()))
}
