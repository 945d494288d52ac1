/*!
 * Transport to a KME
 *
 * The protocol layer talks to the KME through the [`KmeTransport`] trait: one
 * synchronous request in, one response out. [`HttpsTransport`] implements it
 * over a mutually-authenticated TLS channel; tests substitute in-memory KMEs.
 */

pub mod credentials;
pub mod https;

use std::fmt;

use zeroize::Zeroizing;

use crate::error::KmeResult;

pub use credentials::Credentials;
pub use https::HttpsTransport;

/// HTTP method of a KME request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

/// One request to the KME
///
/// Request bodies carry sizes, counts and key identifiers, never key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmeRequest {
    pub method: Method,
    /// Absolute path, e.g. `/api/v1/keys/sae-b/enc_keys`
    pub path: String,
    /// JSON body for POST requests
    pub body: Option<String>,
}

impl KmeRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body.into()),
        }
    }
}

/// Raw response from the KME
///
/// The body may contain base64-encoded key material and is zeroed on drop.
pub struct KmeResponse {
    pub status: u16,
    pub body: Zeroizing<String>,
}

impl KmeResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: Zeroizing::new(body.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Debug for KmeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmeResponse")
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A synchronous request/response channel to one KME
///
/// Implementations report connection-level faults as `TransportError`
/// (flagging timeouts via [`KmeError::timeout`](crate::error::KmeError::timeout))
/// and return every HTTP status, successful or not, as a [`KmeResponse`].
pub trait KmeTransport {
    fn execute(&mut self, request: &KmeRequest) -> KmeResult<KmeResponse>;

    /// `host:port` of the KME, for messages
    fn endpoint(&self) -> &str;

    /// Tear down the underlying connection
    fn close(&mut self) {}
}

impl<T: KmeTransport + ?Sized> KmeTransport for Box<T> {
    fn execute(&mut self, request: &KmeRequest) -> KmeResult<KmeResponse> {
        (**self).execute(request)
    }

    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
