//! Mutually-authenticated HTTPS transport
//!
//! Built on a blocking `reqwest` client with rustls. Only the configured CA
//! certificates are trusted; the public web PKI roots are disabled.

use std::error::Error as StdError;

use log::debug;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use url::Url;
use zeroize::Zeroizing;

use super::{Credentials, KmeRequest, KmeResponse, KmeTransport, Method};
use crate::config::SessionConfig;
use crate::error::{error_codes, KmeError, KmeResult};

pub struct HttpsTransport {
    client: Option<Client>,
    base_url: Url,
    endpoint: String,
}

impl HttpsTransport {
    /// Build the TLS client for `config`
    ///
    /// No network traffic happens here; see [`HttpsTransport::probe`].
    pub fn connect(config: &SessionConfig, credentials: &Credentials) -> KmeResult<Self> {
        let endpoint = config.endpoint();
        let base_url = base_url(config)?;

        let mut builder = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .https_only(true)
            .identity(credentials.identity()?)
            .timeout(config.timeout())
            .connect_timeout(config.timeout());
        for anchor in credentials.trust_anchors()? {
            builder = builder.add_root_certificate(anchor);
        }

        let client = builder.build().map_err(|e| {
            KmeError::invalid_credentials(
                &format!("cannot build TLS client: {}", describe(&e)),
                error_codes::CREDENTIAL_PARSE_FAILED,
            )
        })?;

        Ok(Self {
            client: Some(client),
            base_url,
            endpoint,
        })
    }

    /// Perform one GET so that connection and handshake failures surface now
    ///
    /// Any HTTP status counts as success: the TLS channel was established.
    pub fn probe(&mut self, path: &str) -> KmeResult<u16> {
        let client = self.client.as_ref().ok_or_else(|| KmeError::ConnectionFailed {
            endpoint: self.endpoint.clone(),
            cause: "transport is closed".to_string(),
        })?;
        let request = KmeRequest::get(path);
        let response = send(client, &self.base_url, &request).map_err(|e| {
            let cause = describe(&e);
            if !e.is_timeout() && is_tls_failure(&e) {
                KmeError::TlsHandshakeFailed {
                    endpoint: self.endpoint.clone(),
                    cause,
                }
            } else {
                KmeError::ConnectionFailed {
                    endpoint: self.endpoint.clone(),
                    cause,
                }
            }
        })?;
        debug!("Probe of {} answered HTTP {}", self.endpoint, response.status);
        Ok(response.status)
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none()
    }
}

impl KmeTransport for HttpsTransport {
    fn execute(&mut self, request: &KmeRequest) -> KmeResult<KmeResponse> {
        let operation = format!("{} {}", request.method, request.path);
        let client = self.client.as_ref().ok_or_else(|| {
            KmeError::transport(&operation, "transport is closed", error_codes::SESSION_UNUSABLE)
        })?;

        send(client, &self.base_url, request).map_err(|e| {
            if e.is_timeout() {
                KmeError::timeout(&operation, &describe(&e))
            } else if e.is_body() || e.is_decode() {
                KmeError::transport(&operation, &describe(&e), error_codes::RESPONSE_READ_FAILED)
            } else {
                KmeError::transport(&operation, &describe(&e), error_codes::TRANSPORT_FAILED)
            }
        })
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn close(&mut self) {
        // Dropping the client closes pooled connections
        self.client = None;
    }
}

fn send(client: &Client, base_url: &Url, request: &KmeRequest) -> Result<KmeResponse, reqwest::Error> {
    let mut url = base_url.clone();
    url.set_path(&request.path);

    let builder = match request.method {
        Method::Get => client.get(url),
        Method::Post => client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone().unwrap_or_default()),
    };
    let response = builder.header(ACCEPT, "application/json").send()?;
    let status = response.status().as_u16();
    let body = Zeroizing::new(response.text()?);

    Ok(KmeResponse { status, body })
}

fn base_url(config: &SessionConfig) -> KmeResult<Url> {
    let invalid = |what: &str| {
        KmeError::config_error(
            &format!("cannot use {} as KME address: {}", config.endpoint(), what),
            error_codes::CONFIG_INVALID,
        )
    };

    let mut url = Url::parse("https://localhost").map_err(|e| invalid(&e.to_string()))?;
    url.set_host(Some(&config.host))
        .map_err(|e| invalid(&e.to_string()))?;
    url.set_port(Some(config.port))
        .map_err(|_| invalid("port rejected"))?;
    Ok(url)
}

/// Flatten an error and its sources into one line
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// Whether a `rustls::Error` sits anywhere in the source chain
///
/// The TLS stack reports handshake and certificate failures as an `io::Error`
/// wrapping the `rustls::Error`, and `io::Error::source` skips the wrapped
/// error itself, so the payload of every `io::Error` is inspected as well.
fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(inner) = current {
        if inner.is::<rustls::Error>() {
            return true;
        }
        if let Some(wrapped) = inner
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::get_ref)
        {
            if is_tls_failure(wrapped) {
                return true;
            }
        }
        current = inner.source();
    }
    false
}
