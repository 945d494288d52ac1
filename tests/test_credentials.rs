//! Integration tests for opening sessions over HTTPS
//!
//! These only exercise failures that can be produced without a KME: local
//! credential checks and an unreachable endpoint.

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use qkd014_client::error::error_codes;
use qkd014_client::prelude::*;
use qkd014_client::transport::Credentials;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn config(port: u16, cert: &str, key: &str) -> SessionConfig {
    SessionConfig::new("127.0.0.1", port, fixture(cert), fixture(key), fixture("ca.crt"))
        .with_timeout(Duration::from_secs(2))
}

/// A local port with nothing listening on it
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let port = listener.local_addr().expect("Failed to read address").port();
    drop(listener);
    port
}

#[test]
fn test_mismatched_pair_yields_no_session() {
    let result = Session::open(&config(closed_port(), "sae-a.crt", "sae-b.key"));
    let err = result.expect_err("Session must not open with a foreign key");
    assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
    assert_eq!(err.error_code(), error_codes::CREDENTIAL_PAIR_MISMATCH);
    assert!(err.suggested_remediation().is_some());
}

#[test]
fn test_missing_key_file() {
    let err = Session::open(&config(closed_port(), "sae-a.crt", "absent.key")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
    assert_eq!(err.error_code(), error_codes::CREDENTIAL_READ_FAILED);
}

#[test]
fn test_matching_pairs_load() {
    for (cert, key) in [("sae-a.crt", "sae-a.key"), ("sae-b.crt", "sae-b.key"), ("sae-c.crt", "sae-c.key")] {
        let credentials = Credentials::load(&fixture(cert), &fixture(key), &fixture("ca.crt"))
            .expect("Failed to load matching credentials");
        assert_eq!(credentials.trust_anchor_count(), 1);
    }
}

#[test]
fn test_unreachable_kme() {
    let err = Session::open(&config(closed_port(), "sae-a.crt", "sae-a.key")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert!(err.message().contains("127.0.0.1"));
}

#[test]
fn test_refused_connection_is_not_a_handshake_failure() {
    for target in ["tls-gateway", "certificate-handshake-alert"] {
        let config = config(closed_port(), "sae-a.crt", "sae-a.key").with_default_target(target);
        let err = Session::open(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed, "target {}", target);
    }
}

#[test]
fn test_open_without_verification_defers_network() {
    let config = config(closed_port(), "sae-c.crt", "sae-c.key")
        .with_verify_on_open(false)
        .with_default_target("sae-b");
    let mut session = Session::open(&config).expect("Failed to open unverified session");
    assert!(session.is_usable());

    let err = session.get_default_status().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportError);
    session.close();
}

#[test]
fn test_invalid_config_is_rejected_before_io() {
    let config = config(0, "sae-a.crt", "sae-a.key");
    let err = Session::open(&config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
}
