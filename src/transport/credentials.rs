//! Local SAE identity and KME trust anchors
//!
//! A session is bound to exactly one certificate/private-key pair. The pair is
//! checked before any connection attempt: the public key derived from the
//! PKCS#8 private key must be the one certified by the leaf certificate.

use std::fmt;
use std::fs;
use std::path::Path;

use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair};
use zeroize::Zeroizing;

use crate::error::{error_codes, KmeError, KmeResult};

const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const PKCS8_LABEL: &str = "PRIVATE KEY";

struct PemBlock {
    label: String,
    der: Zeroizing<Vec<u8>>,
}

/// Verified client identity plus the CA certificates trusted for the KME
pub struct Credentials {
    identity_pem: Zeroizing<Vec<u8>>,
    ca_ders: Vec<Vec<u8>>,
}

impl Credentials {
    /// Read and check PEM files from disk
    pub fn load(cert_path: &Path, key_path: &Path, ca_path: &Path) -> KmeResult<Self> {
        let cert_pem = read_pem_file(cert_path, "certificate")?;
        let key_pem = read_pem_file(key_path, "private key")?;
        let ca_pem = read_pem_file(ca_path, "trusted CA")?;
        Self::from_pem(&cert_pem, &key_pem, &ca_pem)
    }

    /// Check in-memory PEM material
    ///
    /// `cert_pem` holds the leaf certificate first, optionally followed by
    /// intermediates. `key_pem` must be an unencrypted PKCS#8 key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> KmeResult<Self> {
        let certificates: Vec<PemBlock> = pem_blocks(cert_pem, "certificate")?
            .into_iter()
            .filter(|block| block.label == CERTIFICATE_LABEL)
            .collect();
        let leaf = certificates.first().ok_or_else(|| {
            KmeError::invalid_credentials(
                "certificate file contains no CERTIFICATE block",
                error_codes::CREDENTIAL_PARSE_FAILED,
            )
        })?;

        let key = private_key_block(key_pem)?;
        let public_key = pkcs8_public_key(&key.der).ok_or_else(|| {
            KmeError::invalid_credentials(
                "private key is not a supported Ed25519, ECDSA P-256/P-384 or RSA PKCS#8 key",
                error_codes::UNSUPPORTED_KEY_TYPE,
            )
        })?;
        if !contains(&leaf.der, &public_key) {
            return Err(KmeError::invalid_credentials(
                "private key does not match the public key of the certificate",
                error_codes::CREDENTIAL_PAIR_MISMATCH,
            ));
        }

        let ca_ders: Vec<Vec<u8>> = pem_blocks(ca_pem, "trusted CA")?
            .into_iter()
            .filter(|block| block.label == CERTIFICATE_LABEL)
            .map(|block| block.der.to_vec())
            .collect();
        if ca_ders.is_empty() {
            return Err(KmeError::invalid_credentials(
                "trusted CA file contains no CERTIFICATE block",
                error_codes::CREDENTIAL_PARSE_FAILED,
            ));
        }

        let mut identity_pem = Zeroizing::new(Vec::with_capacity(key_pem.len() + cert_pem.len() + 1));
        identity_pem.extend_from_slice(key_pem);
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(cert_pem);

        Ok(Self {
            identity_pem,
            ca_ders,
        })
    }

    /// Number of trusted CA certificates
    pub fn trust_anchor_count(&self) -> usize {
        self.ca_ders.len()
    }

    pub(crate) fn identity(&self) -> KmeResult<reqwest::Identity> {
        reqwest::Identity::from_pem(&self.identity_pem).map_err(|e| {
            KmeError::invalid_credentials(
                &format!("TLS stack rejected the client identity: {}", e),
                error_codes::CREDENTIAL_PARSE_FAILED,
            )
        })
    }

    pub(crate) fn trust_anchors(&self) -> KmeResult<Vec<reqwest::Certificate>> {
        self.ca_ders
            .iter()
            .map(|der| {
                reqwest::Certificate::from_der(der).map_err(|e| {
                    KmeError::invalid_credentials(
                        &format!("TLS stack rejected a trusted CA certificate: {}", e),
                        error_codes::CREDENTIAL_PARSE_FAILED,
                    )
                })
            })
            .collect()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("trust_anchors", &self.ca_ders.len())
            .finish_non_exhaustive()
    }
}

fn read_pem_file(path: &Path, what: &str) -> KmeResult<Zeroizing<Vec<u8>>> {
    fs::read(path).map(Zeroizing::new).map_err(|e| {
        KmeError::invalid_credentials(
            &format!("cannot read {} {}: {}", what, path.display(), e),
            error_codes::CREDENTIAL_READ_FAILED,
        )
    })
}

fn private_key_block(key_pem: &[u8]) -> KmeResult<PemBlock> {
    let mut blocks = pem_blocks(key_pem, "private key")?;
    if let Some(index) = blocks.iter().position(|block| block.label == PKCS8_LABEL) {
        return Ok(blocks.swap_remove(index));
    }

    let found = blocks
        .first()
        .map(|block| block.label.clone())
        .unwrap_or_else(|| "nothing".to_string());
    Err(KmeError::invalid_credentials(
        &format!("expected an unencrypted PKCS#8 PRIVATE KEY block, found {}", found),
        error_codes::UNSUPPORTED_KEY_TYPE,
    ))
}

/// Split PEM text into labelled DER blocks
fn pem_blocks(pem: &[u8], what: &str) -> KmeResult<Vec<PemBlock>> {
    let parse_error = |cause: &str| {
        KmeError::invalid_credentials(
            &format!("malformed {} PEM: {}", what, cause),
            error_codes::CREDENTIAL_PARSE_FAILED,
        )
    };

    let text = std::str::from_utf8(pem).map_err(|_| parse_error("not UTF-8"))?;
    let mut blocks = Vec::new();
    let mut current: Option<(String, Zeroizing<String>)> = None;

    for line in text.lines().map(str::trim) {
        if let Some(label) = line
            .strip_prefix("-----BEGIN ")
            .and_then(|rest| rest.strip_suffix("-----"))
        {
            if current.is_some() {
                return Err(parse_error("nested BEGIN line"));
            }
            current = Some((label.to_string(), Zeroizing::new(String::new())));
        } else if let Some(label) = line
            .strip_prefix("-----END ")
            .and_then(|rest| rest.strip_suffix("-----"))
        {
            let (begin_label, body) = current.take().ok_or_else(|| parse_error("END without BEGIN"))?;
            if begin_label != label {
                return Err(parse_error("BEGIN and END labels differ"));
            }
            let der = base64::decode(body.as_bytes())
                .map(Zeroizing::new)
                .map_err(|e| parse_error(&e.to_string()))?;
            blocks.push(PemBlock {
                label: begin_label,
                der,
            });
        } else if let Some((_, body)) = current.as_mut() {
            // Skip RFC 1421 headers such as Proc-Type
            if !line.contains(':') {
                body.push_str(line);
            }
        }
    }

    if current.is_some() {
        return Err(parse_error("missing END line"));
    }
    if blocks.is_empty() {
        return Err(parse_error("no PEM blocks found"));
    }
    Ok(blocks)
}

/// Public key bytes as they appear in a certificate's SubjectPublicKeyInfo
fn pkcs8_public_key(der: &[u8]) -> Option<Vec<u8>> {
    if let Ok(pair) = Ed25519KeyPair::from_pkcs8_maybe_unchecked(der) {
        return Some(pair.public_key().as_ref().to_vec());
    }

    let rng = ring::rand::SystemRandom::new();
    for algorithm in [
        &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
        &signature::ECDSA_P384_SHA384_ASN1_SIGNING,
    ] {
        if let Ok(pair) = EcdsaKeyPair::from_pkcs8(algorithm, der, &rng) {
            return Some(pair.public_key().as_ref().to_vec());
        }
    }

    if let Ok(pair) = RsaKeyPair::from_pkcs8(der) {
        return Some(pair.public_key().as_ref().to_vec());
    }

    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const SAE_A_CERT: &[u8] = include_bytes!("../../tests/fixtures/sae-a.crt");
    const SAE_A_KEY: &[u8] = include_bytes!("../../tests/fixtures/sae-a.key");
    const SAE_B_KEY: &[u8] = include_bytes!("../../tests/fixtures/sae-b.key");
    const SAE_C_CERT: &[u8] = include_bytes!("../../tests/fixtures/sae-c.crt");
    const SAE_C_KEY: &[u8] = include_bytes!("../../tests/fixtures/sae-c.key");
    const CA_CERT: &[u8] = include_bytes!("../../tests/fixtures/ca.crt");

    #[test]
    fn test_matching_ed25519_pair() {
        let credentials = Credentials::from_pem(SAE_A_CERT, SAE_A_KEY, CA_CERT).unwrap();
        assert_eq!(credentials.trust_anchor_count(), 1);
    }

    #[test]
    fn test_matching_p256_pair() {
        assert!(Credentials::from_pem(SAE_C_CERT, SAE_C_KEY, CA_CERT).is_ok());
    }

    #[test]
    fn test_mismatched_pair() {
        let err = Credentials::from_pem(SAE_A_CERT, SAE_B_KEY, CA_CERT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
        assert_eq!(err.error_code(), error_codes::CREDENTIAL_PAIR_MISMATCH);

        let err = Credentials::from_pem(SAE_C_CERT, SAE_A_KEY, CA_CERT).unwrap_err();
        assert_eq!(err.error_code(), error_codes::CREDENTIAL_PAIR_MISMATCH);
    }

    #[test]
    fn test_certificate_where_key_expected() {
        let err = Credentials::from_pem(SAE_A_CERT, SAE_A_CERT, CA_CERT).unwrap_err();
        assert_eq!(err.error_code(), error_codes::UNSUPPORTED_KEY_TYPE);
    }

    #[test]
    fn test_ca_without_certificate() {
        let err = Credentials::from_pem(SAE_A_CERT, SAE_A_KEY, SAE_A_KEY).unwrap_err();
        assert_eq!(err.error_code(), error_codes::CREDENTIAL_PARSE_FAILED);
    }

    #[test]
    fn test_pem_parsing() {
        let pem = b"-----BEGIN TEST-----\nAQID\n-----END TEST-----\n";
        let blocks = pem_blocks(pem, "test").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label, "TEST");
        assert_eq!(&blocks[0].der[..], &[1, 2, 3]);

        assert!(pem_blocks(b"-----BEGIN A-----\nAQID\n-----END B-----\n", "test").is_err());
        assert!(pem_blocks(b"-----BEGIN A-----\nAQID\n", "test").is_err());
        assert!(pem_blocks(b"plain text", "test").is_err());
    }

    #[test]
    fn test_contains() {
        assert!(contains(&[1, 2, 3, 4], &[2, 3]));
        assert!(!contains(&[1, 2, 3, 4], &[3, 2]));
        assert!(!contains(&[1, 2], &[]));
    }
}
