//! Certificate trust settings handed to the engine.
//!
//! This module provides:
//! - Validation of PEM trusted roots before they replace the engine's store
//! - SPKI SHA-256 pin parsing, formatting and computation

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

/// Prefix of pins in the `sha256/<base64>` notation.
const PIN_PREFIX: &str = "sha256/";

/// Error type for TLS settings.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid public key pin: {0}")]
    InvalidPin(String),
}

/// Result type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Parses PEM-encoded certificates into DER format.
fn parse_cert_pem(pem: &str) -> TlsResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(
            "no certificates found in PEM".to_string(),
        ));
    }
    Ok(certs)
}

/// Checks that `pem` holds at least one usable trust anchor.
///
/// Returns the number of anchors. Any certificate that cannot serve as a
/// trust anchor fails the whole set.
pub fn validate_trusted_roots(pem: &str) -> TlsResult<usize> {
    let certs = parse_cert_pem(pem)?;
    let total = certs.len();
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs);
    if ignored > 0 {
        return Err(TlsError::InvalidCertificate(format!(
            "{} of {} certificates are not valid trust anchors",
            ignored, total
        )));
    }
    Ok(added)
}

/// Reads and validates a PEM file of trusted roots.
pub fn load_trusted_roots(path: &Path) -> TlsResult<String> {
    let pem = fs::read_to_string(path)?;
    validate_trusted_roots(&pem)?;
    Ok(pem)
}

/// Computes the pin of a DER-encoded SubjectPublicKeyInfo.
pub fn compute_public_key_pin(spki_der: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(spki_der);
    hasher.finalize().into()
}

/// Parses a public key pin.
///
/// Accepted forms (hex is case-insensitive):
/// - `sha256/<base64>`
/// - Colon-separated hex: `aa:bb:cc:...` (95 characters)
/// - Continuous hex: `aabbcc...` (64 characters)
pub fn parse_public_key_pin(s: &str) -> TlsResult<[u8; 32]> {
    let s = s.trim();

    if let Some(encoded) = s.strip_prefix(PIN_PREFIX) {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| TlsError::InvalidPin(format!("invalid base64: {}", e)))?;
        return decoded.try_into().map_err(|bytes: Vec<u8>| {
            TlsError::InvalidPin(format!("pin must be 32 bytes, got {}", bytes.len()))
        });
    }

    let hex_str = if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 32 || parts.iter().any(|part| part.len() != 2) {
            return Err(TlsError::InvalidPin(format!(
                "expected 32 colon-separated bytes, got '{}'",
                s
            )));
        }
        parts.concat()
    } else {
        if s.len() != 64 {
            return Err(TlsError::InvalidPin(format!(
                "hex pin must be 64 characters, got {}",
                s.len()
            )));
        }
        s.to_string()
    };

    let mut result = [0u8; 32];
    for (i, chunk) in hex_str.as_bytes().chunks(2).enumerate() {
        let hex_pair = std::str::from_utf8(chunk)
            .map_err(|_| TlsError::InvalidPin("invalid UTF-8 in pin".to_string()))?;
        result[i] = u8::from_str_radix(hex_pair, 16)
            .map_err(|_| TlsError::InvalidPin(format!("invalid hex in pin: {}", hex_pair)))?;
    }
    Ok(result)
}

/// Formats a pin as `sha256/<base64>`.
pub fn format_public_key_pin(pin: &[u8; 32]) -> String {
    format!("{}{}", PIN_PREFIX, STANDARD.encode(pin))
}
