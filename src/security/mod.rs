//! TLS certificate handling
//!
//! Loads the configured PEM certificate and key. A path that is absent or
//! not a regular file is ignored silently; the caller decides the
//! fallback, typically a generated self-signed pair for first-run
//! setups.

use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use tracing::debug;

/// Errors produced while preparing TLS material
#[derive(Debug, Error)]
pub enum SecurityError {
    /// A present certificate or key file could not be parsed
    #[error("Invalid PEM material: {0}")]
    InvalidPem(String),

    /// Generating a self-signed pair failed
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    /// Filesystem access failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for security operations
pub type Result<T> = std::result::Result<T, SecurityError>;

/// TLS material ready for the transport
pub struct TlsMaterial {
    /// DER certificate chain
    pub certificates: Vec<Vec<u8>>,
    /// DER PKCS#8 private key
    pub private_key: Vec<u8>,
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Load the configured certificate/key pair
///
/// Returns `None` (without logging an error) when either path is unset,
/// absent, or not a regular file.
pub fn load_configured_material(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<Option<TlsMaterial>> {
    let (Some(cert_path), Some(key_path)) = (cert_path, key_path) else {
        return Ok(None);
    };
    if !is_regular_file(cert_path) || !is_regular_file(key_path) {
        debug!("Configured TLS material is not usable; ignoring the setting");
        return Ok(None);
    }

    let cert_pem = std::fs::read(cert_path)?;
    let certificates = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SecurityError::InvalidPem(format!("certificate: {e}")))?
        .into_iter()
        .map(|der| der.as_ref().to_vec())
        .collect::<Vec<_>>();
    if certificates.is_empty() {
        return Err(SecurityError::InvalidPem("no certificate in file".into()));
    }

    let key_pem = std::fs::read(key_path)?;
    let private_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| SecurityError::InvalidPem(format!("private key: {e}")))?
        .ok_or_else(|| SecurityError::InvalidPem("no private key in file".into()))?
        .secret_der()
        .to_vec();

    Ok(Some(TlsMaterial {
        certificates,
        private_key,
    }))
}

/// Generate a self-signed pair for `common_name`
pub fn generate_self_signed(common_name: &str) -> Result<TlsMaterial> {
    let mut params = CertificateParams::new(vec![common_name.to_owned()]);
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name = distinguished_name;

    let key_pair =
        KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|e| SecurityError::GenerationFailed(e.to_string()))?;
    params.key_pair = Some(key_pair);

    let certificate = rcgen::Certificate::from_params(params)
        .map_err(|e| SecurityError::GenerationFailed(e.to_string()))?;

    let cert_der = certificate
        .serialize_der()
        .map_err(|e| SecurityError::GenerationFailed(e.to_string()))?;
    let key_der = certificate.serialize_private_key_der();

    Ok(TlsMaterial {
        certificates: vec![cert_der],
        private_key: key_der,
    })
}
