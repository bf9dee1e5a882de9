//! Credential storage
//!
//! One polymorphic interface over four storage variants:
//!
//! - [`file::FileCredentials`]: per-user configuration file
//! - [`secret_service::SecretServiceCredentials`]: platform secret store
//! - [`tpm::TpmCredentials`]: TPM-2.0-sealed files bound to PCRs 0..3
//! - [`one_time::OneTimeCredentials`]: random single-session pair
//!
//! Values are tagged by [`CredentialsKind`]; the serialized form is a
//! printable tagged-value text shared by all file-backed variants. A
//! missing credential surfaces as [`CredentialsError::NotFound`] with no
//! logging; the variants never fall back to a less-protected store.

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroize;

pub mod file;
pub mod one_time;
pub mod secret_service;
pub mod tpm;

pub use file::FileCredentials;
pub use one_time::OneTimeCredentials;
pub use secret_service::SecretServiceCredentials;
pub use tpm::TpmCredentials;

/// Errors produced by credential stores
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// No credential of the requested kind is stored
    #[error("Credentials not found")]
    NotFound,

    /// The requested kind is not supported by this variant
    #[error("Credentials kind not supported by this store")]
    UnsupportedKind,

    /// The stored value could not be parsed
    #[error("Malformed stored credentials: {0}")]
    Malformed(String),

    /// The underlying store failed
    #[error("Credential store failure: {0}")]
    Backend(String),

    /// Filesystem access failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for credential operations
pub type Result<T> = std::result::Result<T, CredentialsError>;

/// Credential namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialsKind {
    /// RDP username/password pair
    Rdp,
    /// VNC view password
    Vnc,
}

impl CredentialsKind {
    /// Group name used in file-backed stores
    pub fn group_name(self) -> &'static str {
        match self {
            Self::Rdp => "RDP",
            Self::Vnc => "VNC",
        }
    }
}

/// A tagged credential value
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialsValue {
    /// RDP account
    Rdp {
        /// Account name offered to the peer
        username: String,
        /// Account password
        password: String,
    },
    /// VNC view password
    Vnc {
        /// Session password
        password: String,
    },
}

impl CredentialsValue {
    /// Kind this value belongs to
    pub fn kind(&self) -> CredentialsKind {
        match self {
            Self::Rdp { .. } => CredentialsKind::Rdp,
            Self::Vnc { .. } => CredentialsKind::Vnc,
        }
    }
}

impl std::fmt::Debug for CredentialsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print secret material
        match self {
            Self::Rdp { username, .. } => f
                .debug_struct("Rdp")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Vnc { .. } => f.debug_struct("Vnc").finish_non_exhaustive(),
        }
    }
}

impl Drop for CredentialsValue {
    fn drop(&mut self) {
        match self {
            Self::Rdp { username, password } => {
                username.zeroize();
                password.zeroize();
            }
            Self::Vnc { password } => password.zeroize(),
        }
    }
}

/// Polymorphic credential store
#[async_trait]
pub trait Credentials: Send + Sync {
    /// Persist `value` under its kind, replacing any previous value
    async fn store(&self, value: CredentialsValue) -> Result<()>;

    /// Retrieve the stored value of `kind`
    ///
    /// Fails with [`CredentialsError::NotFound`] when nothing is stored.
    async fn lookup(&self, kind: CredentialsKind) -> Result<CredentialsValue>;

    /// Remove the stored value of `kind`; removing nothing is not an error
    async fn clear(&self, kind: CredentialsKind) -> Result<()>;
}

// =============================================================================
// Printable tagged-value text
// =============================================================================

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Serialize a value into its printable tagged text
///
/// RDP pairs print as a string mapping, VNC passwords as a plain quoted
/// string; the format round-trips through [`parse_tagged_text`].
pub fn to_tagged_text(value: &CredentialsValue) -> String {
    match value {
        CredentialsValue::Rdp { username, password } => format!(
            "{{'username': <'{}'>, 'password': <'{}'>}}",
            escape(username),
            escape(password)
        ),
        CredentialsValue::Vnc { password } => format!("'{}'", escape(password)),
    }
}

fn parse_quoted(input: &str) -> Option<(String, &str)> {
    let rest = input.strip_prefix('\'')?;
    let mut end = None;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '\'' {
            end = Some(i);
            break;
        }
    }
    let end = end?;
    Some((unescape(&rest[..end]), &rest[end + 1..]))
}

/// Parse a printable tagged text back into a value
pub fn parse_tagged_text(kind: CredentialsKind, text: &str) -> Result<CredentialsValue> {
    let malformed = || CredentialsError::Malformed(format!("unparsable {} credentials", kind.group_name()));

    match kind {
        CredentialsKind::Vnc => {
            let (password, rest) = parse_quoted(text.trim()).ok_or_else(malformed)?;
            if !rest.trim().is_empty() {
                return Err(malformed());
            }
            Ok(CredentialsValue::Vnc { password })
        }
        CredentialsKind::Rdp => {
            let inner = text
                .trim()
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(malformed)?;

            let mut username = None;
            let mut password = None;
            let mut rest = inner.trim();
            while !rest.is_empty() {
                let (key, after_key) = parse_quoted(rest).ok_or_else(malformed)?;
                let after_colon = after_key.trim_start().strip_prefix(':').ok_or_else(malformed)?;
                let in_variant = after_colon.trim_start().strip_prefix('<').ok_or_else(malformed)?;
                let (value, after_value) = parse_quoted(in_variant.trim_start()).ok_or_else(malformed)?;
                let after_variant = after_value.trim_start().strip_prefix('>').ok_or_else(malformed)?;

                match key.as_str() {
                    "username" => username = Some(value),
                    "password" => password = Some(value),
                    _ => return Err(malformed()),
                }

                rest = after_variant.trim_start();
                rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
            }

            Ok(CredentialsValue::Rdp {
                username: username.ok_or_else(malformed)?,
                password: password.ok_or_else(malformed)?,
            })
        }
    }
}
