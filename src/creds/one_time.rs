//! One-time random credentials
//!
//! Generates a random username/password pair at construction for
//! single-session RDP use. Bytes are drawn from the printable ASCII range
//! 33..=126; `#` and `:` are masked to `_` in the username so the SAM
//! account database tolerates it. Only the RDP kind is implemented;
//! `clear` is a no-op.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use super::{Credentials, CredentialsError, CredentialsKind, CredentialsValue, Result};

const CREDENTIAL_LEN: usize = 16;

fn generate_random_printable(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range(33u8..=126) as char).collect()
}

fn generate_random_username(len: usize) -> String {
    generate_random_printable(len)
        .chars()
        .map(|c| if c == '#' || c == ':' { '_' } else { c })
        .collect()
}

/// Random single-session RDP credentials
pub struct OneTimeCredentials {
    rdp: Mutex<(String, String)>,
}

impl OneTimeCredentials {
    /// Generate a fresh pair
    pub fn new() -> Self {
        Self {
            rdp: Mutex::new((
                generate_random_username(CREDENTIAL_LEN),
                generate_random_printable(CREDENTIAL_LEN),
            )),
        }
    }
}

impl Default for OneTimeCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Credentials for OneTimeCredentials {
    async fn store(&self, value: CredentialsValue) -> Result<()> {
        match value {
            CredentialsValue::Rdp { ref username, ref password } => {
                *self.rdp.lock() = (username.clone(), password.clone());
                Ok(())
            }
            CredentialsValue::Vnc { .. } => Err(CredentialsError::UnsupportedKind),
        }
    }

    async fn lookup(&self, kind: CredentialsKind) -> Result<CredentialsValue> {
        match kind {
            CredentialsKind::Rdp => {
                let (username, password) = self.rdp.lock().clone();
                Ok(CredentialsValue::Rdp { username, password })
            }
            CredentialsKind::Vnc => Err(CredentialsError::NotFound),
        }
    }

    async fn clear(&self, _kind: CredentialsKind) -> Result<()> {
        Ok(())
    }
}
