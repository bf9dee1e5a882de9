//! TPM-sealed credential store
//!
//! Seals credentials to the machine's TPM 2.0 with a policy over PCRs
//! 0..3 (SHA-256 bank) via `systemd-creds`. The sealed blobs are written
//! to `rdp-credentials.priv` / `vnc-credentials.priv` under the per-user
//! data directory, mode 0600. When the PCR values changed since sealing,
//! unsealing fails and lookup reports the credentials as not found; the
//! store never degrades to a weaker protection.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;
use zeroize::Zeroizing;

use super::{
    parse_tagged_text, to_tagged_text, Credentials, CredentialsError, CredentialsKind,
    CredentialsValue, Result,
};

const SEALING_PCRS: &str = "0+1+2+3";

fn blob_name(kind: CredentialsKind) -> &'static str {
    match kind {
        CredentialsKind::Rdp => "rdp-credentials.priv",
        CredentialsKind::Vnc => "vnc-credentials.priv",
    }
}

fn credential_name(kind: CredentialsKind) -> &'static str {
    match kind {
        CredentialsKind::Rdp => "boreal-rdp-credentials",
        CredentialsKind::Vnc => "boreal-vnc-credentials",
    }
}

/// TPM-2.0-sealed credential store
pub struct TpmCredentials {
    directory: PathBuf,
}

impl TpmCredentials {
    /// Open the store; fails when no TPM 2.0 is reachable
    pub fn new() -> Result<Self> {
        let directory = dirs::data_dir()
            .ok_or_else(|| CredentialsError::Backend("No user data directory".into()))?
            .join("boreal-remote-desktop");
        Self::with_directory(directory)
    }

    /// Open the store under `directory`
    pub fn with_directory(directory: PathBuf) -> Result<Self> {
        let has_tpm = std::process::Command::new("systemd-creds")
            .arg("has-tpm2")
            .output()
            .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "yes")
            .map_err(|e| CredentialsError::Backend(format!("systemd-creds not available: {e}")))?;
        if !has_tpm {
            return Err(CredentialsError::Backend("TPM 2.0 not available".into()));
        }

        if !directory.exists() {
            fs::create_dir_all(&directory)?;
        }

        Ok(Self { directory })
    }

    fn blob_path(&self, kind: CredentialsKind) -> PathBuf {
        self.directory.join(blob_name(kind))
    }

    fn seal(&self, kind: CredentialsKind, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut child = std::process::Command::new("systemd-creds")
            .arg("encrypt")
            .arg("--with-key=tpm2")
            .arg(format!("--tpm2-pcrs={SEALING_PCRS}"))
            .arg(format!("--name={}", credential_name(kind)))
            .arg("-")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CredentialsError::Backend(format!("systemd-creds spawn failed: {e}")))?;

        child
            .stdin
            .take()
            .expect("stdin is piped")
            .write_all(plaintext)?;

        let output = child
            .wait_with_output()
            .map_err(|e| CredentialsError::Backend(format!("systemd-creds failed: {e}")))?;
        if !output.status.success() {
            return Err(CredentialsError::Backend(format!(
                "Sealing failed with status {}",
                output.status
            )));
        }

        Ok(output.stdout)
    }

    fn unseal(&self, kind: CredentialsKind, blob_path: &PathBuf) -> Result<Zeroizing<Vec<u8>>> {
        let output = std::process::Command::new("systemd-creds")
            .arg("decrypt")
            .arg(format!("--name={}", credential_name(kind)))
            .arg(blob_path)
            .arg("-")
            .stderr(Stdio::null())
            .output()
            .map_err(|e| CredentialsError::Backend(format!("systemd-creds failed: {e}")))?;

        if !output.status.success() {
            // changed PCRs make the unseal fail; surface as not-found so
            // the caller's flow fails instead of degrading
            debug!("Unsealing {} failed (status {})", blob_name(kind), output.status);
            return Err(CredentialsError::NotFound);
        }

        Ok(Zeroizing::new(output.stdout))
    }
}

#[async_trait]
impl Credentials for TpmCredentials {
    async fn store(&self, value: CredentialsValue) -> Result<()> {
        let kind = value.kind();
        let plaintext = Zeroizing::new(to_tagged_text(&value).into_bytes());

        let directory = self.directory.clone();
        let blob_path = self.blob_path(kind);
        let store = Self { directory };

        tokio::task::spawn_blocking(move || {
            let blob = store.seal(kind, &plaintext)?;
            fs::write(&blob_path, blob)?;
            fs::set_permissions(&blob_path, fs::Permissions::from_mode(0o600))?;
            Ok(())
        })
        .await
        .map_err(|e| CredentialsError::Backend(format!("seal task failed: {e}")))?
    }

    async fn lookup(&self, kind: CredentialsKind) -> Result<CredentialsValue> {
        let blob_path = self.blob_path(kind);
        if !blob_path.exists() {
            return Err(CredentialsError::NotFound);
        }

        let store = Self {
            directory: self.directory.clone(),
        };
        let plaintext = tokio::task::spawn_blocking(move || store.unseal(kind, &blob_path))
            .await
            .map_err(|e| CredentialsError::Backend(format!("unseal task failed: {e}")))??;

        let text = String::from_utf8(plaintext.to_vec())
            .map_err(|_| CredentialsError::Malformed("sealed payload is not UTF-8".into()))?;
        parse_tagged_text(kind, &text)
    }

    async fn clear(&self, kind: CredentialsKind) -> Result<()> {
        let blob_path = self.blob_path(kind);
        match fs::remove_file(&blob_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S7: requires /dev/tpmrm0 and a compatible TPM 2.0. Altering any of
    // PCRs 0..3 between store and lookup makes the lookup fail.
    #[tokio::test]
    #[ignore]
    async fn round_trip_against_live_tpm() {
        let dir = tempfile::tempdir().unwrap();
        let store = TpmCredentials::with_directory(dir.path().to_path_buf()).unwrap();

        let value = CredentialsValue::Vnc {
            password: "secret value".into(),
        };
        store.store(value.clone()).await.unwrap();
        assert_eq!(store.lookup(CredentialsKind::Vnc).await.unwrap(), value);

        store.clear(CredentialsKind::Vnc).await.unwrap();
        assert!(matches!(
            store.lookup(CredentialsKind::Vnc).await,
            Err(CredentialsError::NotFound)
        ));
    }
}
