//! SAM exchange file
//!
//! NTLM authentication reads the account database from a SAM-format file.
//! The server materializes a single-entry database in the user runtime
//! directory, carrying the NT hash of the configured password; the file
//! lives exactly as long as the session and is unlinked on drop.
//!
//! Line format: `<username>::::<32-hex-NT-hash>:::`

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use md4::{Digest, Md4};
use rand::Rng;
use thiserror::Error;
use tracing::warn;

/// Errors produced while creating the SAM file
#[derive(Debug, Error)]
pub enum SamError {
    /// Runtime directory could not be created or written
    #[error("Failed to create SAM file: {0}")]
    Io(#[from] std::io::Error),

    /// No user runtime directory is available
    #[error("No runtime directory available")]
    NoRuntimeDir,
}

/// Result type for SAM operations
pub type Result<T> = std::result::Result<T, SamError>;

/// NT hash: MD4 over the UTF-16LE encoding of the password
fn nt_hash(password: &str) -> [u8; 16] {
    let mut hasher = Md4::new();
    for unit in password.encode_utf16() {
        hasher.update(unit.to_le_bytes());
    }
    hasher.finalize().into()
}

fn sam_line(username: &str, password: &str) -> String {
    let hash = nt_hash(password);
    let mut line = String::with_capacity(username.len() + 3 + 32 + 4);
    line.push_str(username);
    line.push_str(":::");
    for byte in hash {
        write!(&mut line, "{byte:02x}").expect("writing to a String cannot fail");
    }
    line.push_str(":::\n");
    line
}

/// A temporary single-entry SAM database
pub struct SamFile {
    path: PathBuf,
}

impl SamFile {
    /// Write a SAM file for one credential pair
    pub fn create(username: &str, password: &str) -> Result<Self> {
        let runtime_dir = dirs::runtime_dir().ok_or(SamError::NoRuntimeDir)?;
        let sam_dir = runtime_dir.join("boreal-remote-desktop");

        if !sam_dir.exists() {
            fs::create_dir(&sam_dir)?;
            fs::set_permissions(&sam_dir, fs::Permissions::from_mode(0o700))?;
        }

        // mkstemp-style unique name; O_EXCL catches collisions
        let path = loop {
            let suffix: String = rand::thread_rng()
                .sample_iter(rand::distributions::Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();
            let candidate = sam_dir.join(format!("rdp-sam-{suffix}"));
            if !candidate.exists() {
                break candidate;
            }
        };

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(sam_line(username, password).as_bytes())?;

        Ok(Self { path })
    }

    /// Path of the database file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for SamFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to unlink SAM file: {e}");
        }
    }
}
