//! File-backed credential store
//!
//! Persists credentials into `credentials.ini` under the per-user data
//! directory, one group per kind, key `credentials` holding the printable
//! tagged-value text. World-unreadable; suitable for headless setups
//! without a secret service.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    parse_tagged_text, to_tagged_text, Credentials, CredentialsError, CredentialsKind,
    CredentialsValue, Result,
};

const CREDENTIALS_KEY: &str = "credentials";

type Groups = BTreeMap<String, BTreeMap<String, String>>;

/// Credential store backed by `credentials.ini`
pub struct FileCredentials {
    path: PathBuf,
    groups: Mutex<Groups>,
}

impl FileCredentials {
    /// Open (or create) the store in the user data directory
    pub fn new() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| CredentialsError::Backend("No user data directory".into()))?
            .join("boreal-remote-desktop");
        Self::with_directory(data_dir)
    }

    /// Open (or create) the store under `directory`
    pub fn with_directory(directory: PathBuf) -> Result<Self> {
        if !directory.exists() {
            fs::create_dir_all(&directory)?;
        }

        let path = directory.join("credentials.ini");
        let groups = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            toml::from_str(&contents)
                .map_err(|e| CredentialsError::Malformed(format!("credentials.ini: {e}")))?
        } else {
            Groups::new()
        };

        Ok(Self {
            path,
            groups: Mutex::new(groups),
        })
    }

    fn save(&self, groups: &Groups) -> Result<()> {
        let serialized = toml::to_string(groups)
            .map_err(|e| CredentialsError::Backend(format!("serialize credentials: {e}")))?;
        fs::write(&self.path, serialized)?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

#[async_trait]
impl Credentials for FileCredentials {
    async fn store(&self, value: CredentialsValue) -> Result<()> {
        let mut groups = self.groups.lock();
        groups
            .entry(value.kind().group_name().to_owned())
            .or_default()
            .insert(CREDENTIALS_KEY.to_owned(), to_tagged_text(&value));
        self.save(&groups)
    }

    async fn lookup(&self, kind: CredentialsKind) -> Result<CredentialsValue> {
        let serialized = {
            let groups = self.groups.lock();
            groups
                .get(kind.group_name())
                .and_then(|group| group.get(CREDENTIALS_KEY))
                .cloned()
        };

        match serialized {
            Some(text) => parse_tagged_text(kind, &text),
            None => Err(CredentialsError::NotFound),
        }
    }

    async fn clear(&self, kind: CredentialsKind) -> Result<()> {
        let mut groups = self.groups.lock();
        let removed = groups
            .get_mut(kind.group_name())
            .and_then(|group| group.remove(CREDENTIALS_KEY))
            .is_some();

        if removed {
            self.save(&groups)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in_tempdir() -> (FileCredentials, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentials::with_directory(dir.path().to_path_buf()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn store_lookup_round_trip() {
        let (store, _dir) = store_in_tempdir();

        let value = CredentialsValue::Rdp {
            username: "alice".into(),
            password: "secret".into(),
        };
        store.store(value.clone()).await.unwrap();
        assert_eq!(store.lookup(CredentialsKind::Rdp).await.unwrap(), value);

        // kinds are independent
        assert!(matches!(
            store.lookup(CredentialsKind::Vnc).await,
            Err(CredentialsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn clear_makes_lookup_not_found() {
        let (store, _dir) = store_in_tempdir();

        store
            .store(CredentialsValue::Vnc { password: "pw".into() })
            .await
            .unwrap();
        store.clear(CredentialsKind::Vnc).await.unwrap();
        assert!(matches!(
            store.lookup(CredentialsKind::Vnc).await,
            Err(CredentialsError::NotFound)
        ));

        // clearing an absent credential is fine
        store.clear(CredentialsKind::Vnc).await.unwrap();
    }

    #[tokio::test]
    async fn values_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCredentials::with_directory(dir.path().to_path_buf()).unwrap();
            store
                .store(CredentialsValue::Rdp {
                    username: "bob".into(),
                    password: "pw".into(),
                })
                .await
                .unwrap();
        }

        let reopened = FileCredentials::with_directory(dir.path().to_path_buf()).unwrap();
        let value = reopened.lookup(CredentialsKind::Rdp).await.unwrap();
        assert!(matches!(value, CredentialsValue::Rdp { .. }));
    }

    #[tokio::test]
    async fn file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let (store, dir) = store_in_tempdir();
        store
            .store(CredentialsValue::Vnc { password: "pw".into() })
            .await
            .unwrap();

        let mode = std::fs::metadata(dir.path().join("credentials.ini"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
