//! Secret-service credential store
//!
//! Stores credentials as secret-service items in the default collection,
//! keyed by a per-kind schema attribute. The service connection is
//! established per operation; at construction, a one-time lookup migrates
//! a credential stored under the legacy VNC schema into the current one.

use std::collections::HashMap;

use async_trait::async_trait;
use secret_service::{EncryptionType, SecretService};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{
    parse_tagged_text, to_tagged_text, Credentials, CredentialsError, CredentialsKind,
    CredentialsValue, Result,
};

const SCHEMA_ATTRIBUTE: &str = "xdg:schema";
const RDP_SCHEMA: &str = "org.borealremote.RdpCredentials";
const VNC_SCHEMA: &str = "org.borealremote.VncCredentials";
const LEGACY_VNC_SCHEMA: &str = "org.borealremote.VncPassword";

fn schema_for(kind: CredentialsKind) -> &'static str {
    match kind {
        CredentialsKind::Rdp => RDP_SCHEMA,
        CredentialsKind::Vnc => VNC_SCHEMA,
    }
}

fn label_for(kind: CredentialsKind) -> &'static str {
    match kind {
        CredentialsKind::Rdp => "Boreal Remote Desktop RDP credentials",
        CredentialsKind::Vnc => "Boreal Remote Desktop VNC credentials",
    }
}

async fn connect() -> Result<SecretService<'static>> {
    SecretService::connect(EncryptionType::Dh)
        .await
        .map_err(|e| CredentialsError::Backend(format!("Secret service unavailable: {e}")))
}

async fn store_value(value: &CredentialsValue) -> Result<()> {
    let kind = value.kind();
    let service = connect().await?;
    let collection = service
        .get_default_collection()
        .await
        .map_err(|e| CredentialsError::Backend(format!("No default collection: {e}")))?;

    let mut attributes = HashMap::new();
    attributes.insert(SCHEMA_ATTRIBUTE, schema_for(kind));

    let secret = Zeroizing::new(to_tagged_text(value).into_bytes());
    collection
        .create_item(label_for(kind), attributes, secret.as_ref(), true, "text/plain")
        .await
        .map_err(|e| CredentialsError::Backend(format!("Failed to create item: {e}")))?;

    debug!("Stored {} credentials in the secret service", kind.group_name());
    Ok(())
}

/// Credential store backed by the platform secret service
pub struct SecretServiceCredentials;

impl SecretServiceCredentials {
    /// Verify the service is reachable and run the legacy VNC migration
    pub async fn new() -> Result<Self> {
        connect().await?;

        let store = Self;
        store.maybe_migrate_legacy_vnc().await;
        Ok(store)
    }

    /// Move a legacy VNC password item to the current schema
    async fn maybe_migrate_legacy_vnc(&self) {
        let Ok(service) = connect().await else {
            return;
        };

        let mut attributes = HashMap::new();
        attributes.insert(SCHEMA_ATTRIBUTE, LEGACY_VNC_SCHEMA);

        let Ok(items) = service.search_items(attributes).await else {
            return;
        };
        let Some(item) = items.unlocked.first() else {
            return;
        };
        let Ok(secret) = item.get_secret().await else {
            return;
        };
        let Ok(password) = String::from_utf8(secret.to_vec()) else {
            return;
        };

        info!("Migrating legacy VNC credentials to the current schema");
        let value = CredentialsValue::Vnc { password };
        if store_value(&value).await.is_ok() {
            item.delete().await.ok();
        }
    }
}

#[async_trait]
impl Credentials for SecretServiceCredentials {
    async fn store(&self, value: CredentialsValue) -> Result<()> {
        store_value(&value).await
    }

    async fn lookup(&self, kind: CredentialsKind) -> Result<CredentialsValue> {
        let service = connect().await?;

        let mut attributes = HashMap::new();
        attributes.insert(SCHEMA_ATTRIBUTE, schema_for(kind));

        let items = service
            .search_items(attributes)
            .await
            .map_err(|e| CredentialsError::Backend(format!("Search failed: {e}")))?;

        let Some(item) = items.unlocked.first() else {
            return Err(CredentialsError::NotFound);
        };

        let secret = item
            .get_secret()
            .await
            .map_err(|e| CredentialsError::Backend(format!("Failed to read secret: {e}")))?;
        let text = String::from_utf8(secret.to_vec())
            .map_err(|_| CredentialsError::Malformed("secret is not UTF-8".into()))?;

        parse_tagged_text(kind, &text)
    }

    async fn clear(&self, kind: CredentialsKind) -> Result<()> {
        let service = connect().await?;

        let mut attributes = HashMap::new();
        attributes.insert(SCHEMA_ATTRIBUTE, schema_for(kind));

        let items = service
            .search_items(attributes)
            .await
            .map_err(|e| CredentialsError::Backend(format!("Search failed: {e}")))?;

        for item in items.unlocked.iter().chain(items.locked.iter()) {
            item.delete()
                .await
                .map_err(|e| CredentialsError::Backend(format!("Failed to delete item: {e}")))?;
        }

        Ok(())
    }
}
