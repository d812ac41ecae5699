//! Credential storage
//!
//! The pipeline never reads secrets from anywhere but a [`CredentialStore`].
//! Only one credential is active at a time; saving a new one deactivates the
//! rest. Token writes are compare-and-swap on the credential's `version`, so
//! two workers refreshing at once cannot overwrite each other's tokens.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Result, SyndicastError};
use crate::types::{clone_secret, PublishCredential, TokenUpdate};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The active credential, if one has been set up
    async fn get_active(&self) -> Result<Option<PublishCredential>>;

    /// Install `credential` as the active one, deactivating any other.
    /// Returns the stored record with its id and version assigned.
    async fn save_credential(&self, credential: PublishCredential) -> Result<PublishCredential>;

    /// Write new tokens if the stored version still equals `expected_version`.
    ///
    /// Returns `false` (and writes nothing) when another writer got there
    /// first. A successful write increments the version.
    async fn update_tokens(
        &self,
        id: i64,
        expected_version: i64,
        update: &TokenUpdate,
    ) -> Result<bool>;

    /// Remove access and refresh tokens after an unrecoverable auth failure
    async fn clear_tokens(&self, id: i64) -> Result<()>;
}

/// In-process credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<MemoryCredentials>,
}

#[derive(Debug, Default)]
struct MemoryCredentials {
    records: Vec<PublishCredential>,
    next_id: i64,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored credential, active or not
    pub async fn all(&self) -> Vec<PublishCredential> {
        self.inner.lock().await.records.clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_active(&self) -> Result<Option<PublishCredential>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.iter().find(|c| c.is_active).cloned())
    }

    async fn save_credential(&self, mut credential: PublishCredential) -> Result<PublishCredential> {
        if credential.client_id.trim().is_empty() {
            return Err(SyndicastError::InvalidInput(
                "credential client id is empty".to_string(),
            ));
        }

        let mut inner = self.inner.lock().await;
        for existing in inner.records.iter_mut() {
            existing.is_active = false;
        }

        inner.next_id += 1;
        credential.id = Some(inner.next_id);
        credential.is_active = true;
        credential.version = 1;
        inner.records.push(credential.clone());

        Ok(credential)
    }

    async fn update_tokens(
        &self,
        id: i64,
        expected_version: i64,
        update: &TokenUpdate,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let record = match inner.records.iter_mut().find(|c| c.id == Some(id)) {
            Some(record) => record,
            None => return Ok(false),
        };

        if record.version != expected_version {
            return Ok(false);
        }

        record.access_token = Some(clone_secret(&update.access_token));
        if let Some(refresh) = &update.refresh_token {
            record.refresh_token = Some(clone_secret(refresh));
        }
        record.expires_at = Some(update.expires_at);
        record.version += 1;
        Ok(true)
    }

    async fn clear_tokens(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.records.iter_mut().find(|c| c.id == Some(id)) {
            record.access_token = None;
            record.refresh_token = None;
            record.expires_at = None;
            record.version += 1;
        }
        Ok(())
    }
}
