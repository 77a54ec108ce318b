//! Root key storage
//!
//! Every minted macaroon chains from a root key held by the service; the key
//! is looked up by id at verification time. Keys carry an expiry and expired
//! keys are pruned as new ones are created.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::KEY_LEN;
use crate::error::{Error, Result};

/// Storage for macaroon root keys
#[async_trait]
pub trait RootKeyStore: Send + Sync {
    /// Look up a root key by id
    async fn get(&self, id: &str) -> Result<[u8; KEY_LEN]>;

    /// Create a fresh root key valid until `expires`
    async fn create(&self, expires: DateTime<Utc>) -> Result<(String, [u8; KEY_LEN])>;
}

struct StoredKey {
    key: [u8; KEY_LEN],
    expires: DateTime<Utc>,
}

/// In-memory root key store
///
/// Suitable for a single instance; a clustered deployment backs this trait
/// with shared storage instead.
#[derive(Default)]
pub struct MemoryRootKeyStore {
    keys: DashMap<String, StoredKey>,
}

impl MemoryRootKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (possibly expired, not yet pruned) keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn prune(&self) {
        let now = Utc::now();
        self.keys.retain(|_, stored| now < stored.expires);
    }
}

#[async_trait]
impl RootKeyStore for MemoryRootKeyStore {
    async fn get(&self, id: &str) -> Result<[u8; KEY_LEN]> {
        let stored = self
            .keys
            .get(id)
            .ok_or_else(|| Error::UnknownRootKey(id.to_string()))?;
        if Utc::now() >= stored.expires {
            return Err(Error::UnknownRootKey(id.to_string()));
        }
        Ok(stored.key)
    }

    async fn create(&self, expires: DateTime<Utc>) -> Result<(String, [u8; KEY_LEN])> {
        self.prune();

        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let id = URL_SAFE_NO_PAD.encode(id_bytes);

        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        self.keys.insert(id.clone(), StoredKey { key, expires });
        Ok((id, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_create_then_get() {
        let store = MemoryRootKeyStore::new();
        let (id, key) = store.create(Utc::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), key);
    }

    #[tokio::test]
    async fn test_get_unknown_id() {
        let store = MemoryRootKeyStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, Error::UnknownRootKey(_)));
    }

    #[tokio::test]
    async fn test_expired_key_is_rejected() {
        let store = MemoryRootKeyStore::new();
        let (id, _) = store.create(Utc::now() - Duration::seconds(1)).await.unwrap();
        assert!(matches!(
            store.get(&id).await.unwrap_err(),
            Error::UnknownRootKey(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_keys_are_pruned_on_create() {
        let store = MemoryRootKeyStore::new();
        store.create(Utc::now() - Duration::seconds(1)).await.unwrap();
        store.create(Utc::now() - Duration::seconds(1)).await.unwrap();
        assert_eq!(store.len(), 2);

        store.create(Utc::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_unique() {
        let store = MemoryRootKeyStore::new();
        let expires = Utc::now() + Duration::hours(1);
        let (id_a, key_a) = store.create(expires).await.unwrap();
        let (id_b, key_b) = store.create(expires).await.unwrap();
        assert_ne!(id_a, id_b);
        assert_ne!(key_a, key_b);
    }
}
