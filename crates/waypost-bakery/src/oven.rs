//! Macaroon minting
//!
//! The oven holds the service keypair and assembles new macaroons: it
//! allocates a root key from the store selected for the operation set,
//! encodes the key id and operations into the macaroon id, and stamps an
//! expiry caveat on everything it mints.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::caveat::Caveat;
use crate::checkers::{time_before_caveat, CheckContext, Namespace};
use crate::crypto::{open, KEY_LEN};
use crate::error::{Error, Result};
use crate::keys::KeyPair;
use crate::macaroon::{CaveatPayload, Macaroon};
use crate::rootkey::RootKeyStore;
use crate::verify::verify;

/// A permission a macaroon authorizes: an entity/action pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Op {
    /// The thing the action applies to
    pub entity: String,
    /// The permitted action
    pub action: String,
}

impl Op {
    /// Create an operation
    pub fn new(entity: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            action: action.into(),
        }
    }
}

/// The operation authorizing a standard login discharge
pub fn login_op() -> Op {
    Op::new("login", "login")
}

/// Identifier encoded into every minted macaroon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacaroonId {
    /// Root key id in the store that minted the macaroon
    pub key_id: String,
    /// Random nonce keeping ids unique per macaroon
    pub nonce: String,
    /// Operations the macaroon authorizes
    pub ops: Vec<Op>,
}

/// Public information about a third party that can discharge caveats
#[derive(Clone)]
pub struct ThirdPartyInfo {
    /// The key under which caveat ids for this party are sealed
    pub key: [u8; KEY_LEN],
}

impl std::fmt::Debug for ThirdPartyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThirdPartyInfo").finish_non_exhaustive()
    }
}

/// Locator mapping third-party locations to their discharge keys
#[derive(Debug, Default)]
pub struct ThirdPartyStore {
    info: DashMap<String, ThirdPartyInfo>,
}

impl ThirdPartyStore {
    /// Create an empty locator
    pub fn new() -> Self {
        Self::default()
    }

    /// Register discharge information for a location
    pub fn add_info(&self, location: &str, info: ThirdPartyInfo) {
        self.info.insert(location.to_string(), info);
    }

    /// Look up discharge information for a location
    pub fn info_for(&self, location: &str) -> Option<ThirdPartyInfo> {
        self.info.get(location).map(|entry| entry.value().clone())
    }
}

/// A third-party caveat as handed to the discharge logic
#[derive(Debug, Clone)]
pub struct ThirdPartyCaveatInfo {
    /// The opaque caveat id presented for discharge
    pub caveat_id: String,
    /// The condition recovered from the caveat id
    pub condition: String,
}

/// Construction parameters for an [`Oven`]
pub struct OvenParams {
    /// First-party caveat vocabulary minted macaroons are checked against
    pub namespace: Namespace,
    /// The service keypair
    pub key: KeyPair,
    /// Canonical location stamped on minted macaroons
    pub location: String,
    /// Locator for third parties this service delegates to
    pub locator: Arc<ThirdPartyStore>,
    /// Root key store used for every operation set
    pub root_keys: Arc<dyn RootKeyStore>,
}

/// Mints macaroons and verifies the ones it minted
pub struct Oven {
    namespace: Namespace,
    key: KeyPair,
    location: String,
    locator: Arc<ThirdPartyStore>,
    root_keys: Arc<dyn RootKeyStore>,
}

impl Oven {
    /// Create an oven from its parameters
    pub fn new(params: OvenParams) -> Self {
        Self {
            namespace: params.namespace,
            key: params.key,
            location: params.location,
            locator: params.locator,
            root_keys: params.root_keys,
        }
    }

    /// The service keypair
    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    /// The canonical location stamped on minted macaroons
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The first-party checker namespace
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The third-party locator
    pub fn locator(&self) -> &ThirdPartyStore {
        &self.locator
    }

    /// The root key store backing the given operation set
    pub fn store_for_ops(&self, _ops: &[Op]) -> Arc<dyn RootKeyStore> {
        // A single shared store currently backs every operation set.
        self.root_keys.clone()
    }

    /// Mint a macaroon authorizing `ops`, valid until `expiry`, carrying the
    /// given first-party caveats in addition to the expiry caveat.
    pub async fn mint(
        &self,
        expiry: DateTime<Utc>,
        caveats: &[Caveat],
        ops: &[Op],
    ) -> Result<Macaroon> {
        if ops.is_empty() {
            return Err(Error::Decode(
                "cannot mint a macaroon with no operations".to_string(),
            ));
        }

        let store = self.store_for_ops(ops);
        let (key_id, root_key) = store.create(expiry).await?;

        let mut nonce = [0u8; 8];
        OsRng.fill_bytes(&mut nonce);
        let id = MacaroonId {
            key_id,
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            ops: ops.to_vec(),
        };
        let id_json = serde_json::to_string(&id).map_err(|e| Error::Decode(e.to_string()))?;

        let mut macaroon = Macaroon::new(&root_key, id_json, Some(self.location.clone()));
        macaroon.add_first_party_caveat(&time_before_caveat(expiry).id);
        for caveat in caveats {
            if !caveat.is_first_party() {
                return Err(Error::Decode(
                    "mint accepts only first-party caveats".to_string(),
                ));
            }
            macaroon.add_first_party_caveat(&caveat.id);
        }
        Ok(macaroon)
    }

    /// Verify a macaroon sequence this oven minted and return the operations
    /// it authorizes together with its declared attributes.
    ///
    /// The first macaroon of the sequence is the primary; the rest are its
    /// discharges.
    pub async fn macaroon_ops(
        &self,
        sequence: &[Macaroon],
        ctx: &CheckContext,
    ) -> Result<(Vec<Op>, std::collections::HashMap<String, String>)> {
        let primary = sequence
            .first()
            .ok_or_else(|| Error::Decode("empty macaroon sequence".to_string()))?;
        let id: MacaroonId = serde_json::from_str(&primary.id)
            .map_err(|_| Error::Decode("macaroon id".to_string()))?;

        let store = self.store_for_ops(&id.ops);
        let root_key = store.get(&id.key_id).await?;

        let declared = verify(primary, &root_key, &self.namespace, ctx, &sequence[1..])?;
        Ok((id.ops, declared))
    }
}

impl std::fmt::Debug for Oven {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oven")
            .field("location", &self.location)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Recover the discharge root key and condition from a third-party caveat id
/// sealed for this service.
pub fn decode_caveat(key: &KeyPair, caveat_id: &str) -> Result<([u8; KEY_LEN], String)> {
    let sealed = URL_SAFE_NO_PAD
        .decode(caveat_id)
        .map_err(|_| Error::Decode("caveat id base64".to_string()))?;
    let payload_json = open(key.secret(), &sealed)?;
    let payload: CaveatPayload = serde_json::from_slice(&payload_json)
        .map_err(|_| Error::Decode("caveat payload".to_string()))?;
    let root_key: [u8; KEY_LEN] = URL_SAFE_NO_PAD
        .decode(&payload.root_key)
        .map_err(|_| Error::Decode("caveat root key".to_string()))?
        .try_into()
        .map_err(|_| Error::Decode("caveat root key length".to_string()))?;
    Ok((root_key, payload.condition))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::declared_caveat;
    use crate::rootkey::MemoryRootKeyStore;
    use chrono::Duration;

    fn oven() -> Oven {
        Oven::new(OvenParams {
            namespace: Namespace::std(),
            key: KeyPair::generate(),
            location: "identity".to_string(),
            locator: Arc::new(ThirdPartyStore::new()),
            root_keys: Arc::new(MemoryRootKeyStore::new()),
        })
    }

    #[tokio::test]
    async fn test_mint_carries_expiry_caveat() {
        let oven = oven();
        let expiry = Utc::now() + Duration::hours(6);
        let m = oven.mint(expiry, &[], &[login_op()]).await.unwrap();

        assert_eq!(m.location.as_deref(), Some("identity"));
        assert_eq!(m.caveats.len(), 1);
        assert!(m.caveats[0].id.starts_with("time-before "));
    }

    #[tokio::test]
    async fn test_mint_requires_ops() {
        let oven = oven();
        assert!(oven
            .mint(Utc::now() + Duration::hours(1), &[], &[])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mint_rejects_third_party_caveats() {
        let oven = oven();
        let third_party = Caveat {
            id: "opaque".to_string(),
            verification_id: Some("dmlk".to_string()),
            location: Some("elsewhere".to_string()),
        };
        assert!(oven
            .mint(Utc::now() + Duration::hours(1), &[third_party], &[login_op()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_minted_macaroon_round_trips_through_macaroon_ops() {
        let oven = oven();
        let m = oven
            .mint(
                Utc::now() + Duration::hours(1),
                &[declared_caveat("username", "alice")],
                &[login_op()],
            )
            .await
            .unwrap();

        let (ops, declared) = oven
            .macaroon_ops(&[m], &CheckContext::new(None))
            .await
            .unwrap();
        assert_eq!(ops, vec![login_op()]);
        assert_eq!(declared.get("username").map(String::as_str), Some("alice"));
    }

    #[tokio::test]
    async fn test_macaroon_ops_rejects_expired() {
        let oven = oven();
        let m = oven
            .mint(Utc::now() + Duration::hours(1), &[], &[login_op()])
            .await
            .unwrap();

        // Simulate verification after expiry
        let ctx = CheckContext {
            now: Utc::now() + Duration::hours(2),
            origin: None,
        };
        assert!(oven.macaroon_ops(&[m], &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_macaroon_ops_rejects_foreign_macaroon() {
        let oven = oven();
        let m = Macaroon::new(b"foreign", "not json", None);
        assert!(oven
            .macaroon_ops(&[m], &CheckContext::new(None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_macaroon_ops_rejects_empty_sequence() {
        let oven = oven();
        assert!(oven
            .macaroon_ops(&[], &CheckContext::new(None))
            .await
            .is_err());
    }

    #[test]
    fn test_locator_round_trip() {
        let store = ThirdPartyStore::new();
        let key = KeyPair::generate();
        store.add_info("https://id.example.com", ThirdPartyInfo { key: *key.secret() });

        assert!(store.info_for("https://id.example.com").is_some());
        assert!(store.info_for("https://other.example.com").is_none());
    }

    #[test]
    fn test_decode_caveat_rejects_foreign_key() {
        let ours = KeyPair::generate();
        let theirs = KeyPair::generate();
        let info = ThirdPartyInfo { key: *theirs.secret() };

        let mut m = Macaroon::new(b"root", "target", None);
        m.add_third_party_caveat(&info, "is-authenticated-user", "identity")
            .unwrap();

        assert!(decode_caveat(&ours, &m.caveats[0].id).is_err());
        assert!(decode_caveat(&theirs, &m.caveats[0].id).is_ok());
    }
}
