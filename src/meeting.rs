//! The rendezvous place
//!
//! A discharge request that needs an interactive login parks here: the
//! discharge path creates an entry keyed by an unguessable wait id, the login
//! path completes it, and the wait endpoint blocks until completion or the
//! entry's TTL elapses. Entries are mailboxes: completion before the waiter
//! arrives is buffered, and each entry delivers to exactly one waiter.
//!
//! When several identity server instances share the public address, the
//! instance that created an entry is the only one that can deliver to its
//! waiter. Entries register their owner's private address so that `done` on
//! any instance forwards to the owner over the private network.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use waypost_bakery::Macaroon;

use crate::error::{Error, Result};

/// Request context recorded when a rendezvous is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousInfo {
    /// The third-party caveat id being discharged
    pub caveat_id: String,
    /// The caveat's condition
    pub condition: String,
    /// Origin of the discharge request; the discharge produced for this
    /// rendezvous is only usable from this origin
    pub origin: String,
}

/// Outcome of the interactive login for one rendezvous
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginResult {
    /// The identity macaroon sequence minted for the logged-in user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_macaroon: Option<Vec<Macaroon>>,
    /// Why the login failed, when it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Maps wait ids to the private address of the instance holding the entry
#[async_trait]
pub trait OwnerRegistry: Send + Sync {
    /// Record that `addr` owns the entry for `wait_id`
    async fn register(&self, wait_id: &str, addr: &str) -> Result<()>;

    /// The owner of `wait_id`, if known
    async fn owner(&self, wait_id: &str) -> Result<Option<String>>;

    /// Drop the registration for `wait_id`
    async fn forget(&self, wait_id: &str) -> Result<()>;
}

/// Process-local owner registry for single-instance deployments and tests
#[derive(Default)]
pub struct InMemoryRegistry {
    owners: DashMap<String, String>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OwnerRegistry for InMemoryRegistry {
    async fn register(&self, wait_id: &str, addr: &str) -> Result<()> {
        self.owners.insert(wait_id.to_string(), addr.to_string());
        Ok(())
    }

    async fn owner(&self, wait_id: &str) -> Result<Option<String>> {
        Ok(self.owners.get(wait_id).map(|entry| entry.value().clone()))
    }

    async fn forget(&self, wait_id: &str) -> Result<()> {
        self.owners.remove(wait_id);
        Ok(())
    }
}

/// Delivers a login result to the instance owning a rendezvous entry
#[async_trait]
pub trait DoneForwarder: Send + Sync {
    /// Forward `done(wait_id, result)` to the instance at `addr`
    async fn forward(&self, addr: &str, wait_id: &str, result: &LoginResult) -> Result<()>;
}

/// Body of a forwarded completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneRequest {
    /// The rendezvous to complete
    pub wait_id: String,
    /// The login outcome
    pub result: LoginResult,
}

/// Port every instance's private rendezvous listener binds; `private_addr`
/// itself is dialable without a port
pub const PRIVATE_PORT: u16 = 8156;

/// Forwards completions over the private network
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    /// Create a forwarder with a bounded request timeout
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("cannot create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DoneForwarder for HttpForwarder {
    async fn forward(&self, addr: &str, wait_id: &str, result: &LoginResult) -> Result<()> {
        let url = format!("http://{addr}:{PRIVATE_PORT}/v1/rendezvous/done");
        debug!(url = %url, wait_id = %wait_id, "forwarding rendezvous completion");

        let response = self
            .client
            .post(&url)
            .json(&DoneRequest {
                wait_id: wait_id.to_string(),
                result: result.clone(),
            })
            .send()
            .await
            .map_err(|e| Error::Internal(format!("cannot forward rendezvous completion: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "rendezvous forward to {addr} failed: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

struct Entry {
    info: RendezvousInfo,
    created: Instant,
    tx: Option<oneshot::Sender<LoginResult>>,
    rx: Option<oneshot::Receiver<LoginResult>>,
}

/// The rendezvous place
pub struct Place {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    own_addr: String,
    registry: Arc<dyn OwnerRegistry>,
    forwarder: Option<Arc<dyn DoneForwarder>>,
}

impl Place {
    /// Create a place owned by the instance at `own_addr`
    pub fn new(
        ttl: Duration,
        own_addr: impl Into<String>,
        registry: Arc<dyn OwnerRegistry>,
        forwarder: Option<Arc<dyn DoneForwarder>>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            own_addr: own_addr.into(),
            registry,
            forwarder,
        }
    }

    /// Create a process-local place with no cross-instance forwarding
    pub fn local(ttl: Duration) -> Self {
        Self::new(ttl, "local", Arc::new(InMemoryRegistry::new()), None)
    }

    /// Park a discharge request, returning a fresh unguessable wait id.
    pub async fn new_rendezvous(&self, info: RendezvousInfo) -> Result<String> {
        self.expire_stale().await;

        let wait_id = new_wait_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            wait_id.clone(),
            Entry {
                info,
                created: Instant::now(),
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        self.registry.register(&wait_id, &self.own_addr).await?;
        debug!(wait_id = %wait_id, "created rendezvous");
        Ok(wait_id)
    }

    /// Complete a rendezvous with the login outcome.
    ///
    /// Fails if the id is unknown or the entry was already completed. When
    /// another instance owns the entry, the completion is forwarded to it.
    pub async fn done(&self, wait_id: &str, result: LoginResult) -> Result<()> {
        self.expire_stale().await;

        if self.entries.contains_key(wait_id) {
            return self.done_local(wait_id, result);
        }
        match self.registry.owner(wait_id).await? {
            Some(addr) if addr != self.own_addr => {
                let forwarder = self.forwarder.as_ref().ok_or_else(|| {
                    Error::Internal("rendezvous owned elsewhere and no forwarder configured".to_string())
                })?;
                forwarder.forward(&addr, wait_id, &result).await
            }
            _ => Err(Error::NotFound(format!("rendezvous {wait_id:?}"))),
        }
    }

    /// Complete a rendezvous held by this instance.
    pub fn done_local(&self, wait_id: &str, result: LoginResult) -> Result<()> {
        let tx = {
            let mut entry = self
                .entries
                .get_mut(wait_id)
                .ok_or_else(|| Error::NotFound(format!("rendezvous {wait_id:?}")))?;
            entry.tx.take().ok_or_else(|| {
                Error::BadRequest(format!("rendezvous {wait_id:?} already completed"))
            })?
        };
        if tx.send(result).is_err() {
            // The receiver is gone: the waiter was consumed and dropped.
            warn!(wait_id = %wait_id, "rendezvous completed but waiter is gone");
        }
        debug!(wait_id = %wait_id, "rendezvous completed");
        Ok(())
    }

    /// Block until the rendezvous completes or its TTL elapses.
    ///
    /// Returns the request info recorded at creation together with the login
    /// outcome. At most one wait per id can succeed; later waits, waits on
    /// unknown ids, and waits outliving the TTL all report expiry.
    pub async fn wait(&self, wait_id: &str) -> Result<(RendezvousInfo, LoginResult)> {
        let (info, rx, deadline) = {
            let mut entry = self.entries.get_mut(wait_id).ok_or(Error::Expired)?;
            let rx = entry.rx.take().ok_or(Error::Expired)?;
            (entry.info.clone(), rx, entry.created + self.ttl)
        };

        let outcome = tokio::time::timeout(
            deadline.saturating_duration_since(Instant::now()),
            rx,
        )
        .await;
        self.remove(wait_id).await;

        match outcome {
            Ok(Ok(result)) => Ok((info, result)),
            // Sender dropped by the TTL sweep, or the deadline itself
            Ok(Err(_)) | Err(_) => Err(Error::Expired),
        }
    }

    /// Drop entries older than the TTL, whether or not they were consumed.
    pub async fn expire_stale(&self) {
        let ttl = self.ttl;
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.created.elapsed() >= ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for wait_id in stale {
            debug!(wait_id = %wait_id, "expiring stale rendezvous");
            self.remove(&wait_id).await;
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the place holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn remove(&self, wait_id: &str) {
        self.entries.remove(wait_id);
        if let Err(e) = self.registry.forget(wait_id).await {
            warn!(wait_id = %wait_id, error = %e, "cannot drop rendezvous registration");
        }
    }
}

/// Spawn a background sweep expiring stale entries at the given interval
pub fn spawn_sweeper(place: Arc<Place>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            place.expire_stale().await;
        }
    })
}

fn new_wait_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn info() -> RendezvousInfo {
        RendezvousInfo {
            caveat_id: "caveat".to_string(),
            condition: "is-authenticated-user".to_string(),
            origin: "https://a.example.com".to_string(),
        }
    }

    fn login(user: &str) -> LoginResult {
        LoginResult {
            identity_macaroon: Some(vec![Macaroon::new(b"key", user, None)]),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_wait_ids_are_unguessable_and_unique() {
        let a = new_wait_id();
        let b = new_wait_id();
        assert_ne!(a, b);
        assert!(a.len() >= 40);
    }

    #[tokio::test]
    async fn test_done_then_wait_is_buffered() {
        let place = Place::local(Duration::from_secs(60));
        let wait_id = place.new_rendezvous(info()).await.unwrap();

        place.done(&wait_id, login("alice")).await.unwrap();

        let (got_info, result) = place.wait(&wait_id).await.unwrap();
        assert_eq!(got_info.condition, "is-authenticated-user");
        assert!(result.identity_macaroon.is_some());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_done() {
        let place = Arc::new(Place::local(Duration::from_secs(60)));
        let wait_id = place.new_rendezvous(info()).await.unwrap();

        let waiter = {
            let place = place.clone();
            let wait_id = wait_id.clone();
            tokio::spawn(async move { place.wait(&wait_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        place.done(&wait_id, login("alice")).await.unwrap();

        let (_, result) = waiter.await.unwrap().unwrap();
        assert!(result.identity_macaroon.is_some());
    }

    #[tokio::test]
    async fn test_second_wait_reports_expired() {
        let place = Place::local(Duration::from_secs(60));
        let wait_id = place.new_rendezvous(info()).await.unwrap();
        place.done(&wait_id, login("alice")).await.unwrap();

        place.wait(&wait_id).await.unwrap();
        let err = place.wait(&wait_id).await.unwrap_err();
        assert!(matches!(err, Error::Expired));
    }

    #[tokio::test]
    async fn test_wait_unknown_id_reports_expired() {
        let place = Place::local(Duration::from_secs(60));
        let err = place.wait("nope").await.unwrap_err();
        assert!(matches!(err, Error::Expired));
    }

    #[tokio::test]
    async fn test_wait_times_out_at_ttl() {
        let place = Place::local(Duration::from_millis(30));
        let wait_id = place.new_rendezvous(info()).await.unwrap();

        let err = place.wait(&wait_id).await.unwrap_err();
        assert!(matches!(err, Error::Expired));
    }

    #[tokio::test]
    async fn test_done_unknown_id_fails() {
        let place = Place::local(Duration::from_secs(60));
        let err = place.done("nope", login("alice")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_done_twice_fails() {
        let place = Place::local(Duration::from_secs(60));
        let wait_id = place.new_rendezvous(info()).await.unwrap();

        place.done(&wait_id, login("alice")).await.unwrap();
        let err = place.done(&wait_id, login("mallory")).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_done_can_report_login_failure() {
        let place = Place::local(Duration::from_secs(60));
        let wait_id = place.new_rendezvous(info()).await.unwrap();

        place
            .done(
                &wait_id,
                LoginResult {
                    identity_macaroon: None,
                    error: Some("user cancelled".to_string()),
                },
            )
            .await
            .unwrap();

        let (_, result) = place.wait(&wait_id).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("user cancelled"));
    }

    #[tokio::test]
    async fn test_stale_entries_are_swept() {
        let place = Place::local(Duration::from_millis(1));
        place.new_rendezvous(info()).await.unwrap();
        assert_eq!(place.len(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        place.expire_stale().await;
        assert!(place.is_empty());
    }

    /// Forwarder wired directly to a set of in-process places, standing in
    /// for the private-network HTTP hop.
    struct LocalForwarder {
        places: tokio::sync::Mutex<HashMap<String, Arc<Place>>>,
    }

    #[async_trait]
    impl DoneForwarder for LocalForwarder {
        async fn forward(&self, addr: &str, wait_id: &str, result: &LoginResult) -> Result<()> {
            let places = self.places.lock().await;
            let place = places
                .get(addr)
                .ok_or_else(|| Error::Internal(format!("no instance at {addr}")))?;
            place.done_local(wait_id, result.clone())
        }
    }

    #[tokio::test]
    async fn test_done_forwards_to_owning_instance() {
        let registry: Arc<dyn OwnerRegistry> = Arc::new(InMemoryRegistry::new());
        let forwarder = Arc::new(LocalForwarder {
            places: tokio::sync::Mutex::new(HashMap::new()),
        });

        let instance_a = Arc::new(Place::new(
            Duration::from_secs(60),
            "10.0.0.1",
            registry.clone(),
            Some(forwarder.clone()),
        ));
        let instance_b = Arc::new(Place::new(
            Duration::from_secs(60),
            "10.0.0.2",
            registry.clone(),
            Some(forwarder.clone()),
        ));
        forwarder
            .places
            .lock()
            .await
            .extend([
                ("10.0.0.1".to_string(), instance_a.clone()),
                ("10.0.0.2".to_string(), instance_b.clone()),
            ]);

        // Entry created on A; login completes against B; waiter on A sees it.
        let wait_id = instance_a.new_rendezvous(info()).await.unwrap();
        instance_b.done(&wait_id, login("alice")).await.unwrap();

        let (_, result) = instance_a.wait(&wait_id).await.unwrap();
        assert!(result.identity_macaroon.is_some());
    }
}
