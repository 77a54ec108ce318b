//! External group resolution
//!
//! Group membership can come from an external team service. Lookups are
//! cached for a bounded TTL; resolver failures propagate to the caller so
//! authoritative checks can refuse rather than silently pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// Resolves a user's group memberships from an external source
#[async_trait]
pub trait GroupResolver: Send + Sync {
    /// The groups the external source knows the user to be a member of
    async fn groups(&self, username: &str) -> Result<Vec<String>>;
}

/// Membership document returned by the external group service
#[derive(Debug, Deserialize)]
struct MembershipsResponse {
    #[serde(default)]
    groups: Vec<String>,
}

/// Group resolver backed by a Launchpad-style team service
pub struct LaunchpadResolver {
    base_url: String,
    client: reqwest::Client,
}

impl LaunchpadResolver {
    /// Create a resolver against the given API base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("cannot create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl GroupResolver for LaunchpadResolver {
    async fn groups(&self, username: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/~{}/memberships",
            self.base_url.trim_end_matches('/'),
            username
        );
        debug!(url = %url, "fetching external group memberships");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("cannot get groups for {username}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "cannot get groups for {username}: {}",
                response.status()
            )));
        }
        let memberships: MembershipsResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("invalid memberships response: {e}")))?;
        Ok(memberships.groups)
    }
}

struct CacheEntry {
    groups: Vec<String>,
    fetched: Instant,
}

/// Caching decorator over a group resolver
///
/// Successful lookups are served from cache within the TTL; failures are not
/// cached.
pub struct CachedResolver {
    inner: Arc<dyn GroupResolver>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl CachedResolver {
    /// Wrap `inner` with a cache of the given TTL
    pub fn new(inner: Arc<dyn GroupResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl GroupResolver for CachedResolver {
    async fn groups(&self, username: &str) -> Result<Vec<String>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(username) {
                if entry.fetched.elapsed() < self.ttl {
                    return Ok(entry.groups.clone());
                }
            }
        }

        let groups = self.inner.groups(username).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            username.to_string(),
            CacheEntry {
                groups: groups.clone(),
                fetched: Instant::now(),
            },
        );
        Ok(groups)
    }
}

/// Fixed-table resolver for tests and standalone deployments
#[derive(Default)]
pub struct StaticResolver {
    groups: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    /// Create a resolver from a username → groups table
    pub fn new(groups: HashMap<String, Vec<String>>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl GroupResolver for StaticResolver {
    async fn groups(&self, username: &str) -> Result<Vec<String>> {
        Ok(self.groups.get(username).cloned().unwrap_or_default())
    }
}
