//! Identity records and the bounded session pool
//!
//! The pool lends each request a scoped session for the duration of that
//! request. Capacity is bounded; when no session frees up within the request
//! timeout, acquisition fails with `service unavailable` rather than queueing
//! indefinitely.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Error, Result};

/// A stored identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Stable, unique username
    pub username: String,
    /// Cached group memberships
    #[serde(default)]
    pub groups: Vec<String>,
    /// When this identity last completed a discharge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_discharge: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    /// Create a record with the given username and groups
    pub fn new(username: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            username: username.into(),
            groups,
            last_discharge: None,
        }
    }
}

/// Persistent identity storage
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Fetch an identity by username
    async fn get(&self, username: &str) -> Result<IdentityRecord>;

    /// Create or replace an identity record
    async fn upsert(&self, record: IdentityRecord) -> Result<()>;

    /// Record the time of the identity's most recent discharge
    async fn set_last_discharge(&self, username: &str, when: DateTime<Utc>) -> Result<()>;
}

/// In-memory identity backend
///
/// The production deployment backs [`IdentityBackend`] with the external
/// identity database; this implementation serves single-process deployments
/// and tests.
#[derive(Default)]
pub struct MemBackend {
    records: DashMap<String, IdentityRecord>,
}

impl MemBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityBackend for MemBackend {
    async fn get(&self, username: &str) -> Result<IdentityRecord> {
        self.records
            .get(username)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("user {username} not found")))
    }

    async fn upsert(&self, record: IdentityRecord) -> Result<()> {
        self.records.insert(record.username.clone(), record);
        Ok(())
    }

    async fn set_last_discharge(&self, username: &str, when: DateTime<Utc>) -> Result<()> {
        let mut entry = self
            .records
            .get_mut(username)
            .ok_or_else(|| Error::NotFound(format!("user {username} not found")))?;
        entry.last_discharge = Some(when);
        Ok(())
    }
}

/// Bounded pool of store sessions
pub struct Pool {
    backend: Arc<dyn IdentityBackend>,
    sessions: Arc<Semaphore>,
    request_timeout: Duration,
}

impl Pool {
    /// Create a pool over `backend` with at most `max_sessions` concurrent
    /// sessions and the given acquisition timeout.
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        max_sessions: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            request_timeout,
        }
    }

    /// Acquire a session, waiting at most the request timeout.
    pub async fn session(&self) -> Result<Session> {
        let permit = tokio::time::timeout(
            self.request_timeout,
            self.sessions.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            debug!("store session acquisition timed out");
            Error::ServiceUnavailable("too many store sessions in use".to_string())
        })?
        .map_err(|_| Error::ServiceUnavailable("session pool closed".to_string()))?;

        Ok(Session {
            backend: self.backend.clone(),
            _permit: permit,
        })
    }

    /// Number of sessions currently available
    pub fn available(&self) -> usize {
        self.sessions.available_permits()
    }
}

/// A request-scoped store session
///
/// Holds one pool permit for its lifetime; dropping the session on any exit
/// path returns the permit.
pub struct Session {
    backend: Arc<dyn IdentityBackend>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// The identity storage behind this session
    pub fn store(&self) -> &dyn IdentityBackend {
        self.backend.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_backend() -> Arc<MemBackend> {
        let backend = Arc::new(MemBackend::new());
        let records = [
            IdentityRecord::new("alice", vec!["devs".to_string(), "ops".to_string()]),
            IdentityRecord::new("bob", vec![]),
        ];
        for record in records {
            backend.records.insert(record.username.clone(), record);
        }
        backend
    }

    #[tokio::test]
    async fn test_get_known_identity() {
        let backend = seeded_backend();
        let record = backend.get("alice").await.unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.groups, vec!["devs", "ops"]);
    }

    #[tokio::test]
    async fn test_get_unknown_identity() {
        let backend = seeded_backend();
        let err = backend.get("nobody").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_last_discharge() {
        let backend = seeded_backend();
        assert!(backend.get("bob").await.unwrap().last_discharge.is_none());

        let when = Utc::now();
        backend.set_last_discharge("bob", when).await.unwrap();
        assert_eq!(backend.get("bob").await.unwrap().last_discharge, Some(when));
    }

    #[tokio::test]
    async fn test_set_last_discharge_unknown_user() {
        let backend = seeded_backend();
        let err = backend
            .set_last_discharge("nobody", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pool_lends_and_returns_sessions() {
        let pool = Pool::new(seeded_backend(), 2, Duration::from_millis(100));
        assert_eq!(pool.available(), 2);

        let session = pool.session().await.unwrap();
        assert_eq!(pool.available(), 1);
        session.store().get("alice").await.unwrap();

        drop(session);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_pool_saturation_fails_within_timeout() {
        let pool = Pool::new(seeded_backend(), 1, Duration::from_millis(50));
        let _held = pool.session().await.unwrap();

        let started = std::time::Instant::now();
        let err = pool.session().await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_pool_recovers_after_release() {
        let pool = Pool::new(seeded_backend(), 1, Duration::from_millis(50));
        let held = pool.session().await.unwrap();
        drop(held);
        assert!(pool.session().await.is_ok());
    }
}
