//! Request authorization
//!
//! Extracts macaroons from the request (cookies and the `Macaroons` header),
//! verifies them against the oven's root keys, and binds the declared
//! identity to the request. Admin basic-auth is an alternative path yielding
//! a synthetic identity authorized for every operation.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::{AUTHORIZATION, COOKIE, ORIGIN};
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use waypost_bakery::macaroon::decode_slice;
use waypost_bakery::{CheckContext, Macaroon, Op, Oven};

use crate::error::{Error, Result};
use crate::groups::GroupResolver;
use crate::store::Session;

/// Cookie name prefix under which clients present macaroons
pub const MACAROON_COOKIE_PREFIX: &str = "macaroon-";

/// Header under which clients present macaroons
pub const MACAROONS_HEADER: &str = "macaroons";

/// The operation authorizing a discharge on behalf of another user
pub fn discharge_for_op() -> Op {
    Op::new("global", "discharge-for")
}

/// A principal bound to a request
#[async_trait]
pub trait Identity: Send + Sync {
    /// The principal's username
    fn id(&self) -> &str;

    /// True if the principal is a member of at least one of the required
    /// groups. An empty requirement allows nobody.
    async fn allow(&self, required: &[String]) -> Result<bool>;
}

/// An ordinary identity backed by stored and externally resolved groups
pub struct User {
    username: String,
    groups: Vec<String>,
    resolver: Option<Arc<dyn GroupResolver>>,
}

impl User {
    /// Create an identity for `username` with its stored groups
    pub fn new(
        username: impl Into<String>,
        groups: Vec<String>,
        resolver: Option<Arc<dyn GroupResolver>>,
    ) -> Self {
        Self {
            username: username.into(),
            groups,
            resolver,
        }
    }
}

#[async_trait]
impl Identity for User {
    fn id(&self) -> &str {
        &self.username
    }

    async fn allow(&self, required: &[String]) -> Result<bool> {
        if required.is_empty() {
            return Ok(false);
        }
        if self.groups.iter().any(|g| required.contains(g)) {
            return Ok(true);
        }
        if let Some(resolver) = &self.resolver {
            let external = resolver.groups(&self.username).await?;
            return Ok(external.iter().any(|g| required.contains(g)));
        }
        Ok(false)
    }
}

/// The synthetic admin identity produced by basic-auth
pub struct Admin;

#[async_trait]
impl Identity for Admin {
    fn id(&self) -> &str {
        "admin"
    }

    async fn allow(&self, _required: &[String]) -> Result<bool> {
        Ok(true)
    }
}

/// A verified identity and the operations the request is allowed
pub struct AuthInfo {
    /// The principal the request acts as
    pub identity: Arc<dyn Identity>,
    /// Operations the presented credentials authorize
    pub ops: Vec<Op>,
}

impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo")
            .field("identity", &self.identity.id())
            .field("ops", &self.ops)
            .finish()
    }
}

/// Construction parameters for an [`Authorizer`]
pub struct AuthorizerParams {
    /// Admin basic-auth username
    pub admin_username: String,
    /// Admin basic-auth password
    pub admin_password: String,
    /// Oven whose root keys verify presented macaroons
    pub oven: Arc<Oven>,
    /// External group resolver handed to ordinary identities
    pub resolver: Option<Arc<dyn GroupResolver>>,
}

/// Verifies request credentials and produces the acting identity
pub struct Authorizer {
    admin_username: String,
    admin_password: String,
    oven: Arc<Oven>,
    resolver: Option<Arc<dyn GroupResolver>>,
}

impl Authorizer {
    /// Create an authorizer from its parameters
    pub fn new(params: AuthorizerParams) -> Self {
        Self {
            admin_username: params.admin_username,
            admin_password: params.admin_password,
            oven: params.oven,
            resolver: params.resolver,
        }
    }

    /// The external group resolver, if configured
    pub fn resolver(&self) -> Option<Arc<dyn GroupResolver>> {
        self.resolver.clone()
    }

    /// Authorize the request for `op`.
    ///
    /// Basic-auth is tried first and does not fall through: wrong admin
    /// credentials fail immediately, and admin login is disabled outright
    /// while either credential is unconfigured. Otherwise every presented
    /// macaroon sequence is verified until one authorizes the operation.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        session: &Session,
        op: &Op,
    ) -> Result<AuthInfo> {
        if let Some((username, password)) = basic_credentials(headers)? {
            if self.admin_username.is_empty() || self.admin_password.is_empty() {
                return Err(Error::Unauthorized("admin login disabled".to_string()));
            }
            if username == self.admin_username && password == self.admin_password {
                debug!(op = ?op, "admin basic-auth accepted");
                return Ok(AuthInfo {
                    identity: Arc::new(Admin),
                    ops: vec![op.clone()],
                });
            }
            return Err(Error::Unauthorized("invalid admin credentials".to_string()));
        }

        let sequences = request_macaroons(headers);
        if sequences.is_empty() {
            return Err(Error::Unauthorized("macaroon discharge required".to_string()));
        }

        let ctx = CheckContext::new(origin_header(headers));
        let mut last_err = None;
        for sequence in &sequences {
            let (ops, declared) = match self.oven.macaroon_ops(sequence, &ctx).await {
                Ok(verified) => verified,
                Err(e) => {
                    debug!(error = %e, "presented macaroon failed verification");
                    last_err = Some(Error::from(e));
                    continue;
                }
            };
            if !ops.contains(op) {
                last_err = Some(Error::Forbidden(format!(
                    "macaroon does not authorize {:?} on {:?}",
                    op.action, op.entity
                )));
                continue;
            }
            let Some(username) = declared.get("username") else {
                last_err = Some(Error::Unauthorized("no username declared".to_string()));
                continue;
            };

            let groups = match session.store().get(username).await {
                Ok(record) => record.groups,
                Err(Error::NotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            };
            return Ok(AuthInfo {
                identity: Arc::new(User::new(username.as_str(), groups, self.resolver.clone())),
                ops,
            });
        }
        Err(last_err.unwrap_or_else(|| Error::Unauthorized("macaroon discharge required".to_string())))
    }
}

/// The request's `Origin` header, if present
pub fn origin_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Extract admin basic-auth credentials, if the request carries any
fn basic_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>> {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return Ok(None);
    };
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| Error::Unauthorized("invalid basic-auth encoding".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::Unauthorized("invalid basic-auth encoding".to_string()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| Error::Unauthorized("invalid basic-auth encoding".to_string()))?;
    Ok(Some((username.to_string(), password.to_string())))
}

/// All macaroon sequences presented by the request, from `macaroon-*` cookies
/// and the `Macaroons` header. Undecodable values are skipped.
pub fn request_macaroons(headers: &HeaderMap) -> Vec<Vec<Macaroon>> {
    let mut sequences = Vec::new();

    for header in headers.get_all(COOKIE) {
        let Ok(cookies) = header.to_str() else {
            continue;
        };
        for cookie in cookies.split(';') {
            let Some((name, value)) = cookie.trim().split_once('=') else {
                continue;
            };
            if !name.starts_with(MACAROON_COOKIE_PREFIX) {
                continue;
            }
            match decode_slice(value) {
                Ok(sequence) => sequences.push(sequence),
                Err(e) => debug!(cookie = name, error = %e, "ignoring undecodable macaroon cookie"),
            }
        }
    }

    for header in headers.get_all(MACAROONS_HEADER) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        match decode_slice(value) {
            Ok(sequence) => sequences.push(sequence),
            Err(e) => debug!(error = %e, "ignoring undecodable Macaroons header"),
        }
    }

    sequences
}
