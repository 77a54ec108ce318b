//! Process-wide server configuration

use std::path::PathBuf;
use std::time::Duration;

use waypost_bakery::KeyPair;

/// Default rendezvous time-to-live
pub const DEFAULT_RENDEZVOUS_TTL: Duration = Duration::from_secs(10 * 60);

/// Default external group cache time-to-live
pub const DEFAULT_GROUP_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Configuration parameters for a server
#[derive(Debug, Clone)]
pub struct ServerParams {
    /// Username for admin basic-auth login
    pub auth_username: String,

    /// Password for admin basic-auth login
    pub auth_password: String,

    /// The service keypair; generated at startup when absent
    pub key: Option<KeyPair>,

    /// Externally accessible base URL of the service, without a trailing
    /// slash
    pub location: String,

    /// Base URL of the external group service, if any
    pub launchpad: Option<String>,

    /// Maximum number of concurrent store sessions
    pub max_sessions: usize,

    /// How long a request may wait for a store session before failing
    pub request_timeout: Duration,

    /// Dialable address (no port) used for rendezvous forwarding between
    /// identity server instances
    pub private_addr: String,

    /// How long a rendezvous entry lives before it is garbage collected
    pub rendezvous_ttl: Duration,

    /// Directory served under `/static/*`, if any
    pub static_dir: Option<PathBuf>,

    /// Return the identity macaroon as a cookie from the wait endpoint.
    ///
    /// Any caller of the wait endpoint can capture this cookie, so
    /// deployments that only serve browser agents should turn it off.
    pub insecure_wait_cookie: bool,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            auth_username: String::new(),
            auth_password: String::new(),
            key: None,
            location: "http://localhost:8081".to_string(),
            launchpad: None,
            max_sessions: 100,
            request_timeout: Duration::from_secs(5),
            private_addr: "localhost".to_string(),
            rendezvous_ttl: DEFAULT_RENDEZVOUS_TTL,
            static_dir: None,
            insecure_wait_cookie: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = ServerParams::default();
        assert_eq!(params.rendezvous_ttl, Duration::from_secs(600));
        assert_eq!(params.max_sessions, 100);
        assert!(params.key.is_none());
        assert!(params.insecure_wait_cookie);
    }
}
