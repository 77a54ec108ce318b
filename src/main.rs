//! waypost - identity server process startup

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use waypost::meeting::spawn_sweeper;
use waypost::store::MemBackend;
use waypost::{build_state, serve, ServerParams};

/// waypost - macaroon-based identity and authorization server
#[derive(Parser, Debug)]
#[command(name = "waypost", version, about, long_about = None)]
struct Cli {
    /// Address to bind the public HTTP server
    #[arg(long, default_value = "0.0.0.0:8081")]
    addr: SocketAddr,

    /// Externally accessible base URL of the service, without a trailing
    /// slash
    #[arg(long, env = "WAYPOST_LOCATION", default_value = "http://localhost:8081")]
    location: String,

    /// Username for admin basic-auth login
    #[arg(long, env = "WAYPOST_AUTH_USERNAME", default_value = "admin")]
    auth_username: String,

    /// Password for admin basic-auth login; admin access is disabled when
    /// empty
    #[arg(long, env = "WAYPOST_AUTH_PASSWORD", default_value = "")]
    auth_password: String,

    /// Base URL of the external group service
    #[arg(long, env = "WAYPOST_LAUNCHPAD")]
    launchpad: Option<String>,

    /// Maximum number of concurrent store sessions
    #[arg(long, default_value = "100")]
    max_sessions: usize,

    /// Seconds a request may wait for a store session
    #[arg(long, default_value = "5")]
    request_timeout_secs: u64,

    /// Dialable address (no port) for rendezvous forwarding between
    /// instances
    #[arg(long, env = "WAYPOST_PRIVATE_ADDR", default_value = "localhost")]
    private_addr: String,

    /// Directory to serve under /static/*
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Do not return the identity macaroon as a cookie from /v1/wait
    #[arg(long)]
    secure_wait: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.auth_password.is_empty() {
        tracing::warn!("no admin password configured; admin endpoints are disabled");
    }

    let params = ServerParams {
        auth_username: cli.auth_username,
        auth_password: cli.auth_password,
        location: cli.location,
        launchpad: cli.launchpad,
        max_sessions: cli.max_sessions,
        request_timeout: Duration::from_secs(cli.request_timeout_secs),
        private_addr: cli.private_addr,
        static_dir: cli.static_dir,
        insecure_wait_cookie: !cli.secure_wait,
        ..ServerParams::default()
    };

    let state = build_state(params, Arc::new(MemBackend::new()))
        .map_err(|e| anyhow::anyhow!("cannot build server state: {e}"))?;
    spawn_sweeper(state.place.clone(), Duration::from_secs(30));

    serve(cli.addr, state)
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;
    Ok(())
}
