//! waypost - macaroon-based identity and authorization server
//!
//! waypost discharges third-party caveats for target services: a client
//! holding a macaroon with a caveat addressed to this service brings it here,
//! proves who it is (or is sent through an interactive login), and receives a
//! discharge macaroon attesting the caveat's condition.
//!
//! # Architecture
//!
//! ```text
//! client ──► /v1/discharge ──► authorizer ──► discharge engine ──► discharge
//!               │ (no creds)                        ▲
//!               ▼                                   │ identity macaroon
//!          rendezvous place ◄── login agent ──► /v1/wait
//! ```
//!
//! # Endpoints
//!
//! - `POST|GET /v1/discharge` - discharge a third-party caveat
//! - `GET /v1/wait` - block until an interactive login completes
//! - `GET /v1/discharge-token-for-user` - admin-only discharge token minting
//! - `GET /static/*` - static files, when configured
//!
//! A separate listener bound to the private address serves
//! `POST /v1/rendezvous/done`, the completion forwarding endpoint between
//! instances; it is never mounted on the public router.
//!
//! # Modules
//!
//! - [`auth`] - request authorization and identity polymorphism
//! - [`discharge`] - the discharge protocol engine
//! - [`error`] - error taxonomy and wire form
//! - [`groups`] - external group resolution with TTL caching
//! - [`meeting`] - the rendezvous place
//! - [`params`] - process-wide configuration
//! - [`server`] - the HTTP dispatch shell
//! - [`store`] - identity records and the bounded session pool

#![deny(missing_docs)]

pub mod auth;
pub mod discharge;
pub mod error;
pub mod groups;
pub mod meeting;
pub mod params;
pub mod server;
pub mod store;

pub use error::{Error, Result};
pub use params::ServerParams;
pub use server::{build_private_router, build_router, build_state, serve, AppState};
