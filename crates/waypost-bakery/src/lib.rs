//! Macaroon primitives for the waypost identity service.
//!
//! A macaroon is a bearer token carrying a chain of caveats (predicates) under
//! an HMAC-SHA256 signature chain. First-party caveats are checked locally
//! against a [`checkers::Namespace`]; third-party caveats delegate a condition
//! to another service, which satisfies it by issuing a discharge macaroon.
//!
//! # Modules
//!
//! - [`caveat`] - first- and third-party caveat model
//! - [`macaroon`] - the macaroon itself: signature chain, binding, encoding
//! - [`checkers`] - condition parsing and the first-party checker namespace
//! - [`verify`] - chain verification against a set of discharges
//! - [`oven`] - minting: operations, macaroon ids, third-party locator
//! - [`rootkey`] - root key storage with expiry
//! - [`keys`] - the service keypair
//! - [`crypto`] - HMAC links and caveat-id sealing
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod caveat;
pub mod checkers;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod macaroon;
pub mod oven;
pub mod rootkey;
pub mod verify;

pub use caveat::Caveat;
pub use checkers::{CheckContext, Namespace};
pub use error::{Error, Result};
pub use keys::KeyPair;
pub use macaroon::Macaroon;
pub use oven::{
    decode_caveat, login_op, MacaroonId, Op, Oven, OvenParams, ThirdPartyCaveatInfo,
    ThirdPartyInfo, ThirdPartyStore,
};
pub use rootkey::{MemoryRootKeyStore, RootKeyStore};
pub use verify::verify;
