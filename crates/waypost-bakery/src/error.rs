//! Error types for macaroon operations

/// Result type for macaroon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for macaroon operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caveat condition names no registered checker
    #[error("caveat not recognized: {0:?}")]
    CaveatNotRecognized(String),

    /// A first-party caveat condition was checked and found false
    #[error("caveat not satisfied: {0}")]
    CaveatNotSatisfied(String),

    /// The signature chain or discharge binding does not hold
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The referenced root key does not exist or has expired
    #[error("unknown root key {0:?}")]
    UnknownRootKey(String),

    /// A macaroon, caveat, or id could not be decoded
    #[error("cannot decode {0}")]
    Decode(String),

    /// A caveat id could not be sealed
    #[error("cannot seal caveat id: {0}")]
    Seal(String),
}
