//! Caveat model
//!
//! A caveat restricts the authority a macaroon conveys. First-party caveats
//! are conditions the verifying service checks itself; third-party caveats
//! carry an opaque id that a named third party must discharge.

use serde::{Deserialize, Serialize};

/// A restriction on the authority granted by a macaroon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    /// The condition (first-party) or opaque caveat id (third-party)
    pub id: String,

    /// Verification id: the discharge root key sealed under the macaroon
    /// signature at the time the caveat was added (third-party only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<String>,

    /// Location of the third party expected to discharge the caveat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Caveat {
    /// Create a first-party caveat with the given condition
    pub fn first_party(condition: impl Into<String>) -> Self {
        Self {
            id: condition.into(),
            verification_id: None,
            location: None,
        }
    }

    /// True if this caveat is checked by the service verifying the macaroon
    pub fn is_first_party(&self) -> bool {
        self.verification_id.is_none()
    }

    /// True if a third party must discharge this caveat
    pub fn is_third_party(&self) -> bool {
        !self.is_first_party()
    }
}
