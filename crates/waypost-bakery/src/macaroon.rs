//! The macaroon: a bearer token under an HMAC-SHA256 signature chain
//!
//! The chain starts at `HMAC(root_key, id)` and folds in every caveat in
//! order, so neither the id nor any caveat can be altered or dropped without
//! invalidating the signature. Discharge macaroons are bound to the macaroon
//! they discharge before being presented.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::caveat::Caveat;
use crate::crypto::{chain, chain2, seal, KEY_LEN};
use crate::error::{Error, Result};

/// Payload sealed into a third-party caveat id
#[derive(Serialize, Deserialize)]
pub(crate) struct CaveatPayload {
    /// Discharge root key, base64
    pub root_key: String,
    /// The condition the third party must check
    pub condition: String,
}

/// A macaroon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macaroon {
    /// Hint naming the service that minted this macaroon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// The macaroon identifier; for minted macaroons this encodes the root
    /// key id and the authorized operations
    pub id: String,

    /// Caveats, in the order they were added
    pub caveats: Vec<Caveat>,

    /// Current chain signature
    #[serde(with = "sig_serde")]
    pub signature: [u8; KEY_LEN],
}

impl Macaroon {
    /// Create a macaroon with no caveats
    pub fn new(root_key: &[u8], id: impl Into<String>, location: Option<String>) -> Self {
        let id = id.into();
        let signature = chain(root_key, id.as_bytes());
        Self {
            location,
            id,
            caveats: Vec::new(),
            signature,
        }
    }

    /// Append a first-party caveat with the given condition
    pub fn add_first_party_caveat(&mut self, condition: &str) {
        self.signature = chain(&self.signature, condition.as_bytes());
        self.caveats.push(Caveat::first_party(condition));
    }

    /// Append a third-party caveat addressed to the service described by
    /// `info`, delegating `condition`.
    ///
    /// Generates a fresh discharge root key, seals `{root_key, condition}`
    /// into the caveat id under the third party's key, and seals the root key
    /// under the current signature so the verifier can recover it.
    pub fn add_third_party_caveat(
        &mut self,
        info: &crate::oven::ThirdPartyInfo,
        condition: &str,
        location: &str,
    ) -> Result<()> {
        let mut root_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut root_key);

        let payload = CaveatPayload {
            root_key: URL_SAFE_NO_PAD.encode(root_key),
            condition: condition.to_string(),
        };
        let payload_json =
            serde_json::to_vec(&payload).map_err(|e| Error::Seal(e.to_string()))?;
        let id = URL_SAFE_NO_PAD.encode(seal(&info.key, &payload_json)?);
        let verification_id = URL_SAFE_NO_PAD.encode(seal(&self.signature, &root_key)?);

        self.signature = chain2(&self.signature, verification_id.as_bytes(), id.as_bytes());
        self.caveats.push(Caveat {
            id,
            verification_id: Some(verification_id),
            location: Some(location.to_string()),
        });
        Ok(())
    }

    /// Bind this discharge macaroon to the macaroon it discharges.
    ///
    /// The bound copy is what a client presents; an unbound discharge fails
    /// verification.
    pub fn bind_for_request(&self, primary: &Macaroon) -> Macaroon {
        let mut bound = self.clone();
        bound.signature = bind_signature(&primary.signature, &self.signature);
        bound
    }

    /// Encode to base64(JSON) for cookies and headers
    pub fn encode64(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode from the [`encode64`](Self::encode64) representation
    pub fn decode64(data: &str) -> Result<Self> {
        let json = URL_SAFE_NO_PAD
            .decode(data)
            .map_err(|_| Error::Decode("macaroon base64".to_string()))?;
        serde_json::from_slice(&json).map_err(|_| Error::Decode("macaroon json".to_string()))
    }
}

/// Compute the bound signature of a discharge
pub(crate) fn bind_signature(
    primary_sig: &[u8; KEY_LEN],
    discharge_sig: &[u8; KEY_LEN],
) -> [u8; KEY_LEN] {
    chain2(&[0u8; KEY_LEN], primary_sig, discharge_sig)
}

/// Encode a macaroon sequence (primary plus discharges) to base64(JSON)
pub fn encode_slice(slice: &[Macaroon]) -> Result<String> {
    let json = serde_json::to_vec(slice).map_err(|e| Error::Decode(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a macaroon sequence from base64(JSON)
pub fn decode_slice(data: &str) -> Result<Vec<Macaroon>> {
    let json = URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|_| Error::Decode("macaroon sequence base64".to_string()))?;
    serde_json::from_slice(&json)
        .map_err(|_| Error::Decode("macaroon sequence json".to_string()))
}

mod sig_serde {
    //! Signatures travel as base64 strings rather than byte arrays

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::crypto::KEY_LEN;

    pub fn serialize<S: Serializer>(sig: &[u8; KEY_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_NO_PAD.encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; KEY_LEN], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 32 bytes"))
    }
}
