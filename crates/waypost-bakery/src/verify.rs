//! Macaroon chain verification
//!
//! Recomputes the signature chain from the root key, checks every first-party
//! condition against the namespace, resolves every third-party caveat against
//! a bound discharge, and extracts the declared attributes the chain carries.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::checkers::{parse_caveat, CheckContext, Namespace, COND_DECLARED};
use crate::crypto::{chain, chain2, open, KEY_LEN};
use crate::error::{Error, Result};
use crate::macaroon::{bind_signature, Macaroon};

/// Maximum depth of nested third-party caveats
const MAX_DEPTH: usize = 10;

/// Verify `primary` against its root key and the given discharges.
///
/// Returns the declared attributes collected across the whole chain.
/// Conflicting declarations of the same key fail verification.
pub fn verify(
    primary: &Macaroon,
    root_key: &[u8; KEY_LEN],
    namespace: &Namespace,
    ctx: &CheckContext,
    discharges: &[Macaroon],
) -> Result<HashMap<String, String>> {
    let mut declared = HashMap::new();
    let sig = verify_chain(
        primary,
        root_key,
        namespace,
        ctx,
        discharges,
        &primary.signature,
        &mut declared,
        0,
    )?;
    if sig != primary.signature {
        return Err(Error::VerificationFailed("signature mismatch".to_string()));
    }
    Ok(declared)
}

#[allow(clippy::too_many_arguments)]
fn verify_chain(
    m: &Macaroon,
    key: &[u8; KEY_LEN],
    namespace: &Namespace,
    ctx: &CheckContext,
    discharges: &[Macaroon],
    primary_sig: &[u8; KEY_LEN],
    declared: &mut HashMap<String, String>,
    depth: usize,
) -> Result<[u8; KEY_LEN]> {
    if depth > MAX_DEPTH {
        return Err(Error::VerificationFailed(
            "third-party caveats nested too deeply".to_string(),
        ));
    }

    let mut sig = chain(key, m.id.as_bytes());
    for caveat in &m.caveats {
        match &caveat.verification_id {
            None => {
                check_first_party(namespace, ctx, declared, &caveat.id)?;
                sig = chain(&sig, caveat.id.as_bytes());
            }
            Some(vid) => {
                let vid_bytes = URL_SAFE_NO_PAD
                    .decode(vid)
                    .map_err(|_| Error::Decode("verification id".to_string()))?;
                let caveat_key: [u8; KEY_LEN] = open(&sig, &vid_bytes)?
                    .try_into()
                    .map_err(|_| Error::Decode("discharge root key".to_string()))?;

                let discharge = discharges
                    .iter()
                    .find(|d| d.id == caveat.id)
                    .ok_or_else(|| {
                        Error::VerificationFailed(format!(
                            "no discharge for caveat addressed to {:?}",
                            caveat.location.as_deref().unwrap_or("unknown")
                        ))
                    })?;
                let discharge_sig = verify_chain(
                    discharge,
                    &caveat_key,
                    namespace,
                    ctx,
                    discharges,
                    primary_sig,
                    declared,
                    depth + 1,
                )?;
                if bind_signature(primary_sig, &discharge_sig) != discharge.signature {
                    return Err(Error::VerificationFailed(
                        "discharge macaroon not bound to request".to_string(),
                    ));
                }

                sig = chain2(&sig, vid.as_bytes(), caveat.id.as_bytes());
            }
        }
    }
    Ok(sig)
}

fn check_first_party(
    namespace: &Namespace,
    ctx: &CheckContext,
    declared: &mut HashMap<String, String>,
    condition: &str,
) -> Result<()> {
    let (name, args) = parse_caveat(condition)?;
    if name == COND_DECLARED {
        let (key, value) = args.split_once(' ').ok_or_else(|| {
            Error::CaveatNotSatisfied(format!("malformed declared caveat {args:?}"))
        })?;
        if let Some(previous) = declared.get(key) {
            if previous != value {
                return Err(Error::VerificationFailed(format!(
                    "conflicting declarations for {key:?}"
                )));
            }
        }
        declared.insert(key.to_string(), value.to_string());
        return Ok(());
    }
    namespace.check(ctx, condition)
}
