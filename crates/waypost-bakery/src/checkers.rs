//! Condition parsing and the first-party checker namespace
//!
//! Conditions are space-separated predicates such as
//! `time-before 2030-01-01T00:00:00Z` or `declared username alice`. The first
//! whitespace-delimited token selects the checker; the remainder is its
//! argument string.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::caveat::Caveat;
use crate::error::{Error, Result};

/// Condition prefix for expiry caveats
pub const COND_TIME_BEFORE: &str = "time-before";

/// Condition prefix for declared attributes
pub const COND_DECLARED: &str = "declared";

/// Condition prefix for origin-restriction caveats
pub const COND_CLIENT_ORIGIN: &str = "client-origin";

/// Context a first-party condition is checked against
#[derive(Debug, Clone)]
pub struct CheckContext {
    /// Verification-time instant
    pub now: DateTime<Utc>,
    /// The `Origin` of the request presenting the macaroon, if any
    pub origin: Option<String>,
}

impl CheckContext {
    /// Context for the current instant with the given request origin
    pub fn new(origin: Option<String>) -> Self {
        Self {
            now: Utc::now(),
            origin,
        }
    }
}

/// Split a condition into its name and argument string.
///
/// The name is everything up to the first space; the remainder (possibly
/// empty) is the argument string.
pub fn parse_caveat(condition: &str) -> Result<(&str, &str)> {
    if condition.is_empty() {
        return Err(Error::Decode("empty caveat condition".to_string()));
    }
    Ok(match condition.split_once(' ') {
        Some((name, args)) => (name, args),
        None => (condition, ""),
    })
}

type CheckerFn = fn(&CheckContext, &str) -> Result<()>;

/// Registry of first-party condition checkers
#[derive(Clone)]
pub struct Namespace {
    checkers: HashMap<String, CheckerFn>,
}

impl Namespace {
    /// The standard namespace: `time-before`, `declared`, `client-origin`
    pub fn std() -> Self {
        let mut ns = Self {
            checkers: HashMap::new(),
        };
        ns.register(COND_TIME_BEFORE, check_time_before);
        ns.register(COND_DECLARED, check_declared_form);
        ns.register(COND_CLIENT_ORIGIN, check_client_origin);
        ns
    }

    /// Register a checker for a condition name
    pub fn register(&mut self, name: &str, checker: CheckerFn) {
        self.checkers.insert(name.to_string(), checker);
    }

    /// Check a full condition string against the context
    pub fn check(&self, ctx: &CheckContext, condition: &str) -> Result<()> {
        let (name, args) = parse_caveat(condition)?;
        let checker = self
            .checkers
            .get(name)
            .ok_or_else(|| Error::CaveatNotRecognized(condition.to_string()))?;
        checker(ctx, args)
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.checkers.keys().collect();
        names.sort();
        f.debug_struct("Namespace").field("conditions", &names).finish()
    }
}

fn check_time_before(ctx: &CheckContext, args: &str) -> Result<()> {
    let t = DateTime::parse_from_rfc3339(args)
        .map_err(|_| Error::CaveatNotSatisfied(format!("bad time in time-before {args:?}")))?;
    if ctx.now < t.with_timezone(&Utc) {
        Ok(())
    } else {
        Err(Error::CaveatNotSatisfied("macaroon has expired".to_string()))
    }
}

// Declared values are extracted by the verifier; the checker only validates
// the form.
fn check_declared_form(_ctx: &CheckContext, args: &str) -> Result<()> {
    match args.split_once(' ') {
        Some((key, _)) if !key.is_empty() => Ok(()),
        _ => Err(Error::CaveatNotSatisfied(format!(
            "malformed declared caveat {args:?}"
        ))),
    }
}

fn check_client_origin(ctx: &CheckContext, args: &str) -> Result<()> {
    let origin = ctx.origin.as_deref().unwrap_or("");
    if origin == args {
        Ok(())
    } else {
        Err(Error::CaveatNotSatisfied(format!(
            "request origin {origin:?} does not match {args:?}"
        )))
    }
}

/// Caveat limiting a macaroon's validity to before `t`
pub fn time_before_caveat(t: DateTime<Utc>) -> Caveat {
    Caveat::first_party(format!(
        "{COND_TIME_BEFORE} {}",
        t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ))
}

/// Caveat declaring an attribute key/value pair
pub fn declared_caveat(key: &str, value: &str) -> Caveat {
    Caveat::first_party(format!("{COND_DECLARED} {key} {value}"))
}

/// Caveat restricting use of a macaroon to requests from `origin`
pub fn client_origin_caveat(origin: &str) -> Caveat {
    Caveat::first_party(format!("{COND_CLIENT_ORIGIN} {origin}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ctx() -> CheckContext {
        CheckContext::new(None)
    }

    #[test]
    fn test_parse_caveat_splits_on_first_space() {
        assert_eq!(
            parse_caveat("is-member-of ops sre").unwrap(),
            ("is-member-of", "ops sre")
        );
        assert_eq!(
            parse_caveat("is-authenticated-user").unwrap(),
            ("is-authenticated-user", "")
        );
    }

    #[test]
    fn test_parse_caveat_rejects_empty() {
        assert!(parse_caveat("").is_err());
    }

    #[test]
    fn test_time_before_future_passes() {
        let caveat = time_before_caveat(Utc::now() + Duration::hours(1));
        assert!(Namespace::std().check(&ctx(), &caveat.id).is_ok());
    }

    #[test]
    fn test_time_before_past_fails() {
        let caveat = time_before_caveat(Utc::now() - Duration::hours(1));
        let err = Namespace::std().check(&ctx(), &caveat.id).unwrap_err();
        assert!(matches!(err, Error::CaveatNotSatisfied(_)));
    }

    #[test]
    fn test_time_before_garbage_fails() {
        let err = Namespace::std()
            .check(&ctx(), "time-before not-a-time")
            .unwrap_err();
        assert!(matches!(err, Error::CaveatNotSatisfied(_)));
    }

    #[test]
    fn test_client_origin_matches_exactly() {
        let ns = Namespace::std();
        let ctx_a = CheckContext::new(Some("https://a.example.com".to_string()));
        assert!(ns.check(&ctx_a, "client-origin https://a.example.com").is_ok());
        assert!(ns.check(&ctx_a, "client-origin https://b.example.com").is_err());
    }

    #[test]
    fn test_client_origin_absent_matches_empty() {
        let ns = Namespace::std();
        assert!(ns.check(&ctx(), "client-origin ").is_ok());
        assert!(ns.check(&ctx(), "client-origin https://a.example.com").is_err());
    }

    #[test]
    fn test_unknown_condition_is_not_recognized() {
        let err = Namespace::std().check(&ctx(), "is-full-moon").unwrap_err();
        assert!(matches!(err, Error::CaveatNotRecognized(_)));
    }

    #[test]
    fn test_declared_caveat_form() {
        let caveat = declared_caveat("username", "alice");
        assert_eq!(caveat.id, "declared username alice");
        assert!(Namespace::std().check(&ctx(), &caveat.id).is_ok());
        assert!(Namespace::std().check(&ctx(), "declared ").is_err());
    }
}
