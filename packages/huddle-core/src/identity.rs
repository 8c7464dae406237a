//! # Call Identity
//!
//! Participant ids come from the surrounding auth layer; the core only reads
//! them. Both sides of a call derive the same [`CallId`] from the pair of
//! participant ids, so neither needs to tell the other where the session lives.
//!
//! ```text
//! resolve_call_id("bob", "alice")  ──►  "alice_bob"
//! resolve_call_id("alice", "bob")  ──►  "alice_bob"
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between the two sorted participant ids.
pub const CALL_ID_SEPARATOR: &str = "_";

/// Stable identity of a call participant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Wrap a participant id, rejecting empty or whitespace-only input.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidParticipant("participant id is empty".into()));
        }
        Ok(Self(id))
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared identifier of a one-to-one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// The raw id, as used in store paths.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the call id shared by `a` and `b`.
///
/// Order-independent. A participant cannot call themselves.
pub fn resolve_call_id(a: &ParticipantId, b: &ParticipantId) -> Result<CallId> {
    if a.as_str().trim().is_empty() || b.as_str().trim().is_empty() {
        return Err(Error::InvalidParticipant("participant id is empty".into()));
    }
    if a == b {
        return Err(Error::InvalidParticipant(format!(
            "{} cannot call themselves",
            a
        )));
    }

    // Sort ids to ensure consistent ordering
    let (first, second) = if a < b { (a, b) } else { (b, a) };

    Ok(CallId(format!(
        "{}{}{}",
        first.as_str(),
        CALL_ID_SEPARATOR,
        second.as_str()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::new(id).unwrap()
    }

    #[test]
    fn test_call_id_is_order_independent() {
        let pairs = [
            ("alice", "bob"),
            ("u-9f2", "u-10a"),
            ("Zed", "amy"),
            ("same-prefix", "same-prefix-2"),
        ];
        for (a, b) in pairs {
            let ab = resolve_call_id(&pid(a), &pid(b)).unwrap();
            let ba = resolve_call_id(&pid(b), &pid(a)).unwrap();
            assert_eq!(ab, ba, "call id differs for ({}, {})", a, b);
        }
    }

    #[test]
    fn test_call_id_format() {
        let id = resolve_call_id(&pid("bob"), &pid("alice")).unwrap();
        assert_eq!(id.as_str(), "alice_bob");
    }

    #[test]
    fn test_different_pairs_get_different_ids() {
        let ab = resolve_call_id(&pid("alice"), &pid("bob")).unwrap();
        let ac = resolve_call_id(&pid("alice"), &pid("carol")).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn test_self_call_is_rejected() {
        let err = resolve_call_id(&pid("alice"), &pid("alice")).unwrap_err();
        assert!(matches!(err, Error::InvalidParticipant(_)));
    }

    #[test]
    fn test_empty_participant_is_rejected() {
        assert!(matches!(
            ParticipantId::new(""),
            Err(Error::InvalidParticipant(_))
        ));
        assert!(matches!(
            ParticipantId::new("   "),
            Err(Error::InvalidParticipant(_))
        ));
    }

    #[test]
    fn test_participant_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&pid("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
    }
}
