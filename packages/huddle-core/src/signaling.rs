//! # Signaling Records
//!
//! Typed records stored in the signaling store and the paths they live at.
//!
//! ```text
//! calls/{callId}                          CallSession  { offer, answer?, callerId, createdAt }
//! calls/{callId}/callerCandidates/{id}    IceCandidate { candidate, sdpMid, sdpMLineIndex }
//! calls/{callId}/calleeCandidates/{id}    IceCandidate
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::identity::{CallId, ParticipantId};
use crate::store::{CollectionPath, Document, DocumentPath};

/// Collection holding the caller's candidates
pub const CALLER_CANDIDATES: &str = "callerCandidates";
/// Collection holding the callee's candidates
pub const CALLEE_CANDIDATES: &str = "calleeCandidates";

// ============================================================================
// SESSION DESCRIPTIONS
// ============================================================================

/// Which half of the offer/answer exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Sent by the caller
    Offer,
    /// Sent by the callee
    Answer,
}

/// An SDP blob tagged with its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Raw SDP
    pub sdp: String,
}

impl SessionDescription {
    /// An offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A single ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate string
    pub candidate: String,
    /// SDP mid
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP m-line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Store representation.
    pub fn to_document(&self) -> Result<Document> {
        to_document(self)
    }

    /// Parse a stored candidate.
    pub fn from_document(document: Document) -> Result<Self> {
        from_document(document)
    }
}

// ============================================================================
// ROLES
// ============================================================================

/// Negotiation role of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Found no session and wrote the offer
    Caller,
    /// Found the other participant's offer and wrote the answer
    Callee,
}

impl Role {
    /// The other side's role.
    pub fn peer(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }

    /// Name of the candidate collection this role writes to.
    pub fn candidates_collection(self) -> &'static str {
        match self {
            Role::Caller => CALLER_CANDIDATES,
            Role::Callee => CALLEE_CANDIDATES,
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// The session document coordinating one call's offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    /// The caller's offer
    pub offer: SessionDescription,
    /// The callee's answer, once written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Who wrote the offer
    pub caller_id: ParticipantId,
    /// Unix millis when the offer was written
    #[serde(default)]
    pub created_at: i64,
}

impl CallSession {
    /// A fresh session carrying only the caller's offer.
    pub fn new(offer: SessionDescription, caller_id: ParticipantId) -> Self {
        Self {
            offer,
            answer: None,
            caller_id,
            created_at: now_millis(),
        }
    }

    /// Store representation.
    pub fn to_document(&self) -> Result<Document> {
        to_document(self)
    }

    /// Parse a stored session.
    pub fn from_document(document: Document) -> Result<Self> {
        from_document(document)
    }

    /// The partial update that records the callee's answer.
    pub fn answer_update(answer: &SessionDescription) -> Result<Document> {
        let mut partial = Document::new();
        partial.insert("answer".to_string(), serde_json::to_value(answer)?);
        Ok(partial)
    }
}

// ============================================================================
// PATHS
// ============================================================================

/// Every store path used by one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPaths {
    /// `calls/{callId}`
    pub session: DocumentPath,
    /// `calls/{callId}/callerCandidates`
    pub caller_candidates: CollectionPath,
    /// `calls/{callId}/calleeCandidates`
    pub callee_candidates: CollectionPath,
}

impl CallPaths {
    /// Paths for `call_id` under the configured sessions collection.
    pub fn new(config: &CallConfig, call_id: &CallId) -> Result<Self> {
        let sessions = CollectionPath::new(config.sessions_collection.as_str())?;
        let session = sessions.doc(call_id.as_str());
        Ok(Self {
            caller_candidates: session.collection(CALLER_CANDIDATES),
            callee_candidates: session.collection(CALLEE_CANDIDATES),
            session,
        })
    }

    /// Candidate collection written by `role`.
    pub fn candidates(&self, role: Role) -> &CollectionPath {
        match role {
            Role::Caller => &self.caller_candidates,
            Role::Callee => &self.callee_candidates,
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Current time as unix millis.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::SerializationError(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

fn from_document<T: DeserializeOwned>(document: Document) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(document))
        .map_err(|e| Error::MalformedDocument(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_id() -> CallId {
        let a = ParticipantId::new("alice").unwrap();
        let b = ParticipantId::new("bob").unwrap();
        crate::identity::resolve_call_id(&a, &b).unwrap()
    }

    #[test]
    fn test_session_document_field_names() {
        let session = CallSession::new(
            SessionDescription::offer("v=0"),
            ParticipantId::new("alice").unwrap(),
        );
        let doc = session.to_document().unwrap();

        assert_eq!(doc["offer"], json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(doc["callerId"], json!("alice"));
        assert!(doc["createdAt"].as_i64().unwrap() > 0);
        assert!(!doc.contains_key("answer"));
    }

    #[test]
    fn test_session_with_answer_parses() {
        let doc = json!({
            "offer": {"type": "offer", "sdp": "o"},
            "answer": {"type": "answer", "sdp": "a"},
            "callerId": "bob",
        });
        let session = CallSession::from_document(doc.as_object().cloned().unwrap()).unwrap();
        assert_eq!(session.answer, Some(SessionDescription::answer("a")));
        assert_eq!(session.caller_id.as_str(), "bob");
        assert_eq!(session.created_at, 0);
    }

    #[test]
    fn test_missing_offer_is_malformed() {
        let doc = json!({"callerId": "bob"}).as_object().cloned().unwrap();
        assert!(matches!(
            CallSession::from_document(doc),
            Err(Error::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_answer_update_contains_only_answer() {
        let partial = CallSession::answer_update(&SessionDescription::answer("a")).unwrap();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial["answer"]["type"], "answer");
    }

    #[test]
    fn test_candidate_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let doc = candidate.to_document().unwrap();
        assert!(doc.contains_key("sdpMid"));
        assert!(doc.contains_key("sdpMLineIndex"));
        assert_eq!(IceCandidate::from_document(doc).unwrap(), candidate);
    }

    #[test]
    fn test_call_paths() {
        let paths = CallPaths::new(&CallConfig::default(), &call_id()).unwrap();
        assert_eq!(paths.session.as_str(), "calls/alice_bob");
        assert_eq!(
            paths.candidates(Role::Caller).as_str(),
            "calls/alice_bob/callerCandidates"
        );
        assert_eq!(
            paths.candidates(Role::Caller.peer()).as_str(),
            "calls/alice_bob/calleeCandidates"
        );
    }
}
