//! # Error Handling
//!
//! Error types for Huddle Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Call Lifecycle Errors                                             │
//! │  │   ├── NotReady              - No usable local media for the call    │
//! │  │   ├── AlreadyStarted        - Call or controller already running    │
//! │  │   ├── CallEnded             - Call instance was already torn down   │
//! │  │   └── PeerEnded             - Remote side deleted the session       │
//! │  │                                                                      │
//! │  ├── Identity Errors                                                   │
//! │  │   └── InvalidParticipant    - Empty id or self-call                 │
//! │  │                                                                      │
//! │  ├── Media Errors                                                      │
//! │  │   ├── PermissionDenied      - Capture refused by user/environment   │
//! │  │   ├── DeviceUnavailable     - No capture device                     │
//! │  │   └── MediaFailed           - Any other capture failure             │
//! │  │                                                                      │
//! │  ├── Store Errors                                                      │
//! │  │   ├── StoreUnavailable      - Signaling store operation failed      │
//! │  │   ├── DocumentNotFound      - Update of a missing document          │
//! │  │   └── MalformedDocument     - Document does not match its schema    │
//! │  │                                                                      │
//! │  └── Negotiation Errors                                                │
//! │      ├── NegotiationFailed     - Offer/answer exchange failed          │
//! │      └── TransportError        - Host transport rejected an operation  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for Huddle Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Huddle Core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Call Lifecycle Errors (100-199)
    // ========================================================================

    /// The controller was started without a successfully acquired local stream
    #[error("Call is not ready: local media has not been acquired.")]
    NotReady,

    /// The call (or its controller) has already been started
    #[error("Call has already been started.")]
    AlreadyStarted,

    /// The call instance was already ended and cannot be reused
    #[error("Call has already ended.")]
    CallEnded,

    /// The remote participant ended the call mid-negotiation
    #[error("The remote participant ended the call.")]
    PeerEnded,

    // ========================================================================
    // Identity Errors (200-299)
    // ========================================================================

    /// Participant id is empty or otherwise unusable for a call
    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    // ========================================================================
    // Media Errors (300-399)
    // ========================================================================

    /// Camera/microphone access was refused
    #[error("Camera and microphone access was denied.")]
    PermissionDenied,

    /// No capture device exists for a requested media kind
    #[error("No capture device is available.")]
    DeviceUnavailable,

    /// Capture failed for another reason
    #[error("Media capture failed: {0}")]
    MediaFailed(String),

    // ========================================================================
    // Store Errors (400-499)
    // ========================================================================

    /// A signaling store operation failed
    #[error("Signaling store unavailable: {0}")]
    StoreUnavailable(String),

    /// Update targeted a document that does not exist
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Document contents could not be read as the expected record
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    // ========================================================================
    // Negotiation Errors (500-599)
    // ========================================================================

    /// Offer/answer negotiation failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The host transport rejected an operation
    #[error("Transport error: {0}")]
    TransportError(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Call lifecycle
    /// - 200-299: Identity
    /// - 300-399: Media
    /// - 400-499: Store
    /// - 500-599: Negotiation
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            Error::NotReady => 100,
            Error::AlreadyStarted => 101,
            Error::CallEnded => 102,
            Error::PeerEnded => 103,

            Error::InvalidParticipant(_) => 200,

            Error::PermissionDenied => 300,
            Error::DeviceUnavailable => 301,
            Error::MediaFailed(_) => 302,

            Error::StoreUnavailable(_) => 400,
            Error::DocumentNotFound(_) => 401,
            Error::MalformedDocument(_) => 402,

            Error::NegotiationFailed(_) => 500,
            Error::TransportError(_) => 501,

            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
        }
    }

    /// Rebuild an error from a code and message received over the wire.
    ///
    /// Unit variants ignore the message; unknown codes become `Internal`.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            100 => Error::NotReady,
            101 => Error::AlreadyStarted,
            102 => Error::CallEnded,
            103 => Error::PeerEnded,
            200 => Error::InvalidParticipant(message),
            300 => Error::PermissionDenied,
            301 => Error::DeviceUnavailable,
            302 => Error::MediaFailed(message),
            400 => Error::StoreUnavailable(message),
            401 => Error::DocumentNotFound(message),
            402 => Error::MalformedDocument(message),
            500 => Error::NegotiationFailed(message),
            501 => Error::TransportError(message),
            901 => Error::SerializationError(message),
            _ => Error::Internal(message),
        }
    }

    /// The variant's payload, or its display text for variants without one.
    ///
    /// Paired with [`Error::code`] this is what [`Error::from_code`] expects.
    pub fn detail(&self) -> String {
        match self {
            Error::InvalidParticipant(m)
            | Error::MediaFailed(m)
            | Error::StoreUnavailable(m)
            | Error::DocumentNotFound(m)
            | Error::MalformedDocument(m)
            | Error::NegotiationFailed(m)
            | Error::TransportError(m)
            | Error::Internal(m)
            | Error::SerializationError(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying the call.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::TransportError(_))
    }

    /// Check if this error requires user action
    pub fn requires_user_action(&self) -> bool {
        matches!(self, Error::PermissionDenied | Error::DeviceUnavailable)
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
