//! # Huddle Core
//!
//! Call signaling for the Huddle team dashboard: two clients establish a
//! peer-to-peer voice or video call using a shared document store as the
//! out-of-band signaling channel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         HUDDLE CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │                      ┌──────────────────────────┐                       │
//! │                      │      Call Lifecycle      │                       │
//! │                      │  begin / toggle / end    │                       │
//! │                      └────┬────────┬────────┬───┘                       │
//! │                           │        │        │                           │
//! │          ┌────────────────┘        │        └──────────────┐            │
//! │          ▼                         ▼                       ▼            │
//! │  ┌──────────────┐        ┌──────────────────┐      ┌──────────────┐     │
//! │  │    Media     │        │  Peer Connection │      │   Identity   │     │
//! │  │ - acquire    │ tracks │ - offer/answer   │      │ - call id    │     │
//! │  │ - toggle     │───────►│ - candidates     │      │              │     │
//! │  │ - release    │        │ - remote stream  │      └──────────────┘     │
//! │  └──────────────┘        └────────┬─────────┘                           │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │                        ┌──────────────────────┐                         │
//! │                        │   Signaling Store    │                         │
//! │                        │ - Memory / Remote    │                         │
//! │                        └──────────────────────┘                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - ICE servers and store layout
//! - [`identity`] - Participant ids and the shared call id
//! - [`store`] - Signaling store trait, in-memory store, relay client
//! - [`signaling`] - Session and candidate records
//! - [`media`] - Local capture
//! - [`peer`] - Peer connection controller
//! - [`call`] - Call lifecycle manager
//!
//! ## Platform Support
//!
//! | Platform | Media / Transport | Store |
//! |----------|-------------------|-------|
//! | Web (wasm32) | `getUserMedia` / `RTCPeerConnection` | any [`SignalingStore`] |
//! | Native | host-provided | [`MemoryStore`], [`RemoteStore`] |

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod call;
pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod store;

mod runtime;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use call::{CallEvent, CallManager, CallMode, CallStatus};
pub use config::{CallConfig, IceServer};
pub use error::{Error, Result};
pub use identity::{resolve_call_id, CallId, ParticipantId};
pub use media::{LocalMediaStream, MediaAcquirer, MediaDevices, MediaKind};
pub use peer::{ControllerState, PeerConnectionController, PeerEvent, RemoteMediaStream};
pub use signaling::Role;
pub use store::{MemoryStore, SignalingStore};

#[cfg(not(target_arch = "wasm32"))]
pub use store::RemoteStore;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Get the library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Route panics and `tracing` output to the browser console.
#[cfg(target_arch = "wasm32")]
pub fn init_browser_logging() {
    console_error_panic_hook::set_once();
    tracing_wasm::set_as_global_default();
}
