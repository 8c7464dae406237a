//! # Local Media
//!
//! Acquires the microphone (and optionally the camera), flips track
//! enablement for mute/video-off, and stops every track when the call ends.
//!
//! ```text
//! MediaAcquirer ── get_user_media ──► MediaDevices (host)
//!      │                                   │
//!      └──────── LocalMediaStream ◄────────┘  Vec<Arc<dyn CaptureTrack>>
//! ```
//!
//! Toggling enablement keeps the track attached to the transport, so muting
//! never renegotiates.

#[cfg(target_arch = "wasm32")]
pub mod browser;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Kind of a capture track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

/// What to ask the host for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Request a microphone track
    pub audio: bool,
    /// Request a camera track
    pub video: bool,
}

/// A live capture track provided by the host.
pub trait CaptureTrack: Send + Sync + fmt::Debug {
    /// Host-assigned track id
    fn id(&self) -> String;

    /// Audio or video
    fn kind(&self) -> MediaKind;

    /// Enable or disable the track without detaching it
    fn set_enabled(&self, enabled: bool);

    /// Whether the track currently carries media
    fn is_enabled(&self) -> bool;

    /// Stop capture; the track cannot be restarted
    fn stop(&self);

    /// False once stopped
    fn is_live(&self) -> bool;

    /// Access to the concrete track type for host adapters
    fn as_any(&self) -> &dyn Any;
}

/// Host capability that grants capture tracks.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Ask for tracks matching `constraints`.
    ///
    /// Fails with [`Error::PermissionDenied`] when the user or environment
    /// refuses, [`Error::DeviceUnavailable`] when no device exists.
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<dyn CaptureTrack>>>;
}

/// The local participant's captured media.
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<Arc<dyn CaptureTrack>>,
    released: AtomicBool,
}

impl LocalMediaStream {
    /// Wrap tracks granted by the host.
    pub fn new(tracks: Vec<Arc<dyn CaptureTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
            released: AtomicBool::new(false),
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Every track in the stream
    pub fn tracks(&self) -> &[Arc<dyn CaptureTrack>] {
        &self.tracks
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<dyn CaptureTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Whether the stream carries a camera track
    pub fn has_video(&self) -> bool {
        self.tracks_of(MediaKind::Video).next().is_some()
    }

    /// True once [`MediaAcquirer::release`] stopped the tracks
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Requests, toggles, and releases local capture.
#[derive(Clone)]
pub struct MediaAcquirer {
    devices: Arc<dyn MediaDevices>,
}

impl MediaAcquirer {
    /// Create an acquirer over a host capability.
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Request audio, plus video when `want_video`.
    pub async fn acquire(&self, want_video: bool) -> Result<LocalMediaStream> {
        let constraints = MediaConstraints {
            audio: true,
            video: want_video,
        };
        tracing::debug!(video = want_video, "Requesting local media");

        let tracks = self.devices.get_user_media(constraints).await.map_err(|e| {
            tracing::warn!(error = %e, "Local media request failed");
            e
        })?;
        let stream = LocalMediaStream::new(tracks);

        let has_audio = stream.tracks_of(MediaKind::Audio).next().is_some();
        if !has_audio || (want_video && !stream.has_video()) {
            self.release(Some(&stream));
            return Err(Error::DeviceUnavailable);
        }

        tracing::info!(
            stream = stream.id(),
            tracks = stream.tracks().len(),
            "Acquired local media"
        );
        Ok(stream)
    }

    /// Enable or disable every track of `kind`. Returns how many were changed.
    pub fn set_track_enabled(
        &self,
        stream: &LocalMediaStream,
        kind: MediaKind,
        enabled: bool,
    ) -> usize {
        let mut changed = 0;
        for track in stream.tracks_of(kind) {
            track.set_enabled(enabled);
            changed += 1;
        }
        tracing::debug!(?kind, enabled, changed, "Toggled local tracks");
        changed
    }

    /// Stop every track. Safe to call repeatedly or with no stream.
    pub fn release(&self, stream: Option<&LocalMediaStream>) {
        let Some(stream) = stream else {
            return;
        };
        if stream.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in stream.tracks() {
            track.stop();
        }
        tracing::info!(stream = stream.id(), "Released local media");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMediaDevices, MediaResponse};

    #[tokio::test]
    async fn test_voice_acquire_has_audio_only() {
        let acquirer = MediaAcquirer::new(Arc::new(FakeMediaDevices::granting()));
        let stream = acquirer.acquire(false).await.unwrap();

        assert_eq!(stream.tracks().len(), 1);
        assert!(!stream.has_video());
        assert!(stream.tracks().iter().all(|t| t.is_live()));
    }

    #[tokio::test]
    async fn test_video_acquire_has_both_kinds() {
        let acquirer = MediaAcquirer::new(Arc::new(FakeMediaDevices::granting()));
        let stream = acquirer.acquire(true).await.unwrap();

        assert!(stream.has_video());
        assert_eq!(stream.tracks_of(MediaKind::Audio).count(), 1);
    }

    #[tokio::test]
    async fn test_denied_request_surfaces_permission_error() {
        let devices = Arc::new(FakeMediaDevices::new(MediaResponse::Deny));
        let acquirer = MediaAcquirer::new(devices.clone());

        let err = acquirer.acquire(true).await.unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
        assert_eq!(devices.request_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_camera_is_device_unavailable() {
        let devices = Arc::new(FakeMediaDevices::new(MediaResponse::AudioOnly));
        let acquirer = MediaAcquirer::new(devices.clone());

        assert_eq!(
            acquirer.acquire(true).await.unwrap_err(),
            Error::DeviceUnavailable
        );
        // The microphone that was granted is not left running
        assert!(devices.granted_tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_toggle_only_touches_requested_kind() {
        let acquirer = MediaAcquirer::new(Arc::new(FakeMediaDevices::granting()));
        let stream = acquirer.acquire(true).await.unwrap();

        assert_eq!(acquirer.set_track_enabled(&stream, MediaKind::Audio, false), 1);

        for track in stream.tracks() {
            match track.kind() {
                MediaKind::Audio => assert!(!track.is_enabled()),
                MediaKind::Video => assert!(track.is_enabled()),
            }
            assert!(track.is_live());
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let acquirer = MediaAcquirer::new(Arc::new(FakeMediaDevices::granting()));
        let stream = acquirer.acquire(true).await.unwrap();

        acquirer.release(Some(&stream));
        acquirer.release(Some(&stream));
        acquirer.release(None);

        assert!(stream.is_released());
        assert!(stream.tracks().iter().all(|t| !t.is_live()));
    }

    #[test]
    fn test_released_stream_can_be_acquired_again() {
        let devices = Arc::new(FakeMediaDevices::granting());
        let acquirer = MediaAcquirer::new(devices.clone());

        let first = tokio_test::block_on(acquirer.acquire(false)).unwrap();
        acquirer.release(Some(&first));
        let second = tokio_test::block_on(acquirer.acquire(false)).unwrap();

        assert_ne!(first.id(), second.id());
        assert!(!second.is_released());
        assert_eq!(devices.request_count(), 2);
    }
}
