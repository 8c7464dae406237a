//! # Call Lifecycle
//!
//! [`CallManager`] sequences one call from start to teardown:
//!
//! ```text
//! begin_call(mode, local, remote)
//!   │
//!   ├── 1. resolve_call_id        InvalidParticipant aborts before any media request
//!   ├── 2. MediaAcquirer::acquire PermissionDenied / DeviceUnavailable abort, nothing persisted
//!   └── 3. controller.start       failure releases the stream
//!
//! end_call()
//!   │
//!   ├── 1. controller.end         listeners detached, transport closed
//!   ├── 2. MediaAcquirer::release never blocked by remote cleanup
//!   └── 3. run_batch              session + both candidate collections
//! ```
//!
//! All operations serialize on one async lock, so an `end_call()` racing an
//! in-flight `begin_call()` runs after it and sees its result. Teardown
//! happens once; later calls return immediately.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::identity::{resolve_call_id, CallId, ParticipantId};
use crate::media::{LocalMediaStream, MediaAcquirer, MediaDevices, MediaKind};
use crate::peer::{
    ControllerState, PeerConnectionController, PeerEvent, RemoteMediaStream, TransportFactory,
};
use crate::runtime;
use crate::signaling::{CallPaths, Role};
use crate::store::{BatchOp, SignalingStore};

/// Capacity of the call event broadcast
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Audio-only or audio plus camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Camera and microphone
    Video,
    /// Microphone only
    Voice,
}

/// Events for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// The peer connection changed state
    StateChanged(ControllerState),
    /// Remote media can be rendered
    RemoteStreamReady(RemoteMediaStream),
    /// The other participant hung up; teardown follows automatically
    PeerEnded,
    /// Local teardown finished
    Ended,
}

/// Point-in-time view of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatus {
    /// Mode the call was started with
    pub mode: Option<CallMode>,
    /// Shared call id
    pub call_id: Option<CallId>,
    /// Negotiation role
    pub role: Option<Role>,
    /// Peer connection state
    pub state: ControllerState,
    /// Microphone disabled
    pub muted: bool,
    /// Camera disabled
    pub video_off: bool,
    /// Remote media, once available
    pub remote_stream: Option<RemoteMediaStream>,
    /// Whether `end_call()` has run
    pub ended: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Active,
    Ended,
}

struct CallInner {
    phase: Phase,
    mode: Option<CallMode>,
    call_id: Option<CallId>,
    paths: Option<CallPaths>,
    stream: Option<LocalMediaStream>,
    controller: Option<Arc<PeerConnectionController>>,
    muted: bool,
    video_off: bool,
}

/// Orchestrates media, identity, and negotiation for one call.
///
/// Cheap to clone; clones share the same call.
#[derive(Clone)]
pub struct CallManager {
    store: Arc<dyn SignalingStore>,
    media: MediaAcquirer,
    transports: Arc<dyn TransportFactory>,
    config: CallConfig,
    inner: Arc<Mutex<CallInner>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Create a manager for a single call.
    pub fn new(
        store: Arc<dyn SignalingStore>,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        config: CallConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            media: MediaAcquirer::new(devices),
            transports,
            config,
            inner: Arc::new(Mutex::new(CallInner {
                phase: Phase::Idle,
                mode: None,
                call_id: None,
                paths: None,
                stream: None,
                controller: None,
                muted: false,
                video_off: false,
            })),
            event_tx,
        }
    }

    /// Subscribe to call events.
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Start or join the call between `local` and `remote`.
    pub async fn begin_call(
        &self,
        mode: CallMode,
        local: &ParticipantId,
        remote: &ParticipantId,
    ) -> Result<CallId> {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            Phase::Ended => return Err(Error::CallEnded),
            Phase::Active => return Err(Error::AlreadyStarted),
            Phase::Idle => {}
        }

        let call_id = resolve_call_id(local, remote)?;
        let paths = CallPaths::new(&self.config, &call_id)?;

        let stream = self.media.acquire(mode == CallMode::Video).await?;

        let controller = Arc::new(PeerConnectionController::new(
            self.store.clone(),
            self.transports.clone(),
            self.config.clone(),
        ));
        let peer_events = controller.subscribe();

        let role = match controller.start(Some(&stream), &call_id, local).await {
            Ok(role) => role,
            Err(e) => {
                self.media.release(Some(&stream));
                return Err(e);
            }
        };

        inner.phase = Phase::Active;
        inner.mode = Some(mode);
        inner.call_id = Some(call_id.clone());
        inner.paths = Some(paths);
        inner.stream = Some(stream);
        inner.controller = Some(controller);
        inner.muted = false;
        inner.video_off = false;
        drop(inner);

        runtime::spawn(self.clone().watch(peer_events));

        tracing::info!(call_id = %call_id, ?mode, ?role, "Call started");
        Ok(call_id)
    }

    /// Forward controller events and tear down when the peer hangs up.
    async fn watch(self, mut peer_events: broadcast::Receiver<PeerEvent>) {
        loop {
            match peer_events.recv().await {
                Ok(PeerEvent::StateChanged(state)) => {
                    let _ = self.event_tx.send(CallEvent::StateChanged(state));
                }
                Ok(PeerEvent::RemoteStreamReady(stream)) => {
                    let _ = self.event_tx.send(CallEvent::RemoteStreamReady(stream));
                }
                Ok(PeerEvent::PeerEnded) => {
                    let _ = self.event_tx.send(CallEvent::PeerEnded);
                    if let Err(e) = self.end_call().await {
                        tracing::warn!(error = %e, "Teardown after peer hangup failed");
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Call watcher lagged behind controller events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Flip the microphone. Returns whether it is now muted.
    pub async fn toggle_mute(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let muted = !inner.muted;
        let stream = active_stream(&inner)?;
        self.media.set_track_enabled(stream, MediaKind::Audio, !muted);
        inner.muted = muted;
        Ok(muted)
    }

    /// Flip the camera. Returns whether it is now off; always `false` for
    /// voice calls.
    pub async fn toggle_video(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let video_off = !inner.video_off;
        let stream = active_stream(&inner)?;
        if inner.mode != Some(CallMode::Video) {
            return Ok(false);
        }
        self.media.set_track_enabled(stream, MediaKind::Video, !video_off);
        inner.video_off = video_off;
        Ok(video_off)
    }

    /// Hang up: close the controller, release media, delete the session.
    ///
    /// Local teardown always completes; a failed remote cleanup is returned
    /// afterwards. Calling this again is a no-op.
    pub async fn end_call(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let previous = std::mem::replace(&mut inner.phase, Phase::Ended);
        match previous {
            Phase::Ended => return Ok(()),
            Phase::Idle => {
                tracing::debug!("Call ended before it began");
                let _ = self.event_tx.send(CallEvent::Ended);
                return Ok(());
            }
            Phase::Active => {}
        }

        if let Some(controller) = inner.controller.take() {
            controller.end().await;
        }
        let stream = inner.stream.take();
        self.media.release(stream.as_ref());

        let result = match inner.paths.clone() {
            Some(paths) => self.delete_session(&paths).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Failed to delete call session");
        }

        match &inner.call_id {
            Some(call_id) => tracing::info!(call_id = %call_id, "Call ended"),
            None => tracing::info!("Call ended"),
        }
        let _ = self.event_tx.send(CallEvent::Ended);
        result
    }

    async fn delete_session(&self, paths: &CallPaths) -> Result<()> {
        let mut ops = vec![BatchOp::Delete {
            path: paths.session.clone(),
        }];
        for collection in [&paths.caller_candidates, &paths.callee_candidates] {
            for entry in self.store.list_collection(collection).await? {
                ops.push(BatchOp::Delete {
                    path: entry.collection.doc(&entry.id),
                });
            }
        }
        tracing::debug!(session = %paths.session, ops = ops.len(), "Deleting call session");
        self.store.run_batch(ops).await
    }

    /// Current call status.
    pub async fn snapshot(&self) -> CallStatus {
        let inner = self.inner.lock().await;
        let controller = inner.controller.as_ref();
        CallStatus {
            mode: inner.mode,
            call_id: inner.call_id.clone(),
            role: controller.and_then(|c| c.role()),
            state: match (controller, inner.phase) {
                (Some(controller), _) => controller.state(),
                (None, Phase::Ended) => ControllerState::Closed,
                (None, _) => ControllerState::Idle,
            },
            muted: inner.muted,
            video_off: inner.video_off,
            remote_stream: controller.and_then(|c| c.remote_stream()),
            ended: inner.phase == Phase::Ended,
        }
    }
}

fn active_stream(inner: &CallInner) -> Result<&LocalMediaStream> {
    match inner.phase {
        Phase::Ended => Err(Error::CallEnded),
        Phase::Idle => Err(Error::NotReady),
        Phase::Active => inner.stream.as_ref().ok_or(Error::NotReady),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::CaptureTrack;
    use crate::store::MemoryStore;
    use crate::testing::{
        wait_until, FakeMediaDevices, FlakyStore, LoopbackTransportFactory, MediaResponse,
    };
    use std::time::Duration;

    struct Client {
        manager: CallManager,
        devices: Arc<FakeMediaDevices>,
        transports: Arc<LoopbackTransportFactory>,
        id: ParticipantId,
    }

    fn client(store: Arc<dyn SignalingStore>, name: &str) -> Client {
        let devices = Arc::new(FakeMediaDevices::granting());
        let transports = Arc::new(LoopbackTransportFactory::new());
        Client {
            manager: CallManager::new(
                store,
                devices.clone(),
                transports.clone(),
                CallConfig::default(),
            ),
            devices,
            transports,
            id: ParticipantId::new(name).unwrap(),
        }
    }

    async fn wait_for(manager: &CallManager, condition: impl Fn(&CallStatus) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if condition(&manager.snapshot().await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("call status not reached in time");
    }

    #[tokio::test]
    async fn test_self_call_aborts_before_media() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store, "alice");

        let err = alice
            .manager
            .begin_call(CallMode::Video, &alice.id, &alice.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParticipant(_)));
        assert_eq!(alice.devices.request_count(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_leaves_no_trace() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        alice.devices.set_response(MediaResponse::Deny);
        let bob = ParticipantId::new("bob").unwrap();

        let err = alice
            .manager
            .begin_call(CallMode::Video, &alice.id, &bob)
            .await
            .unwrap_err();

        assert_eq!(err, Error::PermissionDenied);
        assert!(alice.transports.transports().is_empty());
        assert_eq!(store.document_count(), 0);
        assert_eq!(alice.manager.snapshot().await.state, ControllerState::Idle);
    }

    #[tokio::test]
    async fn test_full_call_connects_and_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        let bob = client(store.clone(), "bob");
        let mut bob_events = bob.manager.events();

        let a = alice
            .manager
            .begin_call(CallMode::Video, &alice.id, &bob.id)
            .await
            .unwrap();
        let b = bob
            .manager
            .begin_call(CallMode::Video, &bob.id, &alice.id)
            .await
            .unwrap();
        assert_eq!(a, b);

        wait_for(&alice.manager, |s| s.state == ControllerState::Connected).await;
        wait_for(&bob.manager, |s| s.state == ControllerState::Connected).await;
        assert_eq!(alice.manager.snapshot().await.role, Some(Role::Caller));
        assert_eq!(bob.manager.snapshot().await.role, Some(Role::Callee));

        alice.manager.end_call().await.unwrap();
        assert_eq!(store.document_count(), 0);
        assert!(alice.devices.granted_tracks().iter().all(|t| !t.is_live()));

        // Bob is torn down by the hangup
        wait_for(&bob.manager, |s| s.ended).await;
        assert!(bob.devices.granted_tracks().iter().all(|t| !t.is_live()));
        assert!(bob.transports.last().unwrap().is_closed());

        let mut saw_peer_ended = 0;
        let mut saw_ended = false;
        while let Ok(event) = bob_events.try_recv() {
            match event {
                CallEvent::PeerEnded => saw_peer_ended += 1,
                CallEvent::Ended => saw_ended = true,
                _ => {}
            }
        }
        assert_eq!(saw_peer_ended, 1);
        assert!(saw_ended);
    }

    #[tokio::test]
    async fn test_end_call_twice_matches_once() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        let bob = ParticipantId::new("bob").unwrap();

        alice
            .manager
            .begin_call(CallMode::Voice, &alice.id, &bob)
            .await
            .unwrap();
        wait_for(&alice.manager, |_| store.document_count() >= 3).await;

        alice.manager.end_call().await.unwrap();
        let first = alice.manager.snapshot().await;
        alice.manager.end_call().await.unwrap();
        let second = alice.manager.snapshot().await;

        assert_eq!(first, second);
        assert_eq!(second.state, ControllerState::Closed);
        assert_eq!(store.document_count(), 0);
        assert_eq!(alice.transports.last().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_end_calls_tear_down_once() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        let bob = ParticipantId::new("bob").unwrap();
        let mut events = alice.manager.events();

        alice
            .manager
            .begin_call(CallMode::Video, &alice.id, &bob)
            .await
            .unwrap();

        let (first, second) = tokio::join!(alice.manager.end_call(), alice.manager.end_call());
        first.unwrap();
        second.unwrap();

        let mut ended = 0;
        while let Ok(event) = events.try_recv() {
            if event == CallEvent::Ended {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
        assert_eq!(store.document_count(), 0);
    }

    #[tokio::test]
    async fn test_end_during_begin_observes_the_begin() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        let bob = ParticipantId::new("bob").unwrap();
        let mut events = alice.manager.events();
        alice.devices.hold_requests();

        let begin = tokio::spawn({
            let manager = alice.manager.clone();
            let (local, remote) = (alice.id.clone(), bob.clone());
            async move { manager.begin_call(CallMode::Video, &local, &remote).await }
        });
        wait_until(|| alice.devices.request_count() == 1).await;

        let end = tokio::spawn({
            let manager = alice.manager.clone();
            async move { manager.end_call().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!end.is_finished());

        alice.devices.release_requests();
        let call_id = begin.await.unwrap().unwrap();
        end.await.unwrap().unwrap();

        assert_eq!(call_id.as_str(), "alice_bob");
        assert!(alice.devices.granted_tracks().iter().all(|t| !t.is_live()));
        assert!(alice.transports.last().unwrap().is_closed());
        assert_eq!(store.document_count(), 0);
        assert!(alice.manager.snapshot().await.ended);

        let mut ended = 0;
        while let Ok(event) = events.try_recv() {
            if event == CallEvent::Ended {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
        assert_eq!(
            alice
                .manager
                .begin_call(CallMode::Video, &alice.id, &bob)
                .await
                .unwrap_err(),
            Error::CallEnded
        );
    }

    #[tokio::test]
    async fn test_retry_after_setup_failure_connects() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let alice = client(store.clone(), "alice");
        let bob = client(store.clone(), "bob");

        store.fail_subscriptions(true);
        let err = alice
            .manager
            .begin_call(CallMode::Voice, &alice.id, &bob.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert_eq!(store.inner().document_count(), 0);

        store.fail_subscriptions(false);
        alice
            .manager
            .begin_call(CallMode::Voice, &alice.id, &bob.id)
            .await
            .unwrap();
        bob.manager
            .begin_call(CallMode::Voice, &bob.id, &alice.id)
            .await
            .unwrap();
        assert_eq!(alice.manager.snapshot().await.role, Some(Role::Caller));
        assert_eq!(bob.manager.snapshot().await.role, Some(Role::Callee));

        wait_for(&alice.manager, |s| s.state == ControllerState::Connected).await;
        wait_for(&bob.manager, |s| s.state == ControllerState::Connected).await;
    }

    #[tokio::test]
    async fn test_begin_is_rejected_when_active_or_ended() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store, "alice");
        let bob = ParticipantId::new("bob").unwrap();

        alice
            .manager
            .begin_call(CallMode::Voice, &alice.id, &bob)
            .await
            .unwrap();
        assert_eq!(
            alice
                .manager
                .begin_call(CallMode::Voice, &alice.id, &bob)
                .await
                .unwrap_err(),
            Error::AlreadyStarted
        );

        alice.manager.end_call().await.unwrap();
        assert_eq!(
            alice
                .manager
                .begin_call(CallMode::Voice, &alice.id, &bob)
                .await
                .unwrap_err(),
            Error::CallEnded
        );
    }

    #[tokio::test]
    async fn test_end_before_begin_blocks_late_begin() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        let bob = ParticipantId::new("bob").unwrap();

        alice.manager.end_call().await.unwrap();
        assert_eq!(
            alice
                .manager
                .begin_call(CallMode::Video, &alice.id, &bob)
                .await
                .unwrap_err(),
            Error::CallEnded
        );
        assert_eq!(alice.devices.request_count(), 0);
        assert_eq!(store.document_count(), 0);
    }

    #[tokio::test]
    async fn test_toggles() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        let bob = client(store, "bob");

        assert_eq!(alice.manager.toggle_mute().await.unwrap_err(), Error::NotReady);

        alice
            .manager
            .begin_call(CallMode::Video, &alice.id, &bob.id)
            .await
            .unwrap();
        assert!(alice.manager.toggle_mute().await.unwrap());
        assert!(alice.manager.toggle_video().await.unwrap());
        assert!(alice
            .devices
            .granted_tracks()
            .iter()
            .all(|t| !t.is_enabled() && t.is_live()));
        assert!(!alice.manager.toggle_mute().await.unwrap());

        bob.manager
            .begin_call(CallMode::Voice, &bob.id, &alice.id)
            .await
            .unwrap();
        assert!(!bob.manager.toggle_video().await.unwrap());
        assert!(!bob.manager.snapshot().await.video_off);

        alice.manager.end_call().await.unwrap();
        assert_eq!(alice.manager.toggle_mute().await.unwrap_err(), Error::CallEnded);
    }

    #[tokio::test]
    async fn test_batch_failure_still_releases_locally() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let alice = client(store.clone(), "alice");
        let bob = ParticipantId::new("bob").unwrap();

        alice
            .manager
            .begin_call(CallMode::Video, &alice.id, &bob)
            .await
            .unwrap();
        store.fail_batches(true);

        let err = alice.manager.end_call().await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(alice.devices.granted_tracks().iter().all(|t| !t.is_live()));
        assert!(alice.transports.last().unwrap().is_closed());
        assert!(alice.manager.snapshot().await.ended);

        // Session is still there for a later cleanup
        assert!(store.inner().document_count() >= 1);
    }

    #[tokio::test]
    async fn test_controller_failure_releases_media() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.fail_reads(true);
        let alice = client(store.clone(), "alice");
        let bob = ParticipantId::new("bob").unwrap();

        let err = alice
            .manager
            .begin_call(CallMode::Video, &alice.id, &bob)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(alice.devices.granted_tracks().iter().all(|t| !t.is_live()));
        assert_eq!(store.inner().document_count(), 0);
        assert!(!alice.manager.snapshot().await.ended);
    }
}
