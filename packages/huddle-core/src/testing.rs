//! In-process fakes for the host capabilities.
//!
//! Compiled for tests and with the `testing` feature. Used by the unit tests,
//! the relay's integration tests, and the `call_demo` example.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::media::{CaptureTrack, MediaConstraints, MediaDevices, MediaKind};
use crate::peer::{PeerTransport, RemoteTrack, TransportEvent, TransportFactory};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::store::{
    BatchOp, CollectionEntry, CollectionPath, Document, DocumentPath, MemoryStore,
    SignalingStore, Subscription,
};

// ============================================================================
// MEDIA
// ============================================================================

/// A capture track that only records its flags.
#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl FakeTrack {
    /// A live, enabled track.
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }
}

impl CaptureTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// How [`FakeMediaDevices`] answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaResponse {
    /// Grant every requested kind
    Grant,
    /// Grant the microphone only, whatever was asked
    AudioOnly,
    /// Refuse with `PermissionDenied`
    Deny,
    /// Fail with `DeviceUnavailable`
    NoDevice,
}

/// Scripted media host.
#[derive(Debug)]
pub struct FakeMediaDevices {
    response: Mutex<MediaResponse>,
    requests: AtomicUsize,
    granted: Mutex<Vec<Arc<FakeTrack>>>,
    held: watch::Sender<bool>,
}

impl FakeMediaDevices {
    /// A host answering every request with `response`.
    pub fn new(response: MediaResponse) -> Self {
        Self {
            response: Mutex::new(response),
            requests: AtomicUsize::new(0),
            granted: Mutex::new(Vec::new()),
            held: watch::channel(false).0,
        }
    }

    /// A host that grants everything.
    pub fn granting() -> Self {
        Self::new(MediaResponse::Grant)
    }

    /// Change the answer for later requests.
    pub fn set_response(&self, response: MediaResponse) {
        *self.response.lock() = response;
    }

    /// Park later requests until [`FakeMediaDevices::release_requests`].
    pub fn hold_requests(&self) {
        self.held.send_replace(true);
    }

    /// Let held and later requests through.
    pub fn release_requests(&self) {
        self.held.send_replace(false);
    }

    /// How many times media was requested.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Every track handed out so far.
    pub fn granted_tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.granted.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<dyn CaptureTrack>>> {
        let request = self.requests.fetch_add(1, Ordering::SeqCst);
        let mut held = self.held.subscribe();
        let gate = held.wait_for(|held| !*held).await.map(|_| ());
        if gate.is_err() {
            return Err(Error::MediaFailed("media host went away".to_string()));
        }
        let response = *self.response.lock();

        let mut kinds = Vec::new();
        match response {
            MediaResponse::Deny => return Err(Error::PermissionDenied),
            MediaResponse::NoDevice => return Err(Error::DeviceUnavailable),
            MediaResponse::AudioOnly => {
                if constraints.audio {
                    kinds.push(MediaKind::Audio);
                }
            }
            MediaResponse::Grant => {
                if constraints.audio {
                    kinds.push(MediaKind::Audio);
                }
                if constraints.video {
                    kinds.push(MediaKind::Video);
                }
            }
        }

        let mut granted = self.granted.lock();
        let mut tracks: Vec<Arc<dyn CaptureTrack>> = Vec::new();
        for kind in kinds {
            let track = Arc::new(FakeTrack::new(format!("{:?}-{}", kind, request), kind));
            granted.push(track.clone());
            tracks.push(track);
        }
        Ok(tracks)
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Local candidates gathered per local description
const FAKE_CANDIDATES_PER_DESCRIPTION: u16 = 2;

#[derive(Default)]
struct FakeTransportState {
    tracks: usize,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    received: Vec<IceCandidate>,
    queued: Vec<IceCandidate>,
    applied: Vec<IceCandidate>,
    remote_track_sent: bool,
    close_count: usize,
}

/// A transport that connects to nothing.
///
/// Gathers two host candidates whenever a local description is applied,
/// queues peer candidates until the remote description is set, and reports
/// one inbound audio track once it has a remote description and at least one
/// applied candidate.
pub struct FakeTransport {
    id: usize,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<FakeTransportState>,
}

impl FakeTransport {
    fn new(id: usize, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            id,
            events,
            state: Mutex::new(FakeTransportState::default()),
        }
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Every candidate passed to `add_ice_candidate`, queued or not
    pub fn received_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().received.clone()
    }

    /// Candidates applied after the remote description was set
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Number of local tracks attached
    pub fn track_count(&self) -> usize {
        self.state.lock().tracks
    }

    /// Whether `close()` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().close_count > 0
    }

    /// How many times `close()` was called
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    fn check_open(state: &FakeTransportState) -> Result<()> {
        if state.close_count > 0 {
            return Err(Error::TransportError("transport is closed".to_string()));
        }
        Ok(())
    }

    fn maybe_report_track(&self, state: &mut FakeTransportState) {
        if state.remote_track_sent || state.remote.is_none() || state.applied.is_empty() {
            return;
        }
        state.remote_track_sent = true;
        let _ = self.events.send(TransportEvent::RemoteTrack(RemoteTrack {
            id: format!("remote-audio-{}", self.id),
            kind: MediaKind::Audio,
        }));
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, _track: Arc<dyn CaptureTrack>) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.tracks += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Self::check_open(&self.state.lock())?;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=fake-{} 1 1 IN IP4 0.0.0.0\r\ns=offer\r\n",
            self.id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        if state.remote.is_none() {
            return Err(Error::NegotiationFailed(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=fake-{} 1 1 IN IP4 0.0.0.0\r\ns=answer\r\n",
            self.id
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            state.local = Some(description);
        }
        for n in 0..FAKE_CANDIDATES_PER_DESCRIPTION {
            let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{}{} 1 udp 2122260223 192.0.2.{} {} typ host",
                    self.id,
                    n,
                    self.id % 250 + 1,
                    50000 + n
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.remote = Some(description);
        let queued = std::mem::take(&mut state.queued);
        state.applied.extend(queued);
        self.maybe_report_track(&mut state);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.received.push(candidate.clone());
        if state.remote.is_none() {
            state.queued.push(candidate);
        } else {
            state.applied.push(candidate);
            self.maybe_report_track(&mut state);
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().close_count += 1;
    }
}

/// Creates [`FakeTransport`]s and keeps a handle to each.
#[derive(Default)]
pub struct LoopbackTransportFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

/// Distinguishes transports across factories in one process.
static NEXT_TRANSPORT_ID: AtomicUsize = AtomicUsize::new(1);

impl LoopbackTransportFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport created so far.
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    /// The most recently created transport.
    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }
}

impl TransportFactory for LoopbackTransportFactory {
    fn create(
        &self,
        _ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(FakeTransport::new(id, events));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

// ============================================================================
// STORE
// ============================================================================

/// A [`MemoryStore`] wrapper with switchable failures.
#[derive(Clone)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: Arc<AtomicBool>,
    fail_batches: Arc<AtomicBool>,
    fail_candidate_writes: Arc<AtomicBool>,
    fail_subscriptions: Arc<AtomicBool>,
    delete_before_watch: Arc<AtomicBool>,
    planted: Arc<Mutex<Option<Document>>>,
}

impl FlakyStore {
    /// Wrap a store; nothing fails until switched on.
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_batches: Arc::new(AtomicBool::new(false)),
            fail_candidate_writes: Arc::new(AtomicBool::new(false)),
            fail_subscriptions: Arc::new(AtomicBool::new(false)),
            delete_before_watch: Arc::new(AtomicBool::new(false)),
            planted: Arc::new(Mutex::new(None)),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fail `get_document` and `list_collection`
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail `run_batch`
    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    /// Fail `add_to_collection`
    pub fn fail_candidate_writes(&self, fail: bool) {
        self.fail_candidate_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail `subscribe_document` and `subscribe_collection`
    pub fn fail_subscriptions(&self, fail: bool) {
        self.fail_subscriptions.store(fail, Ordering::SeqCst);
    }

    /// Delete a document just before a watch on it is registered, as if the
    /// peer hung up in between
    pub fn delete_before_watch(&self, delete: bool) {
        self.delete_before_watch.store(delete, Ordering::SeqCst);
    }

    /// Write `document` at the target of the next `create_document` right
    /// before it runs, as if another participant won the race
    pub fn plant_before_create(&self, document: Document) {
        *self.planted.lock() = Some(document);
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingStore for FlakyStore {
    async fn get_document(&self, path: &DocumentPath) -> Result<Option<Document>> {
        Self::check(&self.fail_reads, "read")?;
        self.inner.get_document(path).await
    }

    async fn set_document(&self, path: &DocumentPath, value: Document) -> Result<()> {
        self.inner.set_document(path, value).await
    }

    async fn create_document(&self, path: &DocumentPath, value: Document) -> Result<bool> {
        let planted = self.planted.lock().take();
        if let Some(planted) = planted {
            self.inner.set_document(path, planted).await?;
        }
        self.inner.create_document(path, value).await
    }

    async fn update_document(&self, path: &DocumentPath, partial: Document) -> Result<()> {
        self.inner.update_document(path, partial).await
    }

    async fn add_to_collection(&self, path: &CollectionPath, value: Document) -> Result<String> {
        Self::check(&self.fail_candidate_writes, "write")?;
        self.inner.add_to_collection(path, value).await
    }

    async fn list_collection(&self, path: &CollectionPath) -> Result<Vec<CollectionEntry>> {
        Self::check(&self.fail_reads, "read")?;
        self.inner.list_collection(path).await
    }

    async fn delete_document(&self, path: &DocumentPath) -> Result<()> {
        self.inner.delete_document(path).await
    }

    async fn run_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        Self::check(&self.fail_batches, "batch")?;
        self.inner.run_batch(ops).await
    }

    async fn subscribe_document(
        &self,
        path: &DocumentPath,
    ) -> Result<Subscription<Option<Document>>> {
        Self::check(&self.fail_subscriptions, "subscribe")?;
        if self.delete_before_watch.load(Ordering::SeqCst) {
            self.inner.delete_document(path).await?;
        }
        self.inner.subscribe_document(path).await
    }

    async fn subscribe_collection(
        &self,
        path: &CollectionPath,
    ) -> Result<Subscription<CollectionEntry>> {
        Self::check(&self.fail_subscriptions, "subscribe")?;
        self.inner.subscribe_collection(path).await
    }
}

// ============================================================================
// WAITING
// ============================================================================

/// Poll `condition` until it holds, panicking after two seconds.
#[cfg(not(target_arch = "wasm32"))]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
