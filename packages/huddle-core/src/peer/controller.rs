//! Peer connection controller and its per-call driver loop.
//!
//! ```text
//! ┌──────────────────────────┐   DriverCommand::Shutdown   ┌──────────────────────────┐
//! │ PeerConnectionController │ ──────────────────────────► │         Driver           │
//! │  start() / end()         │ ◄────────── ack ─────────── │  tokio::select! {        │
//! │                          │                             │    biased;               │
//! │  state ◄──── Arc<RwLock> ┼──── shared ────────────────►│    command               │
//! │  remote_stream           │                             │    session snapshot      │
//! └──────────────────────────┘                             │    peer candidate        │
//!                                                          │    transport event       │
//!                                                          │  }                       │
//!                                                          └──────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{
    ControllerState, PeerEvent, PeerTransport, RemoteMediaStream, RemoteTrack, TransportEvent,
    TransportFactory,
};
use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::identity::{CallId, ParticipantId};
use crate::media::LocalMediaStream;
use crate::runtime;
use crate::signaling::{CallPaths, CallSession, IceCandidate, Role};
use crate::store::{CollectionEntry, Document, SignalingStore, Subscription};

/// Capacity of the controller's event broadcast
const EVENT_CHANNEL_CAPACITY: usize = 64;

enum DriverCommand {
    /// Stop the driver; the sender is answered once it has let go of everything
    Shutdown(oneshot::Sender<()>),
}

/// Move to `next` unless already there or closed. Returns whether it moved.
fn transition(
    state: &RwLock<ControllerState>,
    events: &broadcast::Sender<PeerEvent>,
    next: ControllerState,
) -> bool {
    {
        let mut current = state.write();
        if *current == ControllerState::Closed || *current == next {
            return false;
        }
        *current = next;
    }
    let _ = events.send(PeerEvent::StateChanged(next));
    true
}

/// Negotiates and owns the transport for one call.
pub struct PeerConnectionController {
    store: Arc<dyn SignalingStore>,
    factory: Arc<dyn TransportFactory>,
    config: CallConfig,
    state: Arc<RwLock<ControllerState>>,
    role: Arc<RwLock<Option<Role>>>,
    remote_stream: Arc<RwLock<Option<RemoteMediaStream>>>,
    call_id: RwLock<Option<CallId>>,
    transport: Mutex<Option<Arc<dyn PeerTransport>>>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<DriverCommand>>>,
    event_tx: broadcast::Sender<PeerEvent>,
    started: AtomicBool,
    ended: AtomicBool,
}

impl PeerConnectionController {
    /// Create an idle controller.
    pub fn new(
        store: Arc<dyn SignalingStore>,
        factory: Arc<dyn TransportFactory>,
        config: CallConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            factory,
            config,
            state: Arc::new(RwLock::new(ControllerState::Idle)),
            role: Arc::new(RwLock::new(None)),
            remote_stream: Arc::new(RwLock::new(None)),
            call_id: RwLock::new(None),
            transport: Mutex::new(None),
            command_tx: Mutex::new(None),
            event_tx,
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }

    /// Current state
    pub fn state(&self) -> ControllerState {
        *self.state.read()
    }

    /// Role taken during `start()`, if any
    pub fn role(&self) -> Option<Role> {
        *self.role.read()
    }

    /// Remote media, once the first inbound track has arrived
    pub fn remote_stream(&self) -> Option<RemoteMediaStream> {
        self.remote_stream.read().clone()
    }

    /// The call this controller was started for
    pub fn call_id(&self) -> Option<CallId> {
        self.call_id.read().clone()
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_tx.subscribe()
    }

    /// Negotiate a connection for `call_id`.
    ///
    /// Takes the Caller role when no session exists and the Callee role when
    /// another participant's offer is waiting. Returns the role taken.
    pub async fn start(
        &self,
        local: Option<&LocalMediaStream>,
        call_id: &CallId,
        participant: &ParticipantId,
    ) -> Result<Role> {
        let local = match local {
            Some(stream) if !stream.is_released() => stream,
            _ => return Err(Error::NotReady),
        };
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let paths = CallPaths::new(&self.config, call_id)?;
        *self.call_id.write() = Some(call_id.clone());

        let mut created = false;
        let setup = match self.negotiate(local, &paths, participant, &mut created).await {
            Ok(setup) => setup,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Call setup failed");
                let transport = self.transport.lock().take();
                if let Some(transport) = transport {
                    transport.close().await;
                }
                // Candidates are only written by the driver, so the session
                // document is all this attempt can have left behind
                if created {
                    if let Err(cleanup) = self.store.delete_document(&paths.session).await {
                        tracing::warn!(
                            session = %paths.session,
                            error = %cleanup,
                            "Failed to remove session after setup failure"
                        );
                    }
                }
                *self.state.write() = ControllerState::Closed;
                return Err(e);
            }
        };
        let role = setup.role;

        *self.role.write() = Some(role);
        transition(
            &self.state,
            &self.event_tx,
            ControllerState::Negotiating(role),
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.command_tx.lock() = Some(command_tx);

        let driver = Driver {
            call_id: call_id.clone(),
            role,
            paths,
            store: self.store.clone(),
            transport: setup.transport,
            state: self.state.clone(),
            remote_stream: self.remote_stream.clone(),
            event_tx: self.event_tx.clone(),
        };
        runtime::spawn(driver.run(
            command_rx,
            setup.session,
            setup.candidates,
            setup.transport_events,
        ));

        tracing::info!(call_id = %call_id, role = ?role, "Negotiating peer connection");
        Ok(role)
    }

    /// Create a transport carrying every local track. It is recorded as the
    /// controller's transport before anything can fail.
    async fn open_transport(
        &self,
        local: &LocalMediaStream,
    ) -> Result<(
        Arc<dyn PeerTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    )> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(&self.config.ice_servers, events_tx)?;
        *self.transport.lock() = Some(transport.clone());

        for track in local.tracks() {
            transport.add_track(track.clone()).await?;
        }
        Ok((transport, events_rx))
    }

    async fn negotiate(
        &self,
        local: &LocalMediaStream,
        paths: &CallPaths,
        participant: &ParticipantId,
        created: &mut bool,
    ) -> Result<Setup> {
        let (mut transport, mut transport_events) = self.open_transport(local).await?;

        let role = match self.store.get_document(&paths.session).await? {
            Some(document) => self.join(&transport, paths, participant, document).await?,
            None => {
                if self.offer(&transport, paths, participant).await? {
                    *created = true;
                    Role::Caller
                } else {
                    // The other participant wrote their offer first. Ours is
                    // already applied locally, so answer on a fresh transport.
                    tracing::debug!(session = %paths.session, "Session appeared while offering, answering instead");
                    transport.close().await;
                    (transport, transport_events) = self.open_transport(local).await?;
                    self.answer_existing(&transport, paths, participant).await?
                }
            }
        };

        let session = self.store.subscribe_document(&paths.session).await?;
        let candidates = self
            .store
            .subscribe_collection(paths.candidates(role.peer()))
            .await?;

        Ok(Setup {
            role,
            transport,
            transport_events,
            session,
            candidates,
        })
    }

    /// Apply a fresh offer locally, then persist it if no session exists.
    /// Returns false when another participant's session got there first.
    async fn offer(
        &self,
        transport: &Arc<dyn PeerTransport>,
        paths: &CallPaths,
        participant: &ParticipantId,
    ) -> Result<bool> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        let session = CallSession::new(offer, participant.clone());
        self.store
            .create_document(&paths.session, session.to_document()?)
            .await
    }

    /// Answer the session another participant created while we offered.
    async fn answer_existing(
        &self,
        transport: &Arc<dyn PeerTransport>,
        paths: &CallPaths,
        participant: &ParticipantId,
    ) -> Result<Role> {
        let Some(document) = self.store.get_document(&paths.session).await? else {
            return Err(Error::NegotiationFailed(format!(
                "session {} vanished during setup",
                paths.session
            )));
        };
        match self.join(transport, paths, participant, document).await? {
            Role::Callee => Ok(Role::Callee),
            Role::Caller => Err(Error::NegotiationFailed(format!(
                "session {} was claimed concurrently by {}",
                paths.session, participant
            ))),
        }
    }

    async fn join(
        &self,
        transport: &Arc<dyn PeerTransport>,
        paths: &CallPaths,
        participant: &ParticipantId,
        document: Document,
    ) -> Result<Role> {
        let session = CallSession::from_document(document)?;

        if &session.caller_id == participant {
            tracing::debug!(session = %paths.session, "Session already holds our offer");
            return Ok(Role::Caller);
        }

        transport.set_remote_description(session.offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.store
            .update_document(&paths.session, CallSession::answer_update(&answer)?)
            .await?;

        Ok(Role::Callee)
    }

    /// Stop negotiating and close the transport.
    ///
    /// Idempotent, and a no-op before `start()`. Events that arrive after
    /// this begins are dropped.
    pub async fn end(&self) {
        if !self.started.load(Ordering::SeqCst) || self.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        let previous = std::mem::replace(&mut *self.state.write(), ControllerState::Closed);
        if previous != ControllerState::Closed {
            let _ = self
                .event_tx
                .send(PeerEvent::StateChanged(ControllerState::Closed));
        }

        let command_tx = self.command_tx.lock().take();
        if let Some(command_tx) = command_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if command_tx.send(DriverCommand::Shutdown(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
        }

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.close().await;
        }

        match self.call_id() {
            Some(call_id) => tracing::info!(call_id = %call_id, "Peer connection closed"),
            None => tracing::info!("Peer connection closed"),
        }
    }
}

/// Everything a successful setup hands to the driver.
struct Setup {
    role: Role,
    transport: Arc<dyn PeerTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    session: Subscription<Option<Document>>,
    candidates: Subscription<CollectionEntry>,
}

// ============================================================================
// DRIVER
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Driver {
    call_id: CallId,
    role: Role,
    paths: CallPaths,
    store: Arc<dyn SignalingStore>,
    transport: Arc<dyn PeerTransport>,
    state: Arc<RwLock<ControllerState>>,
    remote_stream: Arc<RwLock<Option<RemoteMediaStream>>>,
    event_tx: broadcast::Sender<PeerEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
        mut session: Subscription<Option<Document>>,
        mut candidates: Subscription<CollectionEntry>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        tracing::debug!(call_id = %self.call_id, role = ?self.role, "Peer driver starting");

        let mut session_open = true;
        let mut candidates_open = true;
        let mut transport_open = true;

        let ack = loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(DriverCommand::Shutdown(ack)) => break Some(ack),
                    None => break None,
                },

                snapshot = session.recv(), if session_open => match snapshot {
                    Some(snapshot) => {
                        if self.on_snapshot(snapshot).await == Flow::Stop {
                            break None;
                        }
                    }
                    None => {
                        tracing::warn!(call_id = %self.call_id, "Session subscription ended");
                        session_open = false;
                    }
                },

                entry = candidates.recv(), if candidates_open => match entry {
                    Some(entry) => self.on_peer_candidate(entry).await,
                    None => {
                        tracing::warn!(call_id = %self.call_id, "Candidate subscription ended");
                        candidates_open = false;
                    }
                },

                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => transport_open = false,
                },
            }
        };

        session.unsubscribe();
        candidates.unsubscribe();
        drop(transport_events);

        tracing::debug!(call_id = %self.call_id, "Peer driver stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn is_closed(&self) -> bool {
        *self.state.read() == ControllerState::Closed
    }

    async fn on_snapshot(&mut self, snapshot: Option<Document>) -> Flow {
        if self.is_closed() {
            return Flow::Continue;
        }

        // Setup read or wrote the session before subscribing, so an absent
        // snapshot, even the first one, means it was deleted
        let Some(document) = snapshot else {
            let closed_now = {
                let mut state = self.state.write();
                let was_open = *state != ControllerState::Closed;
                *state = ControllerState::Closed;
                was_open
            };
            if !closed_now {
                return Flow::Continue;
            }
            tracing::info!(call_id = %self.call_id, "Session deleted by peer");
            let _ = self
                .event_tx
                .send(PeerEvent::StateChanged(ControllerState::Closed));
            let _ = self.event_tx.send(PeerEvent::PeerEnded);
            return Flow::Stop;
        };

        let session = match CallSession::from_document(document) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, error = %e, "Ignoring unreadable session");
                return Flow::Continue;
            }
        };

        if self.role != Role::Caller || self.transport.has_remote_description() {
            return Flow::Continue;
        }
        if let Some(answer) = session.answer {
            match self.transport.set_remote_description(answer).await {
                Ok(()) => {
                    tracing::info!(call_id = %self.call_id, "Answer applied");
                    transition(&self.state, &self.event_tx, ControllerState::Connected);
                }
                Err(e) => {
                    tracing::warn!(call_id = %self.call_id, error = %e, "Failed to apply answer");
                }
            }
        }
        Flow::Continue
    }

    async fn on_peer_candidate(&mut self, entry: CollectionEntry) {
        if self.is_closed() {
            return;
        }
        if &entry.collection != self.paths.candidates(self.role.peer()) {
            tracing::debug!(collection = %entry.collection, "Ignoring candidate outside the peer collection");
            return;
        }

        let candidate = match IceCandidate::from_document(entry.data) {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, id = entry.id.as_str(), error = %e, "Ignoring unreadable candidate");
                return;
            }
        };
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Failed to apply peer candidate");
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => self.publish_candidate(candidate).await,
            TransportEvent::RemoteTrack(track) => self.on_remote_track(track),
        }
    }

    async fn publish_candidate(&self, candidate: IceCandidate) {
        let document = match candidate.to_document() {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, error = %e, "Skipping unencodable candidate");
                return;
            }
        };
        let collection = self.paths.candidates(self.role);
        if let Err(e) = self.store.add_to_collection(collection, document).await {
            tracing::warn!(
                call_id = %self.call_id,
                role = ?self.role,
                error = %e,
                "Failed to publish local candidate, skipping"
            );
        }
    }

    fn on_remote_track(&self, track: RemoteTrack) {
        tracing::debug!(call_id = %self.call_id, track = track.id.as_str(), kind = ?track.kind, "Remote track");

        let first = {
            let mut remote = self.remote_stream.write();
            let stream = remote.get_or_insert_with(RemoteMediaStream::default);
            stream.tracks.push(track);
            (stream.tracks.len() == 1).then(|| stream.clone())
        };

        if let Some(stream) = first {
            let _ = self.event_tx.send(PeerEvent::RemoteStreamReady(stream));
            transition(&self.state, &self.event_tx, ControllerState::Connected);
        }
    }
}
