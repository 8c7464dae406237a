//! # Browser Peer Transport
//!
//! [`PeerTransport`] over the page's `RTCPeerConnection`.
//!
//! ```text
//! RTCPeerConnection (web-sys)
//!      │
//!      ├── onicecandidate ──► TransportEvent::LocalCandidate
//!      ├── ontrack        ──► TransportEvent::RemoteTrack (+ track kept for rendering)
//!      └── addTrack       ◄── BrowserTrack from the local stream
//! ```
//!
//! web-sys values are not `Send`; they live behind `SendWrapper`, which is
//! sound on the single-threaded browser runtime.

#![cfg(target_arch = "wasm32")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use send_wrapper::SendWrapper;
use tokio::sync::mpsc;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use super::tracks::TrackRegistry;
use super::{PeerTransport, RemoteTrack, TransportEvent, TransportFactory};
use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::media::browser::BrowserTrack;
use crate::media::{CaptureTrack, MediaKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

type RemoteTracks = Arc<TrackRegistry<SendWrapper<web_sys::MediaStreamTrack>>>;

/// Create an RTCPeerConnection configured with `ice_servers`
fn create_peer_connection(
    ice_servers: &[IceServer],
) -> std::result::Result<web_sys::RtcPeerConnection, JsValue> {
    let servers = js_sys::Array::new();
    for entry in ice_servers {
        let server = js_sys::Object::new();
        let urls = js_sys::Array::new();
        for url in &entry.urls {
            urls.push(&JsValue::from_str(url));
        }
        js_sys::Reflect::set(&server, &"urls".into(), &urls)?;
        if let Some(username) = &entry.username {
            js_sys::Reflect::set(&server, &"username".into(), &JsValue::from_str(username))?;
        }
        if let Some(credential) = &entry.credential {
            js_sys::Reflect::set(&server, &"credential".into(), &JsValue::from_str(credential))?;
        }
        servers.push(&server);
    }

    let config = web_sys::RtcConfiguration::new();
    config.set_ice_servers(&servers);

    web_sys::RtcPeerConnection::new_with_configuration(&config)
}

fn description_init(description: &SessionDescription) -> web_sys::RtcSessionDescriptionInit {
    let sdp_type = match description.sdp_type {
        SdpType::Offer => web_sys::RtcSdpType::Offer,
        SdpType::Answer => web_sys::RtcSdpType::Answer,
    };
    let init = web_sys::RtcSessionDescriptionInit::new(sdp_type);
    init.set_sdp(&description.sdp);
    init
}

fn read_sdp(value: &JsValue) -> Option<String> {
    js_sys::Reflect::get(value, &"sdp".into())
        .ok()
        .and_then(|sdp| sdp.as_string())
}

/// Creates `RTCPeerConnection`-backed transports.
#[derive(Default, Clone)]
pub struct BrowserTransportFactory {
    remote_tracks: RemoteTracks,
}

impl BrowserTransportFactory {
    /// Create a factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The browser track behind a [`RemoteTrack`] id, for attaching to a
    /// media element.
    pub fn remote_track(&self, id: &str) -> Option<web_sys::MediaStreamTrack> {
        self.remote_tracks.get_with(id, |t| (**t).clone())
    }
}

impl TransportFactory for BrowserTransportFactory {
    fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = create_peer_connection(ice_servers).map_err(|e| {
            Error::TransportError(format!("Failed to create RTCPeerConnection: {:?}", e))
        })?;

        let candidate_events = events.clone();
        let onicecandidate = Closure::wrap(Box::new(move |event: web_sys::RtcPeerConnectionIceEvent| {
            // A null candidate marks the end of gathering
            if let Some(candidate) = event.candidate() {
                let _ = candidate_events.send(TransportEvent::LocalCandidate(IceCandidate {
                    candidate: candidate.candidate(),
                    sdp_mid: candidate.sdp_mid(),
                    sdp_m_line_index: candidate.sdp_m_line_index(),
                }));
            }
        }) as Box<dyn FnMut(web_sys::RtcPeerConnectionIceEvent)>);
        pc.set_onicecandidate(Some(onicecandidate.as_ref().unchecked_ref()));

        let owner = self.remote_tracks.owner();
        let remote_tracks = self.remote_tracks.clone();
        let ontrack = Closure::wrap(Box::new(move |event: web_sys::RtcTrackEvent| {
            let track = event.track();
            let kind = match track.kind().as_str() {
                "video" => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            let id = track.id();
            remote_tracks.insert(owner, id.clone(), SendWrapper::new(track));
            let _ = events.send(TransportEvent::RemoteTrack(RemoteTrack { id, kind }));
        }) as Box<dyn FnMut(web_sys::RtcTrackEvent)>);
        pc.set_ontrack(Some(ontrack.as_ref().unchecked_ref()));

        Ok(Arc::new(BrowserTransport {
            pc: SendWrapper::new(pc),
            pending_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            remote_tracks: self.remote_tracks.clone(),
            owner,
            _onicecandidate: SendWrapper::new(onicecandidate),
            _ontrack: SendWrapper::new(ontrack),
        }))
    }
}

/// One browser peer connection.
pub struct BrowserTransport {
    pc: SendWrapper<web_sys::RtcPeerConnection>,
    /// Candidates that arrived before the remote description
    pending_candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
    remote_tracks: RemoteTracks,
    owner: u64,
    // Store closures to prevent GC
    _onicecandidate: SendWrapper<Closure<dyn FnMut(web_sys::RtcPeerConnectionIceEvent)>>,
    _ontrack: SendWrapper<Closure<dyn FnMut(web_sys::RtcTrackEvent)>>,
}

impl BrowserTransport {
    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let future = {
            let init = web_sys::RtcIceCandidateInit::new(&candidate.candidate);
            if let Some(ref mid) = candidate.sdp_mid {
                init.set_sdp_mid(Some(mid));
            }
            if let Some(index) = candidate.sdp_m_line_index {
                init.set_sdp_m_line_index(Some(index));
            }
            let ice_candidate = web_sys::RtcIceCandidate::new(&init)
                .map_err(|e| Error::TransportError(format!("Invalid ICE candidate: {:?}", e)))?;
            SendWrapper::new(JsFuture::from(
                self.pc
                    .add_ice_candidate_with_opt_rtc_ice_candidate(Some(&ice_candidate)),
            ))
        };
        future
            .await
            .map_err(|e| Error::TransportError(format!("Failed to add ICE candidate: {:?}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for BrowserTransport {
    async fn add_track(&self, track: Arc<dyn CaptureTrack>) -> Result<()> {
        let browser = track
            .as_any()
            .downcast_ref::<BrowserTrack>()
            .ok_or_else(|| Error::TransportError("track was not captured by the browser".into()))?;
        self.pc.add_track_0(browser.track(), browser.stream());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let future = SendWrapper::new(JsFuture::from(self.pc.create_offer()));
        let offer = future
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to create offer: {:?}", e)))?;
        let sdp = read_sdp(&offer)
            .ok_or_else(|| Error::NegotiationFailed("offer carried no SDP".into()))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let future = SendWrapper::new(JsFuture::from(self.pc.create_answer()));
        let answer = future
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to create answer: {:?}", e)))?;
        let sdp = read_sdp(&answer)
            .ok_or_else(|| Error::NegotiationFailed("answer carried no SDP".into()))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let future = {
            let init = description_init(&description);
            SendWrapper::new(JsFuture::from(self.pc.set_local_description(&init)))
        };
        future.await.map_err(|e| {
            Error::NegotiationFailed(format!("Failed to set local description: {:?}", e))
        })?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let future = {
            let init = description_init(&description);
            SendWrapper::new(JsFuture::from(self.pc.set_remote_description(&init)))
        };
        future.await.map_err(|e| {
            Error::NegotiationFailed(format!("Failed to set remote description: {:?}", e))
        })?;

        let queued = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in queued {
            if let Err(e) = self.apply_candidate(candidate).await {
                tracing::warn!(error = %e, "Dropping queued candidate");
            }
        }
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.pc.remote_description().is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.has_remote_description() {
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pc.set_onicecandidate(None);
        self.pc.set_ontrack(None);
        self.pc.close();
        let dropped = self.remote_tracks.release(self.owner);
        tracing::debug!(dropped, "Closed peer connection");
    }
}
