//! Browser capture via `navigator.mediaDevices.getUserMedia`.

#![cfg(target_arch = "wasm32")]

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use send_wrapper::SendWrapper;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use super::{CaptureTrack, MediaConstraints, MediaDevices, MediaKind};
use crate::error::{Error, Result};

/// A browser `MediaStreamTrack` together with the stream it came from.
pub struct BrowserTrack {
    track: SendWrapper<web_sys::MediaStreamTrack>,
    stream: SendWrapper<web_sys::MediaStream>,
    kind: MediaKind,
    live: AtomicBool,
}

impl BrowserTrack {
    /// The underlying track
    pub fn track(&self) -> &web_sys::MediaStreamTrack {
        &self.track
    }

    /// The stream the track was granted in
    pub fn stream(&self) -> &web_sys::MediaStream {
        &self.stream
    }
}

impl fmt::Debug for BrowserTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserTrack")
            .field("id", &self.track.id())
            .field("kind", &self.kind)
            .finish()
    }
}

impl CaptureTrack for BrowserTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.track.set_enabled(enabled);
    }

    fn is_enabled(&self) -> bool {
        self.track.enabled()
    }

    fn stop(&self) {
        self.track.stop();
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `MediaDevices` backed by the page's `navigator.mediaDevices`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserMediaDevices;

/// Map a getUserMedia rejection onto the media error variants.
fn map_capture_error(err: JsValue) -> Error {
    match err.dyn_ref::<web_sys::DomException>().map(|e| e.name()) {
        Some(name) if name == "NotAllowedError" || name == "SecurityError" => {
            Error::PermissionDenied
        }
        Some(name) if name == "NotFoundError" || name == "OverconstrainedError" => {
            Error::DeviceUnavailable
        }
        Some(name) => Error::MediaFailed(name),
        None => Error::MediaFailed(format!("{:?}", err)),
    }
}

#[async_trait]
impl MediaDevices for BrowserMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<dyn CaptureTrack>>> {
        let request = {
            let window = web_sys::window()
                .ok_or_else(|| Error::MediaFailed("no window".to_string()))?;
            let devices = window
                .navigator()
                .media_devices()
                .map_err(|_| Error::DeviceUnavailable)?;

            let js_constraints = web_sys::MediaStreamConstraints::new();
            js_constraints.set_audio(&JsValue::from_bool(constraints.audio));
            js_constraints.set_video(&JsValue::from_bool(constraints.video));

            let promise = devices
                .get_user_media_with_constraints(&js_constraints)
                .map_err(map_capture_error)?;
            SendWrapper::new(JsFuture::from(promise))
        };

        let granted = request.await.map_err(map_capture_error)?;
        let stream: web_sys::MediaStream = granted
            .dyn_into()
            .map_err(|_| Error::MediaFailed("getUserMedia returned a non-stream".to_string()))?;

        let mut tracks: Vec<Arc<dyn CaptureTrack>> = Vec::new();
        for value in stream.get_tracks().iter() {
            let Ok(track) = value.dyn_into::<web_sys::MediaStreamTrack>() else {
                continue;
            };
            let kind = match track.kind().as_str() {
                "audio" => MediaKind::Audio,
                "video" => MediaKind::Video,
                _ => continue,
            };
            tracks.push(Arc::new(BrowserTrack {
                track: SendWrapper::new(track),
                stream: SendWrapper::new(stream.clone()),
                kind,
                live: AtomicBool::new(true),
            }));
        }

        Ok(tracks)
    }
}
