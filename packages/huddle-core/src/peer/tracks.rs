//! Remote tracks held for rendering, each tagged with the transport that
//! received it so a closed transport leaves nothing behind.

// Only the browser transport registers tracks
#![cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

pub(crate) struct TrackRegistry<T> {
    tracks: Mutex<HashMap<String, (u64, T)>>,
    next_owner: AtomicU64,
}

impl<T> Default for TrackRegistry<T> {
    fn default() -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            next_owner: AtomicU64::new(0),
        }
    }
}

impl<T> TrackRegistry<T> {
    /// Key for a new transport's tracks
    pub fn owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, owner: u64, id: String, track: T) {
        self.tracks.lock().insert(id, (owner, track));
    }

    pub fn get_with<R>(&self, id: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.tracks.lock().get(id).map(|(_, track)| f(track))
    }

    /// Drop every track received by `owner`. Returns how many were dropped.
    pub fn release(&self, owner: u64) -> usize {
        let mut tracks = self.tracks.lock();
        let before = tracks.len();
        tracks.retain(|_, (held_by, _)| *held_by != owner);
        before - tracks.len()
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }
}
