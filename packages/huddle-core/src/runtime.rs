//! Task spawning for native and browser targets.

use std::future::Future;

/// Run a background task on the current runtime.
///
/// Native builds use the ambient tokio runtime; browser builds hand the task
/// to the JS event loop.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future);
}

/// Run a background task on the current runtime.
#[cfg(target_arch = "wasm32")]
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}
