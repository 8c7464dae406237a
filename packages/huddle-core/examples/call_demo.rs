//! # Call Signaling Demo
//!
//! Two in-process clients place a video call over a shared in-memory
//! signaling store:
//! 1. Alice starts the call and writes the offer
//! 2. Bob joins, answers, and both sides exchange candidates
//! 3. Alice mutes, then hangs up
//! 4. Bob's side tears itself down when the session disappears
//!
//! Media and transport are the in-process fakes from `huddle_core::testing`.
//!
//! ## Run
//!
//! ```bash
//! cargo run --example call_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use huddle_core::store::SignalingStore;
use huddle_core::testing::{FakeMediaDevices, LoopbackTransportFactory};
use huddle_core::{
    CallConfig, CallEvent, CallManager, CallMode, ControllerState, MemoryStore, ParticipantId,
};

fn client(store: &MemoryStore) -> CallManager {
    let store: Arc<dyn SignalingStore> = Arc::new(store.clone());
    CallManager::new(
        store,
        Arc::new(FakeMediaDevices::granting()),
        Arc::new(LoopbackTransportFactory::new()),
        CallConfig::default(),
    )
}

async fn wait_for_state(manager: &CallManager, state: ControllerState) -> bool {
    for _ in 0..200 {
        if manager.snapshot().await.state == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::main]
async fn main() -> huddle_core::Result<()> {
    println!("=================================================");
    println!("            HUDDLE CALL SIGNALING DEMO");
    println!("=================================================\n");

    let store = MemoryStore::new();
    let alice_id = ParticipantId::new("alice")?;
    let bob_id = ParticipantId::new("bob")?;
    let alice = client(&store);
    let bob = client(&store);
    let mut bob_events = bob.events();

    // =========================================================================
    // STEP 1: Alice starts the call
    // =========================================================================
    println!("1. Alice starts a video call with Bob...\n");

    let call_id = alice.begin_call(CallMode::Video, &alice_id, &bob_id).await?;
    let status = alice.snapshot().await;
    println!("   Call ID: {}", call_id);
    println!("   Alice role: {:?}", status.role);
    println!("   Alice state: {:?}", status.state);
    println!("   Documents in store: {}", store.document_count());
    println!();

    // =========================================================================
    // STEP 2: Bob joins
    // =========================================================================
    println!("2. Bob joins the same call...\n");

    let joined = bob.begin_call(CallMode::Video, &bob_id, &alice_id).await?;
    println!("   Same call ID: {}", joined == call_id);
    println!("   Bob role: {:?}", bob.snapshot().await.role);

    let alice_connected = wait_for_state(&alice, ControllerState::Connected).await;
    let bob_connected = wait_for_state(&bob, ControllerState::Connected).await;
    println!("   Alice connected: {}", alice_connected);
    println!("   Bob connected: {}", bob_connected);
    if let Some(remote) = bob.snapshot().await.remote_stream {
        println!("   Bob receives {} remote track(s)", remote.tracks.len());
    }
    println!("   Documents in store: {}", store.document_count());
    println!();

    // =========================================================================
    // STEP 3: Alice mutes and hangs up
    // =========================================================================
    println!("3. Alice mutes, then hangs up...\n");

    println!("   Alice muted: {}", alice.toggle_mute().await?);
    alice.end_call().await?;
    println!("   Alice state: {:?}", alice.snapshot().await.state);
    println!("   Documents in store: {}", store.document_count());
    println!();

    // =========================================================================
    // STEP 4: Bob notices
    // =========================================================================
    println!("4. Bob's side reacts to the hangup...\n");

    let bob_closed = wait_for_state(&bob, ControllerState::Closed).await;
    println!("   Bob closed: {}", bob_closed);
    while let Ok(event) = bob_events.try_recv() {
        match event {
            CallEvent::StateChanged(state) => println!("   event: state -> {:?}", state),
            CallEvent::RemoteStreamReady(stream) => {
                println!("   event: remote stream ({} tracks)", stream.tracks.len())
            }
            CallEvent::PeerEnded => println!("   event: peer ended"),
            CallEvent::Ended => println!("   event: ended"),
        }
    }
    println!();

    println!("=================================================");
    println!("                   DEMO COMPLETE");
    println!("=================================================");

    Ok(())
}
