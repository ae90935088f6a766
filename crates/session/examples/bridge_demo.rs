//! Drives the bridge with a scripted sensor and prints the frames a web
//! page would receive at each authorization tier.
//!
//! Run with `RUST_LOG=debug cargo run --example bridge_demo`.

use std::sync::Arc;

use xrbridge_anchors::AnchorRecord;
use xrbridge_events::{
    AnchorId, AuthorizationTier, CameraState, InMemorySink, IDENTITY_TRANSFORM,
};
use xrbridge_session::{MockSensor, SensorEvent, SessionBridge, SessionConfig};
use xrbridge_worldmap::WorldMapStore;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let sensor = Arc::new(MockSensor::new());
    let sink = Arc::new(InMemorySink::new());
    let bridge = SessionBridge::new(sensor.clone(), sink.clone(), WorldMapStore::open_default()?);

    bridge.start(SessionConfig::default())?;
    sensor.set_anchors(vec![AnchorRecord::plane(
        AnchorId::new(),
        IDENTITY_TRANSFORM,
        [2.0, 1.0],
        [0.0; 3],
    )]);

    let frame = SensorEvent::FrameUpdated {
        camera: CameraState::default(),
        cv_frame: None,
    };

    // Undetermined: the plane exists but nothing is published.
    bridge.handle_event(frame);
    println!("undetermined: {} frames published", sink.len());

    // World sensing: the plane is disclosed on the next frame.
    bridge.set_authorization(AuthorizationTier::WorldSensing);
    bridge.handle_event(SensorEvent::FrameUpdated {
        camera: CameraState::default(),
        cv_frame: None,
    });
    let published = sink.last().expect("a frame was published");
    println!(
        "world sensing: {} anchors disclosed, {} newly added",
        published.objects.len(),
        published.added.len()
    );
    println!("{}", serde_json::to_string_pretty(&published)?);

    Ok(())
}
