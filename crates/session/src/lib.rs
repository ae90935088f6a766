//! Session orchestration for the AR bridge.
//!
//! [`SessionBridge`] ties the pieces together: it drives the sensor through
//! the [`SensorSession`] trait, filters anchor events through the
//! authorization policy into the registry, runs the detection-image
//! workflow, persists world maps, and publishes per-frame snapshots through
//! a `TransportSink`. Inbound web requests arrive as `BridgeRequest` values
//! and are dispatched 1:1 onto bridge operations.

mod bridge;
mod config;
mod sensor;

pub use bridge::{ResponseCompletion, SessionBridge, WorldMapCompletion};
pub use config::{RunOptions, SessionConfig, SessionKind, SessionState, WorldAlignment};
pub use sensor::{AcquireMapCompletion, MockSensor, SensorError, SensorEvent, SensorSession};

use thiserror::Error;
use xrbridge_images::ImageError;
use xrbridge_worldmap::WorldMapError;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced to the web transport.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Tier insufficient for the requested operation.
    #[error("the user denied access to world sensing data")]
    PermissionDenied,

    /// A duplicate outstanding request for the same key.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    WorldMap(#[from] WorldMapError),

    /// An inbound world map blob that cannot be handed to the sensor.
    #[error("the supplied world map is not valid")]
    InvalidWorldMap,

    /// Sensor-level fatal error; the session must be restarted.
    #[error("sensor failure: {0}")]
    Hardware(String),
}
