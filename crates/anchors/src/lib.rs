//! Canonical anchor state for the AR session bridge.
//!
//! The registry owns the map from anchor identity to its disclosed snapshot
//! and the per-frame added/removed diff buffers. Registration is gated by
//! the authorization policy at the moment an anchor arrives; anchors that
//! fail the gate stay tracked by the hardware but invisible to the bridge.

mod record;
mod registry;

pub use record::{AnchorAttributes, AnchorRecord};
pub use registry::{AnchorRegistry, FrameDiff, IngestContext};
