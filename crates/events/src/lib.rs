//! Shared contracts for the AR session bridge.
//!
//! This crate defines the formal contracts (DTOs) that flow between the
//! sensor layer, the bridge core, and the embedded web page. Using shared
//! types prevents runtime deserialization errors from mismatched field
//! names on the web side.
//!
//! Also provides the `TransportSink` trait for decoupled frame publishing.

mod sink;

pub use sink::{InMemorySink, NullSink, TransportSink, TransportSinkRef};

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A 4x4 transform matrix in column-major order, as delivered by the sensor.
pub type Transform = [f32; 16];

/// The identity transform.
pub const IDENTITY_TRANSFORM: Transform = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Stable identifier of a hardware-tracked anchor.
///
/// Assigned by the sensor layer; never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorId(Uuid);

impl AnchorId {
    /// Generate a fresh identifier (sensor layer / test doubles only).
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AnchorId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AnchorId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of a hardware-tracked anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    /// A detected horizontal or vertical plane.
    Plane,
    /// An anchor created for a recognized reference image.
    Image,
    /// A tracked face (front camera configurations only).
    Face,
    /// A recognized 3D object.
    Object,
    /// A user-created or otherwise untyped anchor.
    Other,
}

/// The disclosure tier granted to the current web page.
///
/// Ordered: each tier is a superset of the disclosure granted by the tiers
/// below it. `NotDetermined` means the user has not answered yet and nothing
/// may be disclosed; requests arriving in this state are buffered rather
/// than denied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationTier {
    NotDetermined,
    Denied,
    Minimal,
    Lite,
    WorldSensing,
    VideoCameraAccess,
}

impl AuthorizationTier {
    /// Whether this tier discloses world-sensing data (planes, images,
    /// objects, world maps).
    pub fn grants_world_sensing(self) -> bool {
        matches!(self, Self::WorldSensing | Self::VideoCameraAccess)
    }

    /// Whether this tier is an explicit restriction chosen by the user, as
    /// opposed to the undetermined initial state.
    pub fn is_restricted(self) -> bool {
        matches!(self, Self::Denied | Self::Minimal | Self::Lite)
    }
}

impl Default for AuthorizationTier {
    fn default() -> Self {
        Self::NotDetermined
    }
}

/// Quality of the sensor's pose tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    NotAvailable,
    Limited,
    Normal,
}

/// Progress of the sensor's world-mapping process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldMappingStatus {
    NotAvailable,
    Limited,
    Extending,
    Mapped,
}

impl WorldMappingStatus {
    pub fn is_available(self) -> bool {
        !matches!(self, Self::NotAvailable)
    }
}

/// Web-facing representation of one anchor.
///
/// Derived from the canonical record; rebuilt whenever a
/// disclosure-relevant attribute changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorSnapshot {
    pub id: AnchorId,
    pub kind: AnchorKind,
    pub transform: Transform,
    /// Plane extent (width, length), planes only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extent: Option<[f32; 2]>,
    /// Plane center in anchor space, planes only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center: Option<[f32; 3]>,
    /// Name of the detected reference image, image anchors only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    /// External id supplied by the web page for user anchors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_anchor_id: Option<String>,
}

/// Camera pose and tracking data attached to each published frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraState {
    pub transform: Transform,
    pub tracking: TrackingState,
    /// Ambient light estimate in lumens.
    pub light_estimate: f32,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            transform: IDENTITY_TRANSFORM,
            tracking: TrackingState::NotAvailable,
            light_estimate: 0.0,
        }
    }
}

/// A downscaled camera frame for computer vision, attached only when the
/// page holds the `VideoCameraAccess` tier and requested one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvFrame {
    pub width: u32,
    pub height: u32,
    /// Downscale factor applied to the raw sensor frame; the web side uses
    /// it to rescale the camera intrinsics.
    pub scale_factor: f32,
    pub pixels: Vec<u8>,
}

/// The filtered per-frame snapshot handed to the web transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSnapshot {
    /// All currently disclosed anchors, keyed by anchor id.
    pub objects: BTreeMap<AnchorId, AnchorSnapshot>,
    /// Anchors disclosed since the last published frame.
    pub added: Vec<AnchorSnapshot>,
    /// Ids of anchors removed since the last published frame.
    pub removed: Vec<AnchorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_mapping_status: Option<WorldMappingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cv_frame: Option<CvFrame>,
}

/// A reference image the page wants the sensor to recognize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionImageDescriptor {
    /// Unique key for this image within the session.
    pub name: String,
    /// Raw RGBA8 pixel buffer.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Physical width of the printed image in meters.
    pub physical_width_m: f64,
}

impl DetectionImageDescriptor {
    /// Expected pixel buffer length for the declared dimensions.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Inbound request from the web transport. Each variant maps 1:1 to a
/// bridge operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeRequest {
    RequestSession { tier: AuthorizationTier },
    CreateDetectionImage { descriptor: DetectionImageDescriptor },
    ActivateDetectionImage { name: String },
    DeactivateDetectionImage { name: String },
    DestroyDetectionImage { name: String },
    GetWorldMap,
    SetWorldMap { map: Vec<u8> },
    AddAnchor { user_id: String, transform: Transform },
    RemoveAnchors { ids: Vec<String> },
    RequestCvFrame,
}

/// Outcome of an inbound request: boolean success, an optional
/// human-readable error, and an optional payload dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl BridgeResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            payload: None,
        }
    }

    pub fn with_payload(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            payload: None,
        }
    }
}
