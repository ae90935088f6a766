//! Session configuration and lifecycle state.

use xrbridge_events::DetectionImageDescriptor;

/// Lifecycle state of the sensor session.
///
/// `Running -> Unknown` is not a legal transition: once started, a session
/// is only ever paused or kept running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unknown,
    Paused,
    Running,
}

/// What the sensor tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    /// Rear camera, world geometry and reference images.
    #[default]
    WorldTracking,
    /// Front camera, face anchors only.
    FaceTracking,
}

/// How the sensor aligns its world coordinate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorldAlignment {
    #[default]
    Gravity,
    /// Gravity plus compass heading. Falls back to [`WorldAlignment::Gravity`]
    /// after a single sensor failure.
    GravityAndHeading,
}

/// The configuration handed to the sensor on every run.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub kind: SessionKind,
    pub alignment: WorldAlignment,
    /// Reference images the sensor should currently be looking for.
    pub detection_images: Vec<DetectionImageDescriptor>,
    /// World map to relocalize against on the next run.
    pub initial_world_map: Option<Vec<u8>>,
}

impl SessionConfig {
    pub fn is_face_tracking(&self) -> bool {
        self.kind == SessionKind::FaceTracking
    }
}

/// Reset behavior for one sensor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOptions {
    pub reset_tracking: bool,
    pub remove_existing_anchors: bool,
}

impl RunOptions {
    /// Full reset: tracking and anchors both discarded.
    pub fn reset() -> Self {
        Self {
            reset_tracking: true,
            remove_existing_anchors: true,
        }
    }

    /// Reset tracking but keep existing anchors.
    pub fn reset_tracking_only() -> Self {
        Self {
            reset_tracking: true,
            remove_existing_anchors: false,
        }
    }
}
