//! Reference-image (marker) detection workflow.
//!
//! Tracks every registered detection image through its lifecycle and keeps
//! the outstanding-completion bookkeeping: at any instant an image name maps
//! to at most one outstanding creation completion and at most one
//! activation-family completion (activate, or reactivate-after-removal —
//! never both). Completions are always invoked after the workflow mutex is
//! released, so a completion may re-enter the workflow without deadlocking.

mod workflow;

pub use workflow::{
    ActivateCompletion, CreateCompletion, DetectionImageWorkflow, ImageAction, ImageLifecycle,
};

use thiserror::Error;

/// Result type for detection-image operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors from the detection-image workflow.
#[derive(Debug, Error, PartialEq)]
pub enum ImageError {
    /// Tier insufficient for world sensing.
    #[error("the user denied access to world sensing data")]
    PermissionDenied,

    /// No descriptor registered under this name.
    #[error("the image {0} doesn't exist")]
    NotFound(String),

    /// An activation-family completion is already outstanding for this name.
    #[error("trying to activate an image that's already activated but not found yet")]
    AlreadyActivating,

    /// A creation request for this name is already outstanding.
    #[error("a detection image named {0} already exists")]
    DuplicateName(String),

    /// Image detection is unavailable on face-tracking configurations.
    #[error("cannot activate a detection image when using the front facing camera")]
    FrontCamera,

    /// Deactivation requested for an image that is not in the active set.
    #[error("the image {0} is not activated")]
    NotActive(String),

    /// The image was deactivated before the sensor found it.
    #[error("the image was deactivated before being found")]
    DeactivatedBeforeFound,

    /// The image was destroyed while a completion was outstanding.
    #[error("the image was destroyed")]
    Destroyed,

    /// Pixel buffer does not match the declared dimensions.
    #[error("pixel buffer length {actual} does not match {expected} for the declared dimensions")]
    InvalidBuffer { expected: usize, actual: usize },
}
