//! The boundary to the hardware sensor layer.
//!
//! The bridge never talks to real hardware directly; it drives a
//! [`SensorSession`] and consumes [`SensorEvent`]s delivered on the sensor
//! callback context. [`MockSensor`] is the in-memory implementation used by
//! tests and examples.

use std::sync::Mutex;

use thiserror::Error;
use xrbridge_anchors::AnchorRecord;
use xrbridge_events::{AnchorId, CameraState, CvFrame, Transform, TrackingState, WorldMappingStatus};

use crate::config::{RunOptions, SessionConfig};

/// A sensor-level fatal error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SensorError(pub String);

impl SensorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Completion for an asynchronous world-map acquisition.
pub type AcquireMapCompletion = Box<dyn FnOnce(Result<Vec<u8>, SensorError>) + Send>;

/// Events delivered by the sensor layer on its callback context.
#[derive(Debug)]
pub enum SensorEvent {
    AnchorsAdded(Vec<AnchorRecord>),
    AnchorsUpdated(Vec<AnchorRecord>),
    AnchorsRemoved(Vec<AnchorRecord>),
    /// Per-frame pose and light estimate, plus an optional downscaled
    /// camera image when one was produced.
    FrameUpdated {
        camera: CameraState,
        cv_frame: Option<CvFrame>,
    },
    TrackingChanged(TrackingState),
    Interrupted,
    InterruptionEnded,
    Failed(SensorError),
}

/// What the bridge is allowed to ask of the hardware.
pub trait SensorSession: Send + Sync {
    /// (Re)start the session with the given configuration and reset
    /// behavior.
    fn run(&self, config: &SessionConfig, options: RunOptions) -> Result<(), SensorError>;

    fn pause(&self);

    /// Create a user anchor at the given pose. The sensor reports it back
    /// through [`SensorEvent::AnchorsAdded`].
    fn add_anchor(&self, transform: Transform) -> Result<AnchorId, SensorError>;

    /// Request removal of one anchor. The sensor confirms through
    /// [`SensorEvent::AnchorsRemoved`].
    fn remove_anchor(&self, id: AnchorId);

    /// Every anchor currently tracked, disclosed or not.
    fn current_anchors(&self) -> Vec<AnchorRecord>;

    fn tracking_state(&self) -> TrackingState;

    fn world_mapping_status(&self) -> WorldMappingStatus;

    /// Ask the sensor to serialize its current world map. The completion
    /// fires once, on an arbitrary context.
    fn acquire_world_map(&self, completion: AcquireMapCompletion);
}

struct MockSensorInner {
    anchors: Vec<AnchorRecord>,
    tracking: TrackingState,
    mapping: WorldMappingStatus,
    runs: Vec<(SessionConfig, RunOptions)>,
    paused: bool,
    removed: Vec<AnchorId>,
    map_blob: Option<Vec<u8>>,
    fail_next_run: Option<SensorError>,
}

/// Scriptable in-memory sensor for tests and examples.
pub struct MockSensor {
    inner: Mutex<MockSensorInner>,
}

impl Default for MockSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSensor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockSensorInner {
                anchors: Vec::new(),
                tracking: TrackingState::Normal,
                mapping: WorldMappingStatus::Mapped,
                runs: Vec::new(),
                paused: true,
                removed: Vec::new(),
                map_blob: None,
                fail_next_run: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockSensorInner> {
        self.inner.lock().expect("mock sensor mutex poisoned")
    }

    pub fn set_tracking(&self, tracking: TrackingState) {
        self.lock().tracking = tracking;
    }

    pub fn set_mapping(&self, mapping: WorldMappingStatus) {
        self.lock().mapping = mapping;
    }

    /// Seed the set of live anchors the sensor reports from
    /// `current_anchors`.
    pub fn set_anchors(&self, anchors: Vec<AnchorRecord>) {
        self.lock().anchors = anchors;
    }

    /// Blob returned by the next `acquire_world_map`; `None` makes the
    /// acquisition fail.
    pub fn set_map_blob(&self, blob: Option<Vec<u8>>) {
        self.lock().map_blob = blob;
    }

    pub fn fail_next_run(&self, error: SensorError) {
        self.lock().fail_next_run = Some(error);
    }

    /// Every `(config, options)` pair `run` was called with, in order.
    pub fn runs(&self) -> Vec<(SessionConfig, RunOptions)> {
        self.lock().runs.clone()
    }

    pub fn last_run(&self) -> Option<(SessionConfig, RunOptions)> {
        self.lock().runs.last().cloned()
    }

    /// Anchor ids the bridge asked to remove, in order.
    pub fn removed_anchors(&self) -> Vec<AnchorId> {
        self.lock().removed.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }
}

impl SensorSession for MockSensor {
    fn run(&self, config: &SessionConfig, options: RunOptions) -> Result<(), SensorError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_run.take() {
            return Err(error);
        }
        if options.remove_existing_anchors {
            inner.anchors.clear();
        }
        inner.paused = false;
        inner.runs.push((config.clone(), options));
        Ok(())
    }

    fn pause(&self) {
        self.lock().paused = true;
    }

    fn add_anchor(&self, transform: Transform) -> Result<AnchorId, SensorError> {
        let id = AnchorId::new();
        self.lock().anchors.push(AnchorRecord::user(id, transform));
        Ok(id)
    }

    fn remove_anchor(&self, id: AnchorId) {
        let mut inner = self.lock();
        inner.anchors.retain(|a| a.id != id);
        inner.removed.push(id);
    }

    fn current_anchors(&self) -> Vec<AnchorRecord> {
        self.lock().anchors.clone()
    }

    fn tracking_state(&self) -> TrackingState {
        self.lock().tracking
    }

    fn world_mapping_status(&self) -> WorldMappingStatus {
        self.lock().mapping
    }

    fn acquire_world_map(&self, completion: AcquireMapCompletion) {
        let blob = self.lock().map_blob.clone();
        match blob {
            Some(blob) => completion(Ok(blob)),
            None => completion(Err(SensorError::new("world map acquisition failed"))),
        }
    }
}
