//! Transport sink abstraction for frame publishing.
//!
//! Decouples the bridge core from the embedded web-view message transport,
//! allowing the core to be tested headless.

use std::sync::{Arc, Mutex};

use crate::FrameSnapshot;

/// Trait for delivering published frames to the web transport.
///
/// Implementations must be cheap: the bridge calls `publish` once per
/// published sensor frame, on the sensor callback context.
pub trait TransportSink: Send + Sync {
    fn publish(&self, frame: FrameSnapshot);
}

/// Type alias for a shared transport sink reference.
pub type TransportSinkRef = Arc<dyn TransportSink>;

/// In-memory sink for testing.
///
/// Captures all published frames for later inspection.
#[derive(Default)]
pub struct InMemorySink {
    frames: Mutex<Vec<FrameSnapshot>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all captured frames.
    pub fn frames(&self) -> Vec<FrameSnapshot> {
        self.frames.lock().unwrap().clone()
    }

    /// Get the most recently published frame.
    pub fn last(&self) -> Option<FrameSnapshot> {
        self.frames.lock().unwrap().last().cloned()
    }

    /// Clear all captured frames.
    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().unwrap().is_empty()
    }
}

impl TransportSink for InMemorySink {
    fn publish(&self, frame: FrameSnapshot) {
        self.frames.lock().unwrap().push(frame);
    }
}

/// No-op sink that discards all frames.
pub struct NullSink;

impl TransportSink for NullSink {
    fn publish(&self, _frame: FrameSnapshot) {
        // Intentionally empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sink_captures_frames() {
        let sink = InMemorySink::new();
        assert!(sink.is_empty());

        sink.publish(FrameSnapshot::default());
        sink.publish(FrameSnapshot::default());

        assert_eq!(sink.len(), 2);
        assert!(sink.last().is_some());

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_null_sink() {
        let sink = NullSink;
        // Should not panic
        sink.publish(FrameSnapshot::default());
    }
}
