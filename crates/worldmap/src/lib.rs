//! Save/load/availability logic for persisted spatial maps.
//!
//! The store treats the world map as an opaque blob. Writes are atomic
//! (temporary file plus rename) and run on a dedicated worker thread so the
//! sensor delivery path never blocks on I/O. A hardware failure to produce
//! a map discards any previously persisted map instead of leaving a stale
//! one behind.

mod worker;

pub use worker::SaveCompletion;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use xrbridge_events::{TrackingState, WorldMappingStatus};

use crate::worker::PersistenceWorker;

/// Result type for world-map operations.
pub type Result<T> = std::result::Result<T, WorldMapError>;

/// Errors from world-map persistence.
#[derive(Debug, Error)]
pub enum WorldMapError {
    /// Save requires the tracking state to be normal.
    #[error("cannot save a world map until tracking is initialized")]
    TrackingNotNormal,

    /// Save requires world mapping to have started.
    #[error("cannot save a world map until world mapping has started")]
    MappingUnavailable,

    /// No persisted map exists.
    #[error("no world map has been saved")]
    NoSavedMap,

    /// The sensor failed to produce a map.
    #[error("the sensor failed to produce a world map: {0}")]
    Acquisition(String),

    #[error("world map I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A loaded world map: the opaque blob plus when it was persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldMapRecord {
    pub blob: Vec<u8>,
    pub saved_at: DateTime<Utc>,
}

/// Persistent store for the session's world map.
pub struct WorldMapStore {
    path: PathBuf,
    worker: PersistenceWorker,
}

impl WorldMapStore {
    /// Open a store persisting to the given file path. The parent directory
    /// is created if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let worker = PersistenceWorker::spawn(path.clone());
        Ok(Self { path, worker })
    }

    /// Open a store at the platform data directory.
    pub fn open_default() -> Result<Self> {
        let base = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        Self::open(base.join("xrbridge").join("maps").join("worldmap.bin"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail fast unless the live session can produce a usable map: tracking
    /// must be normal and world mapping must have started. No I/O happens
    /// here.
    pub fn check_save_preconditions(
        tracking: TrackingState,
        mapping: WorldMappingStatus,
    ) -> Result<()> {
        if tracking != TrackingState::Normal {
            return Err(WorldMapError::TrackingNotNormal);
        }
        if !mapping.is_available() {
            return Err(WorldMapError::MappingUnavailable);
        }
        Ok(())
    }

    /// Hand a freshly acquired map blob to the persistence worker. Returns
    /// immediately; the completion fires from the worker thread after the
    /// atomic write-replace finishes (or fails).
    pub fn persist(&self, blob: Vec<u8>, completion: SaveCompletion) {
        self.worker.persist(blob, completion);
    }

    /// Discard any persisted map. Used when the sensor fails to produce a
    /// map, so a stale one is never left in place. Best effort.
    pub fn discard(&self) {
        self.worker.discard();
    }

    /// Whether a persisted map currently exists.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the persisted map. Read-only with respect to disk state.
    pub fn load(&self) -> Result<WorldMapRecord> {
        if !self.exists() {
            return Err(WorldMapError::NoSavedMap);
        }
        let blob = std::fs::read(&self.path)?;
        let saved_at = std::fs::metadata(&self.path)?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(WorldMapRecord { blob, saved_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn temp_store() -> WorldMapStore {
        let dir = std::env::temp_dir()
            .join("xrbridge-worldmap-tests")
            .join(uuid::Uuid::new_v4().to_string());
        WorldMapStore::open(dir.join("worldmap.bin")).unwrap()
    }

    fn persist_blocking(store: &WorldMapStore, blob: Vec<u8>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        store.persist(blob, Box::new(move |r| tx.send(r).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_save_preconditions() {
        assert!(matches!(
            WorldMapStore::check_save_preconditions(
                TrackingState::Limited,
                WorldMappingStatus::Mapped
            ),
            Err(WorldMapError::TrackingNotNormal)
        ));
        assert!(matches!(
            WorldMapStore::check_save_preconditions(
                TrackingState::Normal,
                WorldMappingStatus::NotAvailable
            ),
            Err(WorldMapError::MappingUnavailable)
        ));
        assert!(WorldMapStore::check_save_preconditions(
            TrackingState::Normal,
            WorldMappingStatus::Extending
        )
        .is_ok());
    }

    #[test]
    fn test_persist_then_load_round_trip() {
        let store = temp_store();
        assert!(!store.exists());

        persist_blocking(&store, vec![1, 2, 3, 4]).unwrap();
        assert!(store.exists());

        let record = store.load().unwrap();
        assert_eq!(record.blob, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_persist_replaces_previous_map() {
        let store = temp_store();
        persist_blocking(&store, vec![1]).unwrap();
        persist_blocking(&store, vec![2, 2]).unwrap();
        assert_eq!(store.load().unwrap().blob, vec![2, 2]);
    }

    #[test]
    fn test_no_temporary_file_left_behind() {
        let store = temp_store();
        persist_blocking(&store, vec![9; 128]).unwrap();
        let tmp = store.path().with_extension("tmp");
        assert!(!tmp.exists());
    }

    #[test]
    fn test_load_missing_map() {
        let store = temp_store();
        assert!(matches!(store.load(), Err(WorldMapError::NoSavedMap)));
    }

    #[test]
    fn test_discard_removes_map() {
        let store = temp_store();
        persist_blocking(&store, vec![7]).unwrap();

        store.discard();
        // Discard is asynchronous; poll until the worker has processed it.
        for _ in 0..500 {
            if !store.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!store.exists());
        assert!(matches!(store.load(), Err(WorldMapError::NoSavedMap)));
    }
}
