//! Channel-based persistence worker for non-blocking world-map saves.
//!
//! Decouples the sensor delivery path from disk I/O by running writes on a
//! dedicated thread. Each persist request resolves its completion exactly
//! once, from the worker thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::{Result, WorldMapError};

/// Completion for a persist request.
pub type SaveCompletion = Box<dyn FnOnce(Result<()>) + Send>;

enum PersistRequest {
    Persist {
        blob: Vec<u8>,
        completion: SaveCompletion,
    },
    Discard,
    Shutdown,
}

pub(crate) struct PersistenceWorker {
    request_tx: mpsc::Sender<PersistRequest>,
    handle: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
    pub(crate) fn spawn(path: PathBuf) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<PersistRequest>();
        let handle = thread::spawn(move || {
            persistence_loop(&path, request_rx);
        });
        Self {
            request_tx,
            handle: Some(handle),
        }
    }

    pub(crate) fn persist(&self, blob: Vec<u8>, completion: SaveCompletion) {
        if let Err(mpsc::SendError(request)) = self
            .request_tx
            .send(PersistRequest::Persist { blob, completion })
        {
            // Worker gone; the completion must still fire exactly once.
            if let PersistRequest::Persist { completion, .. } = request {
                completion(Err(WorldMapError::Io(std::io::Error::other(
                    "persistence worker is not running",
                ))));
            }
        }
    }

    pub(crate) fn discard(&self) {
        let _ = self.request_tx.send(PersistRequest::Discard);
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        let _ = self.request_tx.send(PersistRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn persistence_loop(path: &Path, request_rx: mpsc::Receiver<PersistRequest>) {
    while let Ok(request) = request_rx.recv() {
        match request {
            PersistRequest::Persist { blob, completion } => {
                let result = atomic_write(path, &blob);
                match &result {
                    Ok(()) => tracing::debug!(?path, bytes = blob.len(), "world map saved"),
                    Err(error) => {
                        tracing::error!(?path, %error, "failed to save world map, discarding stale map");
                        // A failed save must not leave an outdated map in
                        // place.
                        let _ = std::fs::remove_file(path);
                    }
                }
                completion(result);
            }
            PersistRequest::Discard => {
                // Don't care if this fails.
                if std::fs::remove_file(path).is_ok() {
                    tracing::debug!(?path, "persisted world map discarded");
                }
            }
            PersistRequest::Shutdown => break,
        }
    }
}

/// Write to a temporary sibling and publish with an atomic rename, so a
/// partially written map is never observable as a valid load target.
fn atomic_write(path: &Path, blob: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, blob)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
