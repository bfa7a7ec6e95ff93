//! `SharedModel` — one-time, coalesced model load shared by every loop.
//!
//! ```text
//! Unloaded ──load()──► Loading ──ok──► Loaded
//!     ▲                   │
//!     └──────err/drop─────┘
//! ```
//!
//! Callers arriving while a load is in flight wait on the same outcome
//! instead of starting another one. A failed (or abandoned) load leaves the
//! slot `Unloaded`; only a later explicit `load()` tries again.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use super::ExpressionModel;
use crate::error::{Result, SessionError};

type LoadOutcome = std::result::Result<(), String>;

enum LoadSlot {
    Unloaded,
    Loading(watch::Sender<Option<LoadOutcome>>),
    Loaded,
}

pub struct SharedModel {
    backend: Arc<dyn ExpressionModel>,
    slot: Mutex<LoadSlot>,
    loads_started: AtomicUsize,
}

impl SharedModel {
    pub fn new(backend: Arc<dyn ExpressionModel>) -> Self {
        Self {
            backend,
            slot: Mutex::new(LoadSlot::Unloaded),
            loads_started: AtomicUsize::new(0),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.slot.lock(), LoadSlot::Loaded)
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.slot.lock(), LoadSlot::Loading(_))
    }

    /// Number of backend loads actually started.
    pub fn loads_started(&self) -> usize {
        self.loads_started.load(Ordering::Relaxed)
    }

    /// The classifier, for read-only per-frame use once loaded.
    pub fn backend(&self) -> Arc<dyn ExpressionModel> {
        Arc::clone(&self.backend)
    }

    /// Load the models, or join the load already in flight.
    ///
    /// # Errors
    /// `SessionError::ModelLoadFailed` if this load (or the one joined) fails.
    pub async fn load(&self) -> Result<()> {
        let waiter = {
            let mut slot = self.slot.lock();
            match &*slot {
                LoadSlot::Loaded => return Ok(()),
                LoadSlot::Loading(tx) => Some(tx.subscribe()),
                LoadSlot::Unloaded => {
                    let (tx, _rx) = watch::channel(None);
                    *slot = LoadSlot::Loading(tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .map(|seen| seen.clone().unwrap_or(Ok(())));
            return match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(msg)) => Err(SessionError::ModelLoadFailed(msg)),
                Err(_) => Err(SessionError::ModelLoadFailed("model load abandoned".into())),
            };
        }

        self.loads_started.fetch_add(1, Ordering::Relaxed);
        info!("loading expression models");
        let mut guard = LoadGuard {
            model: self,
            settled: false,
        };

        let outcome: LoadOutcome = self.backend.load_models().await.map_err(|e| match e {
            SessionError::ModelLoadFailed(msg) => msg,
            other => other.to_string(),
        });
        guard.settle(outcome.clone());

        match outcome {
            Ok(()) => {
                info!("expression models ready");
                Ok(())
            }
            Err(msg) => {
                warn!("expression model load failed: {msg}");
                Err(SessionError::ModelLoadFailed(msg))
            }
        }
    }
}

impl std::fmt::Debug for SharedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedModel")
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

/// Resets the slot if the loading future is dropped before settling.
struct LoadGuard<'a> {
    model: &'a SharedModel,
    settled: bool,
}

impl LoadGuard<'_> {
    fn settle(&mut self, outcome: LoadOutcome) {
        self.settled = true;
        let next = if outcome.is_ok() {
            LoadSlot::Loaded
        } else {
            LoadSlot::Unloaded
        };
        let previous = std::mem::replace(&mut *self.model.slot.lock(), next);
        if let LoadSlot::Loading(tx) = previous {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!("expression model load abandoned before completion");
        // Dropping the sender wakes waiters with an error.
        let mut slot = self.model.slot.lock();
        if matches!(*slot, LoadSlot::Loading(_)) {
            *slot = LoadSlot::Unloaded;
        }
    }
}
