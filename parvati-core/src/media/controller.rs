//! `MediaStreamController` — maps call flags onto zero or one live handle.
//!
//! ```text
//! effective shape empty          → release (no-op without a handle)
//! no handle / shape mismatch     → release, then acquire exactly the shape
//! handle already matches         → nothing
//! ```
//!
//! Acquisition failures are returned untouched; rolling back the flags is the
//! session's job. The controller releases its handle when dropped so screen
//! teardown can never leak a live camera.

use std::sync::Arc;

use tracing::{info, warn};

use super::{Device, MediaHandle, MediaSource, TrackShape, VideoSource};
use crate::error::AcquireError;
use crate::ipc::events::CallState;

/// What `reconcile` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// The live handle (or its absence) already matched.
    Unchanged,
    /// The handle was released and nothing replaced it.
    Released,
    /// A new handle with this shape is live.
    Acquired(TrackShape),
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub acquisitions: u64,
    pub releases: u64,
}

pub struct MediaStreamController {
    source: Arc<dyn MediaSource>,
    handle: Option<MediaHandle>,
    stats: MediaStats,
}

impl MediaStreamController {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            handle: None,
            stats: MediaStats::default(),
        }
    }

    /// Bring the live handle in line with `state`.
    ///
    /// # Errors
    /// The backend's `AcquireError` when a required acquisition fails. No
    /// handle is live afterwards in that case.
    pub async fn reconcile(&mut self, state: &CallState) -> Result<Reconcile, AcquireError> {
        let wanted = state.effective_shape();

        if wanted.is_empty() {
            return Ok(if self.release() {
                Reconcile::Released
            } else {
                Reconcile::Unchanged
            });
        }

        if self.live_shape() == Some(wanted) {
            return Ok(Reconcile::Unchanged);
        }

        // Capability set changed: the old stream cannot be extended in place.
        self.release();

        let handle = self.source.acquire(wanted).await?;
        if handle.shape() != wanted {
            let got = handle.shape();
            handle.release();
            let missing = wanted
                .devices()
                .find(|d| !got.contains(*d))
                .or_else(|| got.devices().next())
                .unwrap_or(Device::Video);
            warn!(%wanted, %got, "backend returned a stream with the wrong tracks");
            return Err(AcquireError::DeviceUnavailable {
                device: missing,
                detail: format!("requested {wanted}, backend delivered {got}"),
            });
        }

        info!(handle = handle.id(), shape = %wanted, "media acquired");
        self.stats.acquisitions += 1;
        self.handle = Some(handle);
        Ok(Reconcile::Acquired(wanted))
    }

    /// Stop and drop the live handle. Returns `false` if there was none.
    pub fn release(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                info!(handle = handle.id(), shape = %handle.shape(), "media released");
                handle.release();
                self.stats.releases += 1;
                true
            }
            None => false,
        }
    }

    pub fn live_shape(&self) -> Option<TrackShape> {
        self.handle.as_ref().map(MediaHandle::shape)
    }

    pub fn handle_id(&self) -> Option<u64> {
        self.handle.as_ref().map(MediaHandle::id)
    }

    /// Read-only frame access for consumers of the live stream.
    pub fn video_source(&self) -> Option<Arc<dyn VideoSource>> {
        self.handle.as_ref().and_then(MediaHandle::video_source)
    }

    pub fn stats(&self) -> MediaStats {
        self.stats
    }
}

impl Drop for MediaStreamController {
    fn drop(&mut self) {
        self.release();
    }
}
