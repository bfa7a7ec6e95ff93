//! `StubMediaSource` — in-process capture backend with scriptable failures.
//!
//! Hands out tracks that only count themselves, plus a synthetic
//! `StubVideoSource` whose readiness can be flipped from outside. Used by the
//! test suite and by the host binary's `stub` backend so the whole session
//! can be driven without a camera.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    Device, Frame, MediaHandle, MediaSource, MediaTrack, Readiness, TrackShape, VideoSource,
};
use crate::error::AcquireError;

const STUB_FRAME_WIDTH: u32 = 64;
const STUB_FRAME_HEIGHT: u32 = 48;

/// Synthetic camera feed.
pub struct StubVideoSource {
    readiness: Mutex<Readiness>,
    frames_served: AtomicUsize,
}

impl StubVideoSource {
    pub fn new() -> Self {
        Self {
            readiness: Mutex::new(Readiness::Playing),
            frames_served: AtomicUsize::new(0),
        }
    }

    pub fn set_readiness(&self, readiness: Readiness) {
        *self.readiness.lock() = readiness;
    }

    pub fn frames_served(&self) -> usize {
        self.frames_served.load(Ordering::Relaxed)
    }
}

impl Default for StubVideoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSource for StubVideoSource {
    fn readiness(&self) -> Readiness {
        *self.readiness.lock()
    }

    fn frame(&self) -> Option<Frame> {
        if self.readiness() != Readiness::Playing {
            return None;
        }
        let n = self.frames_served.fetch_add(1, Ordering::Relaxed);
        let shade = (n % 256) as u8;
        let len = (STUB_FRAME_WIDTH * STUB_FRAME_HEIGHT * 3) as usize;
        Some(Frame::new(vec![shade; len], STUB_FRAME_WIDTH, STUB_FRAME_HEIGHT))
    }
}

struct StubTrack {
    device: Device,
    stopped: AtomicBool,
    live: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
    video: Option<Arc<StubVideoSource>>,
}

impl MediaTrack for StubTrack {
    fn device(&self) -> Device {
        self.device
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn video_source(&self) -> Option<Arc<dyn VideoSource>> {
        self.video
            .as_ref()
            .map(|v| Arc::clone(v) as Arc<dyn VideoSource>)
    }
}

/// Scriptable capture backend.
pub struct StubMediaSource {
    video: Arc<StubVideoSource>,
    live: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
    acquisitions: AtomicUsize,
    probes: AtomicUsize,
    denied: Mutex<TrackShape>,
    unavailable: Mutex<TrackShape>,
    omitted: Mutex<TrackShape>,
    requests: Mutex<Vec<TrackShape>>,
    latency: Duration,
}

impl StubMediaSource {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Each acquisition sleeps for `latency` first, like a permission prompt.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            video: Arc::new(StubVideoSource::new()),
            live: Arc::new(AtomicUsize::new(0)),
            stop_calls: Arc::new(AtomicUsize::new(0)),
            acquisitions: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            denied: Mutex::new(TrackShape::NONE),
            unavailable: Mutex::new(TrackShape::NONE),
            omitted: Mutex::new(TrackShape::NONE),
            requests: Mutex::new(Vec::new()),
            latency,
        }
    }

    /// Refuse permission for `device` from now on.
    pub fn deny(&self, device: Device) {
        let mut denied = self.denied.lock();
        *denied = denied.with(device, true);
    }

    /// Grant permission for `device` again.
    pub fn allow(&self, device: Device) {
        let mut denied = self.denied.lock();
        *denied = denied.with(device, false);
    }

    /// Report `device` as busy/absent (`on = false` restores it).
    pub fn set_unavailable(&self, device: Device, on: bool) {
        let mut unavailable = self.unavailable.lock();
        *unavailable = unavailable.with(device, on);
    }

    /// Silently leave `device` out of acquired streams.
    pub fn omit_track(&self, device: Device) {
        let mut omitted = self.omitted.lock();
        *omitted = omitted.with(device, true);
    }

    /// The camera feed every video track reads from.
    pub fn video(&self) -> Arc<StubVideoSource> {
        Arc::clone(&self.video)
    }

    /// Tracks acquired and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Raw number of `MediaTrack::stop` calls, including repeats.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Successful acquisitions.
    pub fn acquire_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Every shape passed to `acquire`, in order.
    pub fn requests(&self) -> Vec<TrackShape> {
        self.requests.lock().clone()
    }

    fn check(&self, shape: TrackShape) -> Result<(), AcquireError> {
        let denied = *self.denied.lock();
        if let Some(device) = shape.devices().find(|d| denied.contains(*d)) {
            return Err(AcquireError::PermissionDenied { device });
        }
        let unavailable = *self.unavailable.lock();
        if let Some(device) = shape.devices().find(|d| unavailable.contains(*d)) {
            return Err(AcquireError::DeviceUnavailable {
                device,
                detail: "device busy".into(),
            });
        }
        Ok(())
    }
}

impl Default for StubMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for StubMediaSource {
    async fn acquire(&self, shape: TrackShape) -> Result<MediaHandle, AcquireError> {
        self.requests.lock().push(shape);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.check(shape)?;

        let omitted = *self.omitted.lock();
        let tracks = shape
            .devices()
            .filter(|d| !omitted.contains(*d))
            .map(|device| {
                self.live.fetch_add(1, Ordering::SeqCst);
                Box::new(StubTrack {
                    device,
                    stopped: AtomicBool::new(false),
                    live: Arc::clone(&self.live),
                    stop_calls: Arc::clone(&self.stop_calls),
                    video: (device == Device::Video).then(|| Arc::clone(&self.video)),
                }) as Box<dyn MediaTrack>
            })
            .collect();

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        debug!(%shape, "stub media acquired");
        Ok(MediaHandle::new(tracks))
    }

    async fn probe(&self, device: Device) -> Result<(), AcquireError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.check(TrackShape::only(device))
    }
}
