//! Camera / microphone stream handles and the capability-acquisition seam.
//!
//! A `MediaSource` turns a requested `TrackShape` into a `MediaHandle`.
//! Handles own their tracks; stopping happens exactly once, either through
//! `MediaHandle::release` or when the handle is dropped. Consumers such as
//! the detection loop only ever see a read-only `VideoSource`.

pub mod controller;
pub mod stub;

#[cfg(feature = "audio-cpal")]
pub mod host;

pub use controller::{MediaStats, MediaStreamController, Reconcile};

use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AcquireError;

/// Capture device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Audio,
    Video,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Audio => "audio",
            Device::Video => "video",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tracks a stream carries (or should carry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TrackShape {
    pub audio: bool,
    pub video: bool,
}

impl TrackShape {
    pub const NONE: TrackShape = TrackShape {
        audio: false,
        video: false,
    };

    pub const BOTH: TrackShape = TrackShape {
        audio: true,
        video: true,
    };

    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }

    /// Shape containing just `device`.
    pub fn only(device: Device) -> Self {
        Self::NONE.with(device, true)
    }

    pub fn with(mut self, device: Device, on: bool) -> Self {
        match device {
            Device::Audio => self.audio = on,
            Device::Video => self.video = on,
        }
        self
    }

    pub fn contains(self, device: Device) -> bool {
        match device {
            Device::Audio => self.audio,
            Device::Video => self.video,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.audio && !self.video
    }

    pub fn devices(self) -> impl Iterator<Item = Device> {
        [Device::Audio, Device::Video]
            .into_iter()
            .filter(move |d| self.contains(*d))
    }
}

impl fmt::Display for TrackShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.audio, self.video) {
            (true, true) => f.write_str("audio+video"),
            (true, false) => f.write_str("audio-only"),
            (false, true) => f.write_str("video-only"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// A single RGB video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }
}

/// Playback state of a video source as seen by a frame consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Playing with enough buffered data to grab a frame.
    Playing,
    /// Playing but not enough data yet.
    Buffering,
    Paused,
    /// The stream will not produce further frames.
    Ended,
}

/// Read-only view of a live video track.
pub trait VideoSource: Send + Sync + 'static {
    fn readiness(&self) -> Readiness;

    /// Latest frame, or `None` if nothing is available right now.
    fn frame(&self) -> Option<Frame>;
}

/// One track of an acquired stream.
pub trait MediaTrack: Send + Sync + 'static {
    fn device(&self) -> Device;

    /// Stop the underlying capture. Called at most once per track by
    /// `MediaHandle`.
    fn stop(&self);

    /// Frame access for video tracks.
    fn video_source(&self) -> Option<Arc<dyn VideoSource>> {
        None
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An acquired camera/microphone stream.
///
/// Not `Clone`: the handle is the single owner of its tracks.
pub struct MediaHandle {
    id: u64,
    shape: TrackShape,
    tracks: Vec<Box<dyn MediaTrack>>,
    released: bool,
}

impl MediaHandle {
    pub fn new(tracks: Vec<Box<dyn MediaTrack>>) -> Self {
        let shape = tracks
            .iter()
            .fold(TrackShape::NONE, |shape, t| shape.with(t.device(), true));
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            shape,
            tracks,
            released: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shape(&self) -> TrackShape {
        self.shape
    }

    /// First video track's frame source, if any.
    pub fn video_source(&self) -> Option<Arc<dyn VideoSource>> {
        self.tracks.iter().find_map(|t| t.video_source())
    }

    /// Stop every track and consume the handle.
    pub fn release(mut self) {
        self.stop_tracks();
    }

    fn stop_tracks(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for track in &self.tracks {
            track.stop();
        }
        debug!(handle = self.id, shape = %self.shape, "media tracks stopped");
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("tracks", &self.tracks.len())
            .finish_non_exhaustive()
    }
}

/// Capability acquisition backend.
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    /// Acquire a stream carrying exactly `shape`. `shape` is never empty.
    async fn acquire(&self, shape: TrackShape) -> Result<MediaHandle, AcquireError>;

    /// Confirm that `device` can be obtained. The default acquires a
    /// single-track stream and releases it immediately.
    async fn probe(&self, device: Device) -> Result<(), AcquireError> {
        let handle = self.acquire(TrackShape::only(device)).await?;
        handle.release();
        Ok(())
    }
}
