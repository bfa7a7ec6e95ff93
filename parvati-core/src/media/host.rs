//! `HostMediaSource` — microphone capture on the local machine via cpal.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so each microphone track parks a dedicated thread that opens the
//! stream, reports the outcome over a oneshot, and drops the stream on the
//! same thread once the track is stopped.
//!
//! There is no camera backend here: any request that includes video fails
//! with `DeviceUnavailable`.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::Thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, Stream, StreamConfig,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::{Device, MediaHandle, MediaSource, MediaTrack, TrackShape};
use crate::error::AcquireError;

const PARK_INTERVAL: Duration = Duration::from_millis(250);

/// Local microphone backend.
#[derive(Debug, Clone, Default)]
pub struct HostMediaSource {
    preferred_input_device: Option<String>,
}

impl HostMediaSource {
    pub fn new(preferred_input_device: Option<String>) -> Self {
        Self {
            preferred_input_device,
        }
    }
}

#[async_trait]
impl MediaSource for HostMediaSource {
    async fn acquire(&self, shape: TrackShape) -> Result<MediaHandle, AcquireError> {
        if shape.video {
            return Err(AcquireError::DeviceUnavailable {
                device: Device::Video,
                detail: "no camera backend on this host".into(),
            });
        }
        let track = MicrophoneTrack::open(self.preferred_input_device.clone()).await?;
        Ok(MediaHandle::new(vec![Box::new(track) as Box<dyn MediaTrack>]))
    }
}

struct MicrophoneTrack {
    running: Arc<AtomicBool>,
    thread: Thread,
}

impl MicrophoneTrack {
    async fn open(preferred: Option<String>) -> Result<Self, AcquireError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = Arc::clone(&running);
        let (open_tx, open_rx) = oneshot::channel::<Result<(), AcquireError>>();

        let join = std::thread::Builder::new()
            .name("parvati-mic".into())
            .spawn(move || {
                let frames = Arc::new(AtomicU64::new(0));
                let stream = match open_input_stream(
                    preferred.as_deref(),
                    Arc::clone(&running_thread),
                    Arc::clone(&frames),
                ) {
                    Ok(stream) => {
                        if open_tx.send(Ok(())).is_err() {
                            // Acquisition was abandoned; nobody owns this track.
                            drop(stream);
                            warn!("microphone opened after acquisition was abandoned");
                            return;
                        }
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                while running_thread.load(Ordering::Acquire) {
                    std::thread::park_timeout(PARK_INTERVAL);
                }

                // Stream drops here, releasing the device on its creation thread.
                drop(stream);
                info!(
                    frames = frames.load(Ordering::Relaxed),
                    "microphone released"
                );
            })
            .map_err(|e| AcquireError::DeviceUnavailable {
                device: Device::Audio,
                detail: format!("failed to spawn capture thread: {e}"),
            })?;

        let thread = join.thread().clone();
        match open_rx.await {
            Ok(Ok(())) => Ok(Self { running, thread }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AcquireError::DeviceUnavailable {
                device: Device::Audio,
                detail: "capture thread exited before opening the device".into(),
            }),
        }
    }
}

impl MediaTrack for MicrophoneTrack {
    fn device(&self) -> Device {
        Device::Audio
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.thread.unpark();
    }
}

fn unavailable(detail: impl Into<String>) -> AcquireError {
    AcquireError::DeviceUnavailable {
        device: Device::Audio,
        detail: detail.into(),
    }
}

fn classify_build_error(err: cpal::BuildStreamError) -> AcquireError {
    let text = err.to_string();
    let lowered = text.to_ascii_lowercase();
    if ["permission", "denied", "not allowed"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        AcquireError::PermissionDenied {
            device: Device::Audio,
        }
    } else {
        unavailable(text)
    }
}

fn open_input_stream(
    preferred: Option<&str>,
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
) -> Result<Stream, AcquireError> {
    let host = cpal::default_host();

    let mut selected = None;
    if let Some(name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                selected = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false));
                if selected.is_none() {
                    warn!("preferred input device '{name}' not found, falling back");
                }
            }
            Err(e) => warn!("failed to list input devices: {e}"),
        }
    }

    let device = match selected.or_else(|| host.default_input_device()) {
        Some(device) => device,
        None => return Err(unavailable("no input device found")),
    };

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening microphone"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| unavailable(e.to_string()))?;
    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels.max(1));

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _info| {
                if running.load(Ordering::Relaxed) {
                    frames.fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
                }
            },
            |err| error!("microphone stream error: {err}"),
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _info| {
                if running.load(Ordering::Relaxed) {
                    frames.fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
                }
            },
            |err| error!("microphone stream error: {err}"),
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _info| {
                if running.load(Ordering::Relaxed) {
                    frames.fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
                }
            },
            |err| error!("microphone stream error: {err}"),
            None,
        ),
        fmt => return Err(unavailable(format!("unsupported sample format: {fmt:?}"))),
    }
    .map_err(classify_build_error)?;

    stream
        .play()
        .map_err(|e| unavailable(e.to_string()))?;

    Ok(stream)
}
