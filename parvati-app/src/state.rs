//! Host application state.
//!
//! `AppState` owns the call session and settings, and forwards every session
//! event to stdout as one JSON line so a UI shell can follow along.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use parvati_core::detect::stub::StubExpressionModel;
use parvati_core::media::stub::StubMediaSource;
use parvati_core::widget::EmbedPolicy;
use parvati_core::{CallSession, MediaSource, SessionEvent, SharedModel};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::settings::AppSettings;

/// Shared application state, available to every command handler.
pub struct AppState {
    pub session: Arc<CallSession>,
    /// Persisted app settings cache.
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    pub widget: EmbedPolicy,
}

impl AppState {
    pub fn new(settings: AppSettings, settings_path: PathBuf) -> anyhow::Result<Self> {
        let source = build_media_source(&settings).context("media backend")?;
        // No bundled classifier yet; the stub keeps the pipeline observable.
        let model = Arc::new(SharedModel::new(Arc::new(StubExpressionModel::new())));
        let session = Arc::new(CallSession::new(settings.session_config(), source, model));
        info!(backend = %settings.media_backend, "session ready");

        Ok(Self {
            session,
            widget: settings.embed_policy(),
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
        })
    }

    /// Forward state, emotion and detection events to stdout until the
    /// session's channels close.
    pub fn spawn_event_forwarders(&self) -> Vec<JoinHandle<()>> {
        vec![
            forward("state", self.session.subscribe_state(), SessionEvent::State),
            forward(
                "emotion",
                self.session.subscribe_emotions(),
                SessionEvent::Emotion,
            ),
            forward(
                "detection",
                self.session.subscribe_detection(),
                SessionEvent::Detection,
            ),
        ]
    }
}

fn build_media_source(settings: &AppSettings) -> anyhow::Result<Arc<dyn MediaSource>> {
    if settings.media_backend == "host" {
        #[cfg(feature = "audio-cpal")]
        {
            return Ok(Arc::new(parvati_core::HostMediaSource::new(
                settings.preferred_input_device.clone(),
            )));
        }
        #[cfg(not(feature = "audio-cpal"))]
        anyhow::bail!("host media backend requires the `audio-cpal` feature");
    }

    let stub = StubMediaSource::with_latency(Duration::from_millis(settings.stub_latency_ms));
    for device in settings.stub_denials() {
        stub.deny(device);
    }
    Ok(Arc::new(stub))
}

fn forward<T>(
    channel: &'static str,
    mut rx: broadcast::Receiver<T>,
    wrap: fn(T) -> SessionEvent,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => emit_line(&wrap(event)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{channel} receiver lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Write one JSON line to stdout.
pub fn emit_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("serialize event: {e}"),
    }
}
