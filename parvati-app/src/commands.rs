//! Intent handlers.
//!
//! Each handler maps one UI command onto the session and reports failures
//! as plain strings, the way a frontend bridge would receive them.

use std::str::FromStr;
use std::time::Duration;

use parvati_core::widget::{self, InboundKind, WidgetMessage};
use parvati_core::{CallState, DetectionStatus, ExpressionSample, TrackShape};
use serde::Serialize;
use tracing::info;

use crate::settings::save_settings;
use crate::state::{emit_line, AppState};

/// One step of a command-line intent script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    StartCall,
    EndCall,
    ToggleMic,
    ToggleVideo,
    Wait(Duration),
    Status,
    /// Simulate an inbound string message from the widget.
    WidgetMessage(String),
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if let Some(ms) = raw.strip_prefix("wait:") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| format!("invalid wait duration: {ms:?}"))?;
            return Ok(Intent::Wait(Duration::from_millis(ms)));
        }
        if let Some(text) = raw.strip_prefix("widget:") {
            return Ok(Intent::WidgetMessage(text.to_string()));
        }
        match raw.to_ascii_lowercase().as_str() {
            "start" | "start-call" => Ok(Intent::StartCall),
            "end" | "end-call" => Ok(Intent::EndCall),
            "mic" | "toggle-mic" => Ok(Intent::ToggleMic),
            "video" | "toggle-video" => Ok(Intent::ToggleVideo),
            "status" => Ok(Intent::Status),
            other => Err(format!("unknown intent: {other:?}")),
        }
    }
}

/// Point-in-time view of the session for the `status` intent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub state: CallState,
    pub media: TrackShape,
    pub detection: DetectionStatus,
    pub emotion: Option<ExpressionSample>,
}

pub async fn start_call(state: &AppState) -> Result<CallState, String> {
    state.session.start_call().await.map_err(|e| e.to_string())
}

pub async fn end_call(state: &AppState) -> Result<CallState, String> {
    Ok(state.session.end_call().await)
}

pub async fn toggle_mic(state: &AppState) -> Result<CallState, String> {
    state.session.toggle_mic().await.map_err(|e| e.to_string())
}

pub async fn toggle_video(state: &AppState) -> Result<CallState, String> {
    state.session.toggle_video().await.map_err(|e| e.to_string())
}

pub fn get_status(state: &AppState) -> StatusPayload {
    StatusPayload {
        state: state.session.state(),
        media: state.session.live_shape(),
        detection: state.session.detection_status(),
        emotion: state.session.current_emotion(),
    }
}

/// Message to post into the widget frame once it has loaded.
pub fn widget_loaded() -> WidgetMessage {
    let message = widget::handshake();
    info!(?message, "widget loaded, sending handshake");
    message
}

pub fn widget_message(text: &str) -> InboundKind {
    widget::classify_inbound(text)
}

/// Persist the preferred input device name used by the host backend.
pub fn set_preferred_input_device(
    state: &AppState,
    device_name: Option<String>,
) -> Result<(), String> {
    let normalized = device_name
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let mut settings = state.settings.lock();
    settings.preferred_input_device = normalized;
    save_settings(&state.settings_path, &settings).map_err(|e| e.to_string())
}

/// Run one intent. Errors are reported, never fatal to the script.
pub async fn dispatch(state: &AppState, intent: &Intent) -> Result<(), String> {
    match intent {
        Intent::StartCall => start_call(state).await.map(drop),
        Intent::EndCall => end_call(state).await.map(drop),
        Intent::ToggleMic => toggle_mic(state).await.map(drop),
        Intent::ToggleVideo => toggle_video(state).await.map(drop),
        Intent::Wait(duration) => {
            tokio::time::sleep(*duration).await;
            Ok(())
        }
        Intent::Status => {
            emit_line(&get_status(state));
            Ok(())
        }
        Intent::WidgetMessage(text) => {
            let kind = widget_message(text);
            info!(?kind, "inbound widget message");
            Ok(())
        }
    }
}
